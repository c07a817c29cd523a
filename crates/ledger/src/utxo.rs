//! The unspent-transaction-output set.

use std::collections::HashMap;
use stoa_api::ledger::UtxoFinder;
use stoa_types::app::{utxo_key, Hash, Transaction, UtxoValue};

/// All currently unspent outputs, keyed by [`utxo_key`].
#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    entries: HashMap<Hash, UtxoValue>,
}

impl UtxoSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unspent outputs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is unspent.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an output.
    pub fn get(&self, key: &Hash) -> Option<&UtxoValue> {
        self.entries.get(key)
    }

    /// Removes and returns an output.
    pub fn take(&mut self, key: &Hash) -> Option<UtxoValue> {
        self.entries.remove(key)
    }

    /// Inserts an output.
    pub fn insert(&mut self, key: Hash, value: UtxoValue) {
        self.entries.insert(key, value);
    }

    /// Consumes a transaction's inputs and inserts its outputs, with new
    /// outputs spendable from `unlock_height`. The caller has already
    /// validated the transaction; unknown inputs are ignored here.
    pub fn apply(&mut self, tx: &Transaction, unlock_height: u64) {
        for input in &tx.inputs {
            self.entries.remove(&input.utxo);
        }
        let tx_hash = tx.hash();
        for (index, output) in tx.outputs.iter().enumerate() {
            self.entries.insert(
                utxo_key(&tx_hash, index as u32),
                UtxoValue {
                    unlock_height,
                    tx_type: tx.tx_type,
                    amount: output.amount,
                    address: output.address,
                },
            );
        }
    }
}

impl UtxoFinder for UtxoSet {
    fn find_utxo(&self, key: &Hash) -> Option<UtxoValue> {
        self.entries.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoa_types::app::{Amount, PublicKey, TxInput, TxOutput, TxType};

    #[test]
    fn apply_spends_inputs_and_creates_outputs() {
        let mut set = UtxoSet::new();
        let coinbase = Transaction {
            tx_type: TxType::Payment,
            inputs: vec![],
            outputs: vec![TxOutput {
                amount: Amount(50),
                address: PublicKey([1; 32]),
            }],
        };
        set.apply(&coinbase, 1);
        let key = utxo_key(&coinbase.hash(), 0);
        assert_eq!(set.find_utxo(&key).unwrap().amount, Amount(50));

        let spend = Transaction {
            tx_type: TxType::Payment,
            inputs: vec![TxInput {
                utxo: key,
                signature: Default::default(),
            }],
            outputs: vec![TxOutput {
                amount: Amount(50),
                address: PublicKey([2; 32]),
            }],
        };
        set.apply(&spend, 2);
        assert!(set.find_utxo(&key).is_none());
        assert_eq!(set.len(), 1);
        let new_key = utxo_key(&spend.hash(), 0);
        assert_eq!(set.get(&new_key).unwrap().unlock_height, 2);
    }
}
