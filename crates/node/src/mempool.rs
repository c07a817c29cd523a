//! The transaction pool.

use std::collections::BTreeMap;
use stoa_types::app::{Hash, Transaction};

/// Pending transactions, deduplicated by hash. Iteration order is hash order,
/// so every node proposes the same set in the same shape.
#[derive(Debug, Default)]
pub struct Mempool {
    txs: BTreeMap<Hash, Transaction>,
}

impl Mempool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a transaction. Returns false for duplicates.
    pub fn insert(&mut self, tx: Transaction) -> bool {
        self.txs.insert(tx.hash(), tx).is_none()
    }

    /// Number of pending transactions.
    pub fn len(&self) -> usize {
        self.txs.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// The pending transactions in hash order.
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.txs.values().cloned().collect()
    }

    /// Drops every transaction included in a committed block.
    pub fn prune<'a>(&mut self, included: impl IntoIterator<Item = &'a Transaction>) {
        for tx in included {
            self.txs.remove(&tx.hash());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoa_types::app::{Amount, PublicKey, TxOutput, TxType};

    fn tx(n: u8) -> Transaction {
        Transaction {
            tx_type: TxType::Payment,
            inputs: vec![],
            outputs: vec![TxOutput {
                amount: Amount(n as u64),
                address: PublicKey([n; 32]),
            }],
        }
    }

    #[test]
    fn deduplicates_and_prunes() {
        let mut pool = Mempool::new();
        assert!(pool.insert(tx(1)));
        assert!(!pool.insert(tx(1)));
        assert!(pool.insert(tx(2)));
        assert_eq!(pool.len(), 2);

        pool.prune(&[tx(1)]);
        assert_eq!(pool.snapshot(), vec![tx(2)]);
    }
}
