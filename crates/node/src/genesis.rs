//! Genesis construction shared by the nodes of one network.
//!
//! Genesis is pure data derived from configuration: every node builds the
//! identical block 0, so no signatures or consensus are involved.

use stoa_types::app::{
    utxo_key, Amount, Block, Enrollment, Hash, PublicKey, Transaction, TxOutput, TxType,
};

/// What block 0 contains: founding stakes, their enrollments, and initial
/// spendable outputs.
#[derive(Debug, Clone, Default)]
pub struct GenesisSpec {
    /// One freeze output per founding validator.
    pub stakes: Vec<(PublicKey, Amount)>,
    /// The founders' enrollments over those freeze outputs.
    pub enrollments: Vec<Enrollment>,
    /// Initial spendable outputs.
    pub funding: Vec<(PublicKey, Amount)>,
}

impl GenesisSpec {
    /// The canonical freeze transaction for a founding stake.
    pub fn freeze_tx(address: PublicKey, amount: Amount) -> Transaction {
        Transaction {
            tx_type: TxType::Freeze,
            inputs: vec![],
            outputs: vec![TxOutput { amount, address }],
        }
    }

    /// The UTXO key a founding stake will have, needed to sign its
    /// enrollment before the block exists.
    pub fn stake_utxo_key(address: PublicKey, amount: Amount) -> Hash {
        utxo_key(&Self::freeze_tx(address, amount).hash(), 0)
    }

    /// Assembles block 0.
    pub fn build(&self) -> Block {
        let mut txs: Vec<Transaction> = self
            .stakes
            .iter()
            .map(|&(address, amount)| Self::freeze_tx(address, amount))
            .collect();
        if !self.funding.is_empty() {
            txs.push(Transaction {
                tx_type: TxType::Payment,
                inputs: vec![],
                outputs: self
                    .funding
                    .iter()
                    .map(|&(address, amount)| TxOutput { amount, address })
                    .collect(),
            });
        }
        Block::genesis(self.enrollments.clone(), txs)
    }
}
