//! Transactions and unspent transaction outputs.

use super::{hash_canonical, Amount, Hash, HashDomain, PublicKey, Signature};
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// The kind of a transaction, which decides how its outputs may be spent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize,
)]
pub enum TxType {
    /// An ordinary transfer; outputs are spendable immediately.
    Payment,
    /// A stake freeze; outputs back validator enrollments and stay locked
    /// while the enrollment is active.
    Freeze,
}

/// A reference to a prior output, together with the spender's authorization.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct TxInput {
    /// Key of the output being consumed; see [`utxo_key`].
    pub utxo: Hash,
    /// Schnorr signature by the output's owner over the spending
    /// transaction's hash.
    pub signature: Signature,
}

/// A newly created output.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount carried by the output.
    pub amount: Amount,
    /// Public key of the owner entitled to spend it.
    pub address: PublicKey,
}

/// A payment or freeze record with ordered inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Transaction {
    /// Payment or freeze.
    pub tx_type: TxType,
    /// Outputs consumed, in order.
    pub inputs: Vec<TxInput>,
    /// Outputs created, in order.
    pub outputs: Vec<TxOutput>,
}

/// The content of a transaction that its hash (and therefore every input
/// signature) covers. Input signatures are excluded so that signing does not
/// change the digest being signed.
#[derive(Encode)]
struct TxSigningContent<'a> {
    tx_type: &'a TxType,
    input_keys: Vec<&'a Hash>,
    outputs: &'a Vec<TxOutput>,
}

impl Transaction {
    /// Canonical hash of the transaction. Stable across peers and unaffected
    /// by the input signatures.
    pub fn hash(&self) -> Hash {
        hash_canonical(
            HashDomain::Transaction,
            &TxSigningContent {
                tx_type: &self.tx_type,
                input_keys: self.inputs.iter().map(|i| &i.utxo).collect(),
                outputs: &self.outputs,
            },
        )
    }

    /// Sum of all output amounts, or `None` on overflow.
    pub fn output_total(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .try_fold(Amount::ZERO, |acc, o| acc.checked_add(o.amount))
    }
}

/// Derives the key under which an output is tracked in the UTXO set.
pub fn utxo_key(tx_hash: &Hash, output_index: u32) -> Hash {
    hash_canonical(HashDomain::Utxo, &(tx_hash, output_index))
}

/// The spendable state of a single unspent output.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct UtxoValue {
    /// First block height at which the output may be consumed.
    pub unlock_height: u64,
    /// Type of the transaction that created the output.
    pub tx_type: TxType,
    /// Amount carried.
    pub amount: Amount,
    /// Owner.
    pub address: PublicKey,
}
