//! Core application-level data structures: primitives, transactions, blocks,
//! enrollments, and consensus messages.

/// Bit-level participation vectors with a fixed wire layout.
pub mod bitfield;
/// Blocks, headers, and Merkle-root computation.
pub mod block;
/// Validator enrollments and pre-image announcements.
pub mod enrollment;
/// Federated-consensus statements, envelopes, ballots, and quorum sets.
pub mod scp;
/// Transactions and unspent outputs.
pub mod tx;

pub use bitfield::BitField;
pub use block::{merkle_root, Block, BlockHeader, BlockPartialSig};
pub use enrollment::{Enrollment, PreimageInfo, CYCLE_LENGTH, MIN_FREEZE_STAKE};
pub use scp::{
    Ballot, ConsensusValue, QuorumSet, ScpConfirm, ScpEnvelope, ScpExternalize, ScpNominate,
    ScpPledges, ScpPrepare, ScpStatement, Value,
};
pub use tx::{utxo_key, Transaction, TxInput, TxOutput, TxType, UtxoValue};

use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A fixed-size, 32-byte cryptographic hash.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    std::hash::Hash,
    Default,
    Encode,
    Decode,
    Serialize,
    Deserialize,
)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The all-zero hash, used as the previous-block reference of genesis.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Plain SHA-256 of raw bytes. Used for hash-chain steps, where the
    /// chain's wire definition is a bare digest with no domain tag.
    pub fn digest(bytes: &[u8]) -> Hash {
        Hash(Sha256::digest(bytes).into())
    }

    /// Hex representation of the full hash.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Hash, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Hash(arr))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}..)", &self.to_hex()[..8])
    }
}

/// Domain tags prepended to canonical bytes before hashing, so that two
/// structurally identical values of different kinds can never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HashDomain {
    /// Transaction content (signatures excluded).
    Transaction = 0,
    /// A `(tx_hash, output_index)` UTXO key.
    Utxo = 1,
    /// Enrollment content (signature excluded).
    Enrollment = 2,
    /// A consensus statement, as signed by its sender.
    Statement = 3,
    /// A block header.
    Header = 4,
    /// The header content covered by the collective signature.
    HeaderSigning = 5,
    /// A nominated consensus value.
    Value = 6,
    /// A quorum set referenced from statements.
    QuorumSet = 7,
    /// An interior node of a transaction Merkle tree.
    Merkle = 8,
}

/// Hashes a value's canonical encoding under the given domain tag.
pub fn hash_canonical<T: Encode>(domain: HashDomain, v: &T) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([domain as u8]);
    hasher.update(v.encode());
    Hash(hasher.finalize().into())
}

/// An amount of currency units.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Default,
    Encode,
    Decode,
    Serialize,
    Deserialize,
)]
pub struct Amount(pub u64);

impl Amount {
    /// Zero units.
    pub const ZERO: Amount = Amount(0);

    /// Checked addition.
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Checked subtraction.
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validator's public key: a 32-byte compressed ristretto255 point.
///
/// The derived ordering (byte-wise) is the canonical sort order for validator
/// sets, quorum members, and bitfield indices.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    std::hash::Hash,
    Default,
    Encode,
    Decode,
    Serialize,
    Deserialize,
)]
pub struct PublicKey(pub [u8; 32]);

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", &hex::encode(self.0)[..8])
    }
}

/// A Schnorr signature: the public nonce commitment `R` and the scalar `s`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize,
)]
pub struct Signature {
    /// Compressed public nonce point.
    pub r: [u8; 32],
    /// Response scalar.
    pub s: [u8; 32],
}
