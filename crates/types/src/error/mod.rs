//! Core error types for the stoa kernel.

use crate::app::Hash;
use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors produced by the canonical codec.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// Decoding failed: malformed input or trailing bytes.
    #[error("Canonical decode failed: {0}")]
    Decode(String),
    /// Encoding failed.
    #[error("Canonical encode failed: {0}")]
    Encode(String),
}

impl ErrorCode for SerializationError {
    fn code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "CODEC_DECODE_FAILED",
            Self::Encode(_) => "CODEC_ENCODE_FAILED",
        }
    }
}

/// Errors from signature and hash operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A public key could not be parsed or decompressed.
    #[error("Invalid public key: {0}")]
    InvalidKey(String),
    /// A scalar was not in canonical form.
    #[error("Invalid scalar encoding")]
    InvalidScalar,
    /// A signature failed verification.
    #[error("Signature verification failed")]
    InvalidSignature,
    /// A revealed pre-image does not link into the published hash chain.
    #[error("Pre-image does not connect to the hash chain: {0}")]
    HashChain(String),
}

impl ErrorCode for CryptoError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidKey(_) => "CRYPTO_INVALID_KEY",
            Self::InvalidScalar => "CRYPTO_INVALID_SCALAR",
            Self::InvalidSignature => "CRYPTO_INVALID_SIGNATURE",
            Self::HashChain(_) => "CRYPTO_HASH_CHAIN",
        }
    }
}

/// Errors from the persistent key-value store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested key was not found.
    #[error("Key not found in store")]
    KeyNotFound,
    /// An I/O error occurred in the storage backend.
    #[error("Storage I/O error: {0}")]
    Io(String),
    /// An error occurred in the storage backend.
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// A stored value failed to decode.
    #[error("Stored value failed to decode: {0}")]
    Decode(#[from] SerializationError),
}

impl ErrorCode for StorageError {
    fn code(&self) -> &'static str {
        match self {
            Self::KeyNotFound => "STORAGE_KEY_NOT_FOUND",
            Self::Io(_) => "STORAGE_IO",
            Self::Backend(_) => "STORAGE_BACKEND",
            Self::Decode(_) => "STORAGE_DECODE",
        }
    }
}

/// Errors from enrollment validation and registry maintenance.
#[derive(Debug, Error)]
pub enum EnrollmentError {
    /// The enrollment signature does not verify against the UTXO owner's key.
    #[error("Enrollment signature is invalid")]
    InvalidSignature,
    /// The referenced UTXO does not exist.
    #[error("Enrollment references unknown UTXO {0}")]
    UtxoNotFound(Hash),
    /// The referenced UTXO is not a frozen output.
    #[error("Enrollment UTXO {0} is not a frozen output")]
    NotFrozen(Hash),
    /// The frozen amount is below the minimum stake.
    #[error("Frozen amount {got} is below the minimum stake {min}")]
    InsufficientStake {
        /// The amount actually frozen.
        got: u64,
        /// The required minimum.
        min: u64,
    },
    /// An enrollment with the same UTXO key already exists.
    #[error("Duplicate enrollment for UTXO {0}")]
    Duplicate(Hash),
    /// The enrolled height for this key has already been recorded.
    #[error("Enrolled height already set for UTXO {0}")]
    HeightAlreadySet(Hash),
    /// The registry's backing store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ErrorCode for EnrollmentError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "ENROLL_INVALID_SIGNATURE",
            Self::UtxoNotFound(_) => "ENROLL_UTXO_NOT_FOUND",
            Self::NotFrozen(_) => "ENROLL_UTXO_NOT_FROZEN",
            Self::InsufficientStake { .. } => "ENROLL_INSUFFICIENT_STAKE",
            Self::Duplicate(_) => "ENROLL_DUPLICATE",
            Self::HeightAlreadySet(_) => "ENROLL_HEIGHT_ALREADY_SET",
            Self::Storage(_) => "ENROLL_STORAGE",
        }
    }
}

/// Errors from collective block-signature verification. The display strings
/// are part of the node's peer-visible behavior and must stay stable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockSigError {
    /// A set bit in the header's bitfield references an unenrolled validator.
    #[error("Validator is not enrolled")]
    NotEnrolled,
    /// The signer has revealed no pre-images at all.
    #[error("Validator has not revealed any preimages")]
    NoPreimages,
    /// The signer has revealed pre-images, but not the one for this height.
    #[error("Validator has not revealed the preimage for this block height")]
    MissingPreimage,
    /// The header's `R` is not the sum of the participants' expected nonces.
    #[error("Signature.R does not match expected R")]
    NonceMismatch,
    /// The signature equation fails for the declared participant set.
    #[error("Signature is invalid")]
    InvalidSignature,
}

impl ErrorCode for BlockSigError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotEnrolled => "BLOCKSIG_NOT_ENROLLED",
            Self::NoPreimages => "BLOCKSIG_NO_PREIMAGES",
            Self::MissingPreimage => "BLOCKSIG_MISSING_PREIMAGE",
            Self::NonceMismatch => "BLOCKSIG_NONCE_MISMATCH",
            Self::InvalidSignature => "BLOCKSIG_INVALID_SIGNATURE",
        }
    }
}

/// Errors from quorum construction and verification.
#[derive(Debug, Error)]
pub enum QuorumError {
    /// A quorum configuration failed its structural sanity check.
    #[error("Quorum sanity check failed: {0}")]
    Sanity(String),
    /// Two validators' quorums are disjoint.
    #[error("Quorum intersection check failed: {0}")]
    Intersection(String),
    /// A referenced quorum set is not known locally.
    #[error("Unknown quorum set {0}")]
    UnknownSet(Hash),
}

impl ErrorCode for QuorumError {
    fn code(&self) -> &'static str {
        match self {
            Self::Sanity(_) => "QUORUM_SANITY_FAILED",
            Self::Intersection(_) => "QUORUM_NO_INTERSECTION",
            Self::UnknownSet(_) => "QUORUM_UNKNOWN_SET",
        }
    }
}

/// Errors from the consensus driver.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// A received envelope was malformed or failed signature verification.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),
    /// An envelope referenced a slot the driver does not track.
    #[error("Unknown slot {0}")]
    UnknownSlot(u64),
    /// A nominated or externalized value failed validation.
    #[error("Value validation failed: {0}")]
    ValueValidation(String),
    /// A statement referenced a quorum set that could not be resolved.
    #[error(transparent)]
    Quorum(#[from] QuorumError),
    /// A cryptographic operation failed while handling consensus messages.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl ErrorCode for ConsensusError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidEnvelope(_) => "SCP_INVALID_ENVELOPE",
            Self::UnknownSlot(_) => "SCP_UNKNOWN_SLOT",
            Self::ValueValidation(_) => "SCP_VALUE_VALIDATION",
            Self::Quorum(e) => e.code(),
            Self::Crypto(e) => e.code(),
        }
    }
}

/// Errors from transaction-set validation and block application.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The proposed transaction set is invalid.
    #[error("Invalid transaction set: {0}")]
    InvalidTxSet(String),
    /// The block's height is not the next height.
    #[error("Invalid block height. Expected {expected}, got {got}")]
    InvalidHeight {
        /// The expected block height.
        expected: u64,
        /// The height of the received block.
        got: u64,
    },
    /// The block's `prev_block` does not match the chain tip.
    #[error("Mismatched previous block hash")]
    MismatchedPrevHash,
    /// The header's Merkle root does not match the transactions.
    #[error("Mismatched Merkle root")]
    MismatchedMerkleRoot,
    /// The collective block signature failed verification.
    #[error("Block signature invalid: {0}")]
    InvalidBlockSignature(String),
    /// A generic, unspecified block validation error.
    #[error("Invalid block: {0}")]
    Invalid(String),
    /// An enrollment carried by the block was rejected.
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    /// The block could not be persisted.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ErrorCode for LedgerError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidTxSet(_) => "LEDGER_INVALID_TX_SET",
            Self::InvalidHeight { .. } => "LEDGER_INVALID_HEIGHT",
            Self::MismatchedPrevHash => "LEDGER_MISMATCHED_PREV_HASH",
            Self::MismatchedMerkleRoot => "LEDGER_MISMATCHED_MERKLE_ROOT",
            Self::InvalidBlockSignature(_) => "LEDGER_INVALID_BLOCK_SIGNATURE",
            Self::Invalid(_) => "LEDGER_INVALID_BLOCK",
            Self::Enrollment(e) => e.code(),
            Self::Storage(e) => e.code(),
        }
    }
}

/// Errors from loading and validating node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read configuration: {0}")]
    Io(String),
    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
    /// The configuration is structurally valid but semantically wrong.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ErrorCode for ConfigError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "CONFIG_IO",
            Self::Parse(_) => "CONFIG_PARSE",
            Self::Invalid(_) => "CONFIG_INVALID",
        }
    }
}

/// Unrecoverable conditions. Surfacing one of these stops the node.
#[derive(Debug, Error)]
pub enum FatalError {
    /// A value externalized by consensus failed local validation.
    /// The local ledger has diverged from the quorum and cannot continue.
    #[error("Consensus divergence: {0}")]
    Divergence(String),
    /// Persistent state is corrupted or repeatedly unwritable.
    #[error("Corrupted or unwritable persistent state: {0}")]
    CorruptState(String),
}

impl ErrorCode for FatalError {
    fn code(&self) -> &'static str {
        match self {
            Self::Divergence(_) => "FATAL_DIVERGENCE",
            Self::CorruptState(_) => "FATAL_CORRUPT_STATE",
        }
    }
}
