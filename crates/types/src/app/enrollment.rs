//! Validator enrollments and pre-image announcements.

use super::{hash_canonical, Amount, Hash, HashDomain, Signature};
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Number of blocks a single enrollment covers. Every enrollment publishes a
/// hash chain of exactly this length and expires once it is exhausted.
pub const CYCLE_LENGTH: u32 = 1008;

/// Minimum amount a freeze output must carry to back an enrollment.
pub const MIN_FREEZE_STAKE: Amount = Amount(40_000);

/// An immutable record committing a validator to one signing cycle.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Enrollment {
    /// Key of the frozen UTXO that stakes the enrollment.
    pub utxo_key: Hash,
    /// Terminal element of the validator's pre-image hash chain.
    pub random_seed: Hash,
    /// Length of the chain; fixed at [`CYCLE_LENGTH`] on this network.
    pub cycle_length: u32,
    /// Schnorr signature by the staked UTXO's owner over the other fields.
    pub enroll_sig: Signature,
}

impl Enrollment {
    /// The digest covered by `enroll_sig`: everything but the signature.
    pub fn signing_digest(&self) -> Hash {
        hash_canonical(
            HashDomain::Enrollment,
            &(&self.utxo_key, &self.random_seed, self.cycle_length),
        )
    }
}

/// A revealed element of an enrollment's pre-image chain, gossiped between
/// validators so that peers can verify collective signatures.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct PreimageInfo {
    /// `utxo_key` of the enrollment the pre-image belongs to.
    pub enroll_key: Hash,
    /// The revealed chain element.
    pub hash: Hash,
    /// Block height the element corresponds to.
    pub height: u64,
}
