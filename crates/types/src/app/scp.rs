//! Federated-consensus statements, envelopes, ballots, and quorum sets.

use super::{hash_canonical, Enrollment, Hash, HashDomain, PublicKey, Signature, Transaction};
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// An opaque nominated value: the canonical bytes of a [`ConsensusValue`].
pub type Value = Vec<u8>;

/// A ballot: a counter paired with a candidate value.
///
/// The derived ordering is lexicographic — counter first, then value bytes —
/// which is the order the ballot protocol's comparisons rely on.
#[derive(
    Debug,
    Clone,
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
pub struct Ballot {
    /// Monotonically increasing attempt counter.
    pub counter: u32,
    /// The value being balloted.
    pub value: Value,
}

impl Ballot {
    /// True when both ballots carry the same value.
    pub fn compatible(&self, other: &Ballot) -> bool {
        self.value == other.value
    }
}

/// Nomination-phase pledges: values voted for and values accepted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct ScpNominate {
    /// Values this node votes to nominate, ascending by hash.
    pub votes: Vec<Value>,
    /// Values this node has accepted as nominated, ascending by hash.
    pub accepted: Vec<Value>,
}

/// Prepare-phase pledges.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ScpPrepare {
    /// The ballot currently being prepared.
    pub ballot: Ballot,
    /// Highest ballot accepted as prepared, if any.
    pub prepared: Option<Ballot>,
    /// Highest accepted-prepared ballot with a value distinct from
    /// `prepared`, if any.
    pub prepared_prime: Option<Ballot>,
    /// Lowest counter of the commit range being voted for (0 when none).
    pub n_c: u32,
    /// Highest counter of a confirmed-prepared ballot (0 when none).
    pub n_h: u32,
}

/// Confirm-phase pledges: the node has accepted a commit.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ScpConfirm {
    /// The current ballot.
    pub ballot: Ballot,
    /// Counter of the highest accepted-prepared ballot.
    pub n_prepared: u32,
    /// Lowest counter of the accepted commit range.
    pub n_commit: u32,
    /// Highest counter of the accepted commit range.
    pub n_h: u32,
}

/// Externalize-phase pledges: the commit is irrevocable.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ScpExternalize {
    /// The committed ballot; its value is the slot's output.
    pub commit: Ballot,
    /// Highest counter of the confirmed commit range.
    pub n_h: u32,
}

/// The pledge carried by a statement, one per protocol phase.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum ScpPledges {
    /// Nomination phase.
    Nominate(ScpNominate),
    /// Ballot prepare phase.
    Prepare(ScpPrepare),
    /// Ballot confirm phase.
    Confirm(ScpConfirm),
    /// Terminal externalize phase.
    Externalize(ScpExternalize),
}

/// A single validator's assertion about one slot.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ScpStatement {
    /// The asserting validator.
    pub node_id: PublicKey,
    /// The slot (block height) the statement concerns.
    pub slot_index: u64,
    /// Hash of the sender's quorum set at the time of the statement.
    pub quorum_set_hash: Hash,
    /// The phase-specific pledge.
    pub pledges: ScpPledges,
}

impl ScpStatement {
    /// The digest the envelope signature covers.
    pub fn signing_digest(&self) -> Hash {
        hash_canonical(HashDomain::Statement, self)
    }
}

/// A signed statement, as broadcast between validators.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ScpEnvelope {
    /// The statement being asserted.
    pub statement: ScpStatement,
    /// Schnorr signature by `statement.node_id` over the statement digest.
    pub signature: Signature,
}

/// A quorum slice definition: agreement of `threshold` members out of
/// `validators` plus `inner_sets` satisfies the slice.
///
/// The builder on this network emits flat sets (no inner sets) with a
/// unanimous threshold; nested sets are still understood when peers present
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct QuorumSet {
    /// How many members must agree.
    pub threshold: u32,
    /// Validator members, ascending by public key.
    pub validators: Vec<PublicKey>,
    /// Nested slices, each counting as one member toward `threshold`.
    pub inner_sets: Vec<QuorumSet>,
}

impl QuorumSet {
    /// Total direct members (validators plus nested sets).
    pub fn member_count(&self) -> usize {
        self.validators.len() + self.inner_sets.len()
    }

    /// Canonical hash, as referenced from statements.
    pub fn hash(&self) -> Hash {
        hash_canonical(HashDomain::QuorumSet, self)
    }

    /// All validator keys reachable from this set, including nested ones.
    pub fn all_validators(&self) -> Vec<PublicKey> {
        let mut keys: Vec<PublicKey> = self.validators.clone();
        for inner in &self.inner_sets {
            keys.extend(inner.all_validators());
        }
        keys.sort();
        keys.dedup();
        keys
    }
}

/// The value a slot agrees on: a transaction set plus the enrollments to be
/// included in the block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode, Serialize, Deserialize)]
pub struct ConsensusValue {
    /// Enrollments to include, ascending by `utxo_key`.
    pub enrollments: Vec<Enrollment>,
    /// Transactions to include, ascending by hash.
    pub tx_set: Vec<Transaction>,
}

impl ConsensusValue {
    /// Canonical hash of the value.
    pub fn hash(&self) -> Hash {
        hash_canonical(HashDomain::Value, self)
    }
}
