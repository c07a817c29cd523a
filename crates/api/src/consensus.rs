//! Defines the capability surface the consensus driver requires from its host.

use std::time::Duration;
use stoa_types::app::{Hash, QuorumSet, ScpEnvelope, ScpStatement, Signature, Value};

/// The verdict of value validation during nomination and balloting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueValidity {
    /// The value is valid and could be externalized as-is.
    FullyValid,
    /// The value cannot be fully judged yet (e.g. it references state the
    /// node has not caught up to) but is not provably wrong.
    MaybeValid,
    /// The value is invalid and must not be voted for.
    Invalid,
}

/// The two timer classes a slot runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, std::hash::Hash)]
pub enum TimerClass {
    /// Re-nominates or escalates out of a stalled nomination round.
    Nomination,
    /// Bumps the ballot counter to force progress.
    Ballot,
}

/// Everything the driver needs from its environment, passed in at
/// construction. The node assembly provides the single implementation;
/// tests substitute lighter ones.
pub trait DriverHooks: Send + Sync {
    /// Judges a value proposed for `slot`.
    fn validate_value(&self, slot: u64, value: &[u8]) -> ValueValidity;

    /// Combines the accepted candidates of a nomination round into the value
    /// to ballot on. Must be a pure function of its inputs.
    ///
    /// The default picks the first candidate, in the caller-provided order,
    /// that validates. Callers pass candidates ordered by hash, so the choice
    /// is deterministic across peers holding the same candidate set.
    fn combine_candidates(&self, slot: u64, candidates: &[Value]) -> Option<Value> {
        candidates
            .iter()
            .find(|v| self.validate_value(slot, v) != ValueValidity::Invalid)
            .cloned()
    }

    /// Broadcasts an envelope to peers.
    fn emit_envelope(&self, envelope: &ScpEnvelope);

    /// Signs a statement with the node's consensus key.
    fn sign_envelope(&self, statement: &ScpStatement) -> Signature;

    /// Schedules a timer callback. When `delay` elapses the host must feed
    /// `(slot, class, id)` back into the driver, which discards stale ids.
    fn setup_timer(&self, slot: u64, class: TimerClass, id: u64, delay: Duration);

    /// Resolves a quorum-set hash, consulting the local cache first and peers
    /// second. `None` means unknown for now.
    fn get_quorum_set(&self, hash: &Hash) -> Option<QuorumSet>;

    /// Fired exactly once per slot when a value is externalized.
    fn value_externalized(&self, slot: u64, value: &[u8]);
}
