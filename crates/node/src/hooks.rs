//! The driver-facing host hooks and the shared chain state behind them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use stoa_api::consensus::{DriverHooks, TimerClass, ValueValidity};
use stoa_crypto::Pair;
use stoa_ledger::Ledger;
use stoa_types::app::{
    ConsensusValue, Hash, QuorumSet, ScpEnvelope, ScpStatement, Signature, Value,
};
use stoa_types::codec;
use stoa_types::config::ConsensusParams;
use stoa_validator::{EnrollmentManager, PreimageTracker};
use tracing::warn;

use crate::mempool::Mempool;
use crate::node::{NodeMessage, Outbound};

/// Locks a mutex, recovering the guard when a previous holder panicked in a
/// test; the state itself is only ever mutated on the node's single loop.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A timer the host shell must realize: deliver `message` after `delay`.
#[derive(Debug, Clone)]
pub struct ScheduledTimer {
    /// The message to feed back into the node.
    pub message: NodeMessage,
    /// How long to wait first.
    pub delay: Duration,
}

/// Everything the chain knows, guarded by one mutex and touched only from
/// the node's message loop (and, read-only, from the driver's hooks).
pub struct ChainState {
    /// Committed chain and UTXO set.
    pub ledger: Ledger,
    /// Enrollment registry.
    pub enrollments: EnrollmentManager,
    /// Revealed pre-images.
    pub tracker: PreimageTracker,
    /// Pending transactions.
    pub mempool: Mempool,
    /// Known quorum sets by hash, own and peers'.
    pub quorum_sets: HashMap<Hash, QuorumSet>,
    /// Consensus tunables.
    pub params: ConsensusParams,
}

impl ChainState {
    /// Judges an opaque nominated value: decodes it and defers to the ledger.
    pub fn validate_raw_value(&self, raw: &[u8]) -> ValueValidity {
        let Ok(value) = codec::from_bytes_canonical::<ConsensusValue>(raw) else {
            return ValueValidity::Invalid;
        };
        match self.ledger.validate_value(&value, &self.enrollments) {
            None => ValueValidity::FullyValid,
            Some(reason) => {
                warn!(%reason, "nominated value rejected");
                ValueValidity::Invalid
            }
        }
    }
}

/// State shared between the node loop and the driver hooks.
pub struct NodeShared {
    /// The validator's signing key.
    pub pair: Pair,
    /// Chain state.
    pub state: Mutex<ChainState>,
    /// Internal mailbox: messages the hooks generate for the node loop.
    pub internal: Mutex<VecDeque<NodeMessage>>,
    /// Peer messages produced while handling the current message.
    pub outbox: Mutex<Vec<Outbound>>,
    /// Timers scheduled while handling the current message.
    pub timers: Mutex<Vec<ScheduledTimer>>,
}

/// The [`DriverHooks`] implementation handed to the consensus driver.
pub struct NodeHooks {
    shared: Arc<NodeShared>,
}

impl NodeHooks {
    /// Wraps the shared state.
    pub fn new(shared: Arc<NodeShared>) -> Self {
        Self { shared }
    }
}

impl DriverHooks for NodeHooks {
    fn validate_value(&self, slot: u64, value: &[u8]) -> ValueValidity {
        let state = lock(&self.shared.state);
        // A slot past the next height references state this node has not
        // caught up to; it cannot be judged yet, only parsed.
        if slot > state.ledger.height() + 1 {
            return if codec::from_bytes_canonical::<ConsensusValue>(value).is_ok() {
                ValueValidity::MaybeValid
            } else {
                ValueValidity::Invalid
            };
        }
        state.validate_raw_value(value)
    }

    fn emit_envelope(&self, envelope: &ScpEnvelope) {
        lock(&self.shared.outbox).push(Outbound::Envelope(envelope.clone()));
    }

    fn sign_envelope(&self, statement: &ScpStatement) -> Signature {
        self.shared.pair.sign(&statement.signing_digest())
    }

    fn setup_timer(&self, slot: u64, class: TimerClass, id: u64, delay: Duration) {
        lock(&self.shared.timers).push(ScheduledTimer {
            message: NodeMessage::Timer { slot, class, id },
            delay,
        });
    }

    fn get_quorum_set(&self, hash: &Hash) -> Option<QuorumSet> {
        lock(&self.shared.state).quorum_sets.get(hash).cloned()
    }

    fn value_externalized(&self, slot: u64, value: &[u8]) {
        lock(&self.shared.internal).push_back(NodeMessage::Externalized {
            slot,
            value: Value::from(value),
        });
    }
}
