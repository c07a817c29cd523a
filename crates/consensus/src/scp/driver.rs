//! The consensus driver: envelope intake, slot ownership, ordered delivery.

use super::slot::{ProtocolContext, Slot, SlotPhase};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use stoa_api::consensus::{DriverHooks, TimerClass};
use stoa_crypto::schnorr;
use stoa_types::app::{Hash, PublicKey, QuorumSet, ScpEnvelope, Value};
use tracing::{debug, info, warn};

/// How far above the current slot an envelope may reach before it is dropped
/// instead of buffered.
const MAX_SLOT_AHEAD: u64 = 1_000;

/// Verdict on a received envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    /// The envelope was accepted (possibly buffered or ignored as stale).
    Valid,
    /// The envelope was malformed and dropped.
    Invalid,
}

/// The federated-agreement driver. Owns one [`Slot`] per height and delivers
/// externalized values to the host strictly in height order, exactly once.
pub struct Scp {
    node_id: PublicKey,
    local_qset: QuorumSet,
    local_qset_hash: Hash,
    hooks: Arc<dyn DriverHooks>,
    slots: BTreeMap<u64, Slot>,
    /// Envelopes waiting for an unknown quorum set, keyed by its hash.
    pending: HashMap<Hash, Vec<ScpEnvelope>>,
    /// The lowest slot whose externalization has not yet been delivered.
    delivered: u64,
    nomination_timeout: Duration,
    ballot_timeout: Duration,
}

impl Scp {
    /// Creates a driver for `node_id` with its current quorum set.
    pub fn new(
        node_id: PublicKey,
        local_qset: QuorumSet,
        hooks: Arc<dyn DriverHooks>,
        nomination_timeout: Duration,
        ballot_timeout: Duration,
    ) -> Scp {
        let local_qset_hash = local_qset.hash();
        Scp {
            node_id,
            local_qset,
            local_qset_hash,
            hooks,
            slots: BTreeMap::new(),
            pending: HashMap::new(),
            delivered: 0,
            nomination_timeout,
            ballot_timeout,
        }
    }

    /// The slot currently being agreed: the lowest non-externalized height.
    pub fn current_slot(&self) -> u64 {
        self.delivered
    }

    /// The phase of `slot_index`, if the driver tracks it.
    pub fn slot_phase(&self, slot_index: u64) -> Option<SlotPhase> {
        self.slots.get(&slot_index).map(Slot::phase)
    }

    /// Installs a new local quorum set after a validator-set rotation.
    pub fn update_local_quorum(&mut self, qset: QuorumSet) {
        info!(hash = %qset.hash(), "local quorum set updated");
        self.local_qset_hash = qset.hash();
        self.local_qset = qset;
    }

    /// Quorum-set hashes the driver is waiting on. The host resolves them
    /// from peers and calls [`Scp::add_quorum_set`] or, on deadline,
    /// [`Scp::drop_pending`].
    pub fn pending_quorum_hashes(&self) -> Vec<Hash> {
        self.pending.keys().copied().collect()
    }

    /// Supplies a previously missing quorum set and replays the envelopes
    /// buffered against it. The host must have made the set resolvable
    /// through its `get_quorum_set` hook first.
    pub fn add_quorum_set(&mut self, qset: &QuorumSet) {
        if let Some(buffered) = self.pending.remove(&qset.hash()) {
            debug!(hash = %qset.hash(), n = buffered.len(), "replaying buffered envelopes");
            for envelope in buffered {
                self.receive_envelope(envelope);
            }
        }
    }

    /// Drops the envelopes buffered against `hash` after a fetch deadline.
    pub fn drop_pending(&mut self, hash: &Hash) {
        if let Some(dropped) = self.pending.remove(hash) {
            warn!(%hash, n = dropped.len(), "quorum-set fetch timed out; dropping envelopes");
        }
    }

    /// Validates an envelope and feeds it to its slot.
    ///
    /// Signature and value checks run before any state mutation. Envelopes
    /// for externalized slots are ignored, envelopes referencing unknown
    /// quorum sets are buffered.
    pub fn receive_envelope(&mut self, envelope: ScpEnvelope) -> EnvelopeState {
        let statement = &envelope.statement;
        let slot_index = statement.slot_index;

        if slot_index < self.delivered {
            return EnvelopeState::Valid;
        }
        if slot_index > self.delivered + MAX_SLOT_AHEAD {
            debug!(slot = slot_index, "envelope too far ahead; dropped");
            return EnvelopeState::Invalid;
        }

        if schnorr::verify(
            &statement.node_id,
            &statement.signing_digest(),
            &envelope.signature,
        )
        .is_err()
        {
            warn!(node = %statement.node_id, slot = slot_index, "envelope signature invalid");
            return EnvelopeState::Invalid;
        }

        if !Slot::statement_value_valid(self.hooks.as_ref(), statement) {
            warn!(node = %statement.node_id, slot = slot_index, "envelope carries invalid value");
            return EnvelopeState::Invalid;
        }

        if self.hooks.get_quorum_set(&statement.quorum_set_hash).is_none() {
            debug!(hash = %statement.quorum_set_hash, "unknown quorum set; buffering envelope");
            self.pending
                .entry(statement.quorum_set_hash)
                .or_default()
                .push(envelope);
            return EnvelopeState::Valid;
        }

        let ctx = ProtocolContext {
            node_id: self.node_id,
            slot_index,
            local_qset: &self.local_qset,
            local_qset_hash: self.local_qset_hash,
            hooks: self.hooks.as_ref(),
            nomination_timeout: self.nomination_timeout,
            ballot_timeout: self.ballot_timeout,
        };
        let slot = self
            .slots
            .entry(slot_index)
            .or_insert_with(|| Slot::new(slot_index));
        slot.process_statement(&ctx, envelope.statement);
        self.deliver_ready();
        EnvelopeState::Valid
    }

    /// Proposes `value` for the current slot. `previous_value` is the value
    /// externalized for the previous slot, kept for proposer bookkeeping.
    /// Returns false when `slot_index` is not the current slot.
    pub fn nominate(&mut self, slot_index: u64, value: Value, _previous_value: &Value) -> bool {
        if slot_index != self.delivered {
            debug!(
                slot = slot_index,
                current = self.delivered,
                "nomination refused for non-current slot"
            );
            return false;
        }
        let ctx = ProtocolContext {
            node_id: self.node_id,
            slot_index,
            local_qset: &self.local_qset,
            local_qset_hash: self.local_qset_hash,
            hooks: self.hooks.as_ref(),
            nomination_timeout: self.nomination_timeout,
            ballot_timeout: self.ballot_timeout,
        };
        let slot = self
            .slots
            .entry(slot_index)
            .or_insert_with(|| Slot::new(slot_index));
        slot.nominate(&ctx, value);
        self.deliver_ready();
        true
    }

    /// Dispatches a fired timer to its slot. Stale ids no-op.
    pub fn fire_timer(&mut self, slot_index: u64, class: TimerClass, id: u64) {
        let ctx = ProtocolContext {
            node_id: self.node_id,
            slot_index,
            local_qset: &self.local_qset,
            local_qset_hash: self.local_qset_hash,
            hooks: self.hooks.as_ref(),
            nomination_timeout: self.nomination_timeout,
            ballot_timeout: self.ballot_timeout,
        };
        if let Some(slot) = self.slots.get_mut(&slot_index) {
            slot.handle_timer(&ctx, class, id);
        }
        self.deliver_ready();
    }

    /// Marks `slot_index` externalized with `value` without running the
    /// protocol, as when replaying committed blocks at startup or after a
    /// block sync. Replayed slots do not fire the externalization callback;
    /// their blocks are already in the ledger.
    pub fn restore_externalized(&mut self, slot_index: u64, value: Value) {
        let slot = self
            .slots
            .entry(slot_index)
            .or_insert_with(|| Slot::new(slot_index));
        slot.restore_externalized(value);
        self.deliver_ready();
    }

    /// The externalized value of `slot_index`, if that slot is finished.
    pub fn externalized_value(&self, slot_index: u64) -> Option<&Value> {
        self.slots.get(&slot_index).and_then(Slot::externalized)
    }

    /// Fires `value_externalized` for every finished slot at the delivery
    /// cursor, in strict height order.
    fn deliver_ready(&mut self) {
        while let Some(slot) = self.slots.get(&self.delivered) {
            let Some(value) = slot.externalized() else {
                break;
            };
            if !slot.replayed() {
                self.hooks.value_externalized(self.delivered, value);
            }
            self.delivered += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use stoa_api::consensus::ValueValidity;
    use stoa_crypto::Pair;
    use stoa_types::app::{ScpStatement, Signature};

    /// Host environment for one simulated node.
    struct TestHooks {
        pair: Pair,
        qsets: Mutex<HashMap<Hash, QuorumSet>>,
        outbox: Mutex<Vec<ScpEnvelope>>,
        externalized: Mutex<Vec<(u64, Value)>>,
        timers: Mutex<Vec<(u64, TimerClass, u64)>>,
        invalid_values: Vec<Value>,
    }

    impl TestHooks {
        fn new(pair: Pair, qset: &QuorumSet) -> Self {
            let mut qsets = HashMap::new();
            qsets.insert(qset.hash(), qset.clone());
            Self {
                pair,
                qsets: Mutex::new(qsets),
                outbox: Mutex::new(Vec::new()),
                externalized: Mutex::new(Vec::new()),
                timers: Mutex::new(Vec::new()),
                invalid_values: Vec::new(),
            }
        }
    }

    impl DriverHooks for TestHooks {
        fn validate_value(&self, _slot: u64, value: &[u8]) -> ValueValidity {
            if self.invalid_values.iter().any(|v| v == value) {
                ValueValidity::Invalid
            } else {
                ValueValidity::FullyValid
            }
        }

        fn emit_envelope(&self, envelope: &ScpEnvelope) {
            self.outbox.lock().unwrap().push(envelope.clone());
        }

        fn sign_envelope(&self, statement: &ScpStatement) -> Signature {
            self.pair.sign(&statement.signing_digest())
        }

        fn setup_timer(&self, slot: u64, class: TimerClass, id: u64, _delay: Duration) {
            self.timers.lock().unwrap().push((slot, class, id));
        }

        fn get_quorum_set(&self, hash: &Hash) -> Option<QuorumSet> {
            self.qsets.lock().unwrap().get(hash).cloned()
        }

        fn value_externalized(&self, slot: u64, value: &[u8]) {
            self.externalized.lock().unwrap().push((slot, value.to_vec()));
        }
    }

    struct Cluster {
        drivers: Vec<Scp>,
        hooks: Vec<Arc<TestHooks>>,
    }

    impl Cluster {
        /// `threshold` of `n` equally trusted validators sharing one flat
        /// quorum set.
        fn new(n: usize, threshold: u32) -> Cluster {
            let pairs: Vec<Pair> = (0..n).map(|_| Pair::random()).collect();
            let mut keys: Vec<PublicKey> = pairs.iter().map(Pair::public).collect();
            keys.sort();
            let qset = QuorumSet {
                threshold,
                validators: keys,
                inner_sets: vec![],
            };
            let mut drivers = Vec::new();
            let mut hooks = Vec::new();
            for pair in pairs {
                let h = Arc::new(TestHooks::new(pair, &qset));
                let mut driver = Scp::new(
                    h.pair.public(),
                    qset.clone(),
                    h.clone(),
                    Duration::from_millis(100),
                    Duration::from_millis(100),
                );
                // Slot 0 is genesis; agreement starts at slot 1.
                driver.restore_externalized(0, b"genesis".to_vec());
                drivers.push(driver);
                hooks.push(h);
            }
            Cluster { drivers, hooks }
        }

        /// Delivers every outstanding envelope until the network is quiet.
        /// `mute` nodes neither send nor receive.
        fn pump(&mut self, mute: &[usize]) {
            loop {
                let mut progress = false;
                for i in 0..self.drivers.len() {
                    if mute.contains(&i) {
                        self.hooks[i].outbox.lock().unwrap().clear();
                        continue;
                    }
                    let batch: Vec<ScpEnvelope> =
                        self.hooks[i].outbox.lock().unwrap().drain(..).collect();
                    for envelope in batch {
                        progress = true;
                        for (j, driver) in self.drivers.iter_mut().enumerate() {
                            if j != i && !mute.contains(&j) {
                                driver.receive_envelope(envelope.clone());
                            }
                        }
                    }
                }
                if !progress {
                    break;
                }
            }
        }

        fn externalized(&self, i: usize) -> Vec<(u64, Value)> {
            self.hooks[i].externalized.lock().unwrap().clone()
        }

        /// Pumps messages and, between rounds, fires each node's most recent
        /// timer per class — the cooperative equivalent of timeouts elapsing.
        /// Stops once every live node has externalized `slot` or after
        /// `max_rounds`.
        fn run(&mut self, mute: &[usize], slot: u64, max_rounds: usize) {
            for _ in 0..max_rounds {
                self.pump(mute);
                let done = (0..self.drivers.len())
                    .filter(|i| !mute.contains(i))
                    .all(|i| self.externalized(i).iter().any(|(s, _)| *s == slot));
                if done {
                    return;
                }
                for i in 0..self.drivers.len() {
                    if mute.contains(&i) {
                        continue;
                    }
                    let scheduled: Vec<(u64, TimerClass, u64)> =
                        self.hooks[i].timers.lock().unwrap().drain(..).collect();
                    let mut latest: HashMap<(u64, TimerClass), u64> = HashMap::new();
                    for (s, class, id) in scheduled {
                        let entry = latest.entry((s, class)).or_insert(id);
                        *entry = (*entry).max(id);
                    }
                    for ((s, class), id) in latest {
                        self.drivers[i].fire_timer(s, class, id);
                    }
                }
            }
            self.pump(mute);
        }
    }

    #[test]
    fn three_node_unanimous_round_externalizes() {
        let mut cluster = Cluster::new(3, 3);
        let value = b"tx-set-1".to_vec();
        assert!(cluster.drivers[0].nominate(1, value.clone(), &b"genesis".to_vec()));
        cluster.pump(&[]);

        for i in 0..3 {
            assert_eq!(cluster.externalized(i), vec![(1, value.clone())]);
            assert_eq!(cluster.drivers[i].current_slot(), 2);
            assert_eq!(
                cluster.drivers[i].slot_phase(1),
                Some(SlotPhase::Externalized)
            );
        }
    }

    #[test]
    fn three_of_four_quorum_survives_one_silent_node() {
        let mut cluster = Cluster::new(4, 3);
        let value = b"tx-set-2".to_vec();
        cluster.drivers[0].nominate(1, value.clone(), &b"genesis".to_vec());
        cluster.run(&[3], 1, 10);

        for i in 0..3 {
            assert_eq!(cluster.externalized(i), vec![(1, value.clone())]);
        }
        assert!(cluster.externalized(3).is_empty());
    }

    #[test]
    fn unanimous_quorum_stalls_on_one_silent_node() {
        let mut cluster = Cluster::new(4, 4);
        cluster.drivers[0].nominate(1, b"tx-set-3".to_vec(), &b"genesis".to_vec());
        cluster.run(&[3], 1, 5);

        for i in 0..4 {
            assert!(cluster.externalized(i).is_empty());
            assert_eq!(cluster.drivers[i].current_slot(), 1);
        }
    }

    #[test]
    fn competing_nominations_converge_on_one_value() {
        let mut cluster = Cluster::new(3, 3);
        cluster.drivers[0].nominate(1, b"value-a".to_vec(), &b"genesis".to_vec());
        cluster.drivers[1].nominate(1, b"value-b".to_vec(), &b"genesis".to_vec());
        cluster.run(&[], 1, 10);

        let first = cluster.externalized(0);
        assert_eq!(first.len(), 1);
        for i in 1..3 {
            assert_eq!(cluster.externalized(i), first);
        }
    }

    #[test]
    fn bad_signature_is_rejected_before_state_changes() {
        let mut cluster = Cluster::new(3, 3);
        cluster.drivers[0].nominate(1, b"tx".to_vec(), &b"genesis".to_vec());
        let mut envelope = cluster.hooks[0].outbox.lock().unwrap()[0].clone();
        envelope.signature.s = [0xAA; 32];
        assert_eq!(
            cluster.drivers[1].receive_envelope(envelope),
            EnvelopeState::Invalid
        );
        assert!(cluster.hooks[1].outbox.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_quorum_set_buffers_until_supplied() {
        let mut cluster = Cluster::new(3, 3);
        cluster.drivers[0].nominate(1, b"tx".to_vec(), &b"genesis".to_vec());
        let envelope = cluster.hooks[0].outbox.lock().unwrap()[0].clone();

        // Receiver 1 forgets the shared quorum set.
        let qset_hash = envelope.statement.quorum_set_hash;
        let qset = cluster.hooks[1]
            .qsets
            .lock()
            .unwrap()
            .remove(&qset_hash)
            .unwrap();

        assert_eq!(
            cluster.drivers[1].receive_envelope(envelope),
            EnvelopeState::Valid
        );
        assert_eq!(cluster.drivers[1].pending_quorum_hashes(), vec![qset_hash]);

        // Once the fetch completes, the buffered envelope is replayed and the
        // node echoes the nomination.
        cluster.hooks[1]
            .qsets
            .lock()
            .unwrap()
            .insert(qset_hash, qset.clone());
        cluster.drivers[1].add_quorum_set(&qset);
        assert!(cluster.drivers[1].pending_quorum_hashes().is_empty());
        assert!(!cluster.hooks[1].outbox.lock().unwrap().is_empty());
    }

    #[test]
    fn fetch_deadline_drops_buffered_envelopes() {
        let mut cluster = Cluster::new(3, 3);
        cluster.drivers[0].nominate(1, b"tx".to_vec(), &b"genesis".to_vec());
        let envelope = cluster.hooks[0].outbox.lock().unwrap()[0].clone();
        let qset_hash = envelope.statement.quorum_set_hash;
        cluster.hooks[1].qsets.lock().unwrap().remove(&qset_hash);

        cluster.drivers[1].receive_envelope(envelope);
        cluster.drivers[1].drop_pending(&qset_hash);
        assert!(cluster.drivers[1].pending_quorum_hashes().is_empty());
    }

    #[test]
    fn nomination_refused_for_non_current_slot() {
        let mut cluster = Cluster::new(3, 3);
        assert!(!cluster.drivers[0].nominate(5, b"tx".to_vec(), &b"genesis".to_vec()));
        assert!(cluster.drivers[0].nominate(1, b"tx".to_vec(), &b"genesis".to_vec()));
    }

    #[test]
    fn replayed_slots_skip_the_callback_and_advance_the_cursor() {
        let cluster = Cluster::new(1, 1);
        assert!(cluster.externalized(0).is_empty());
        assert_eq!(cluster.drivers[0].current_slot(), 1);
        assert_eq!(
            cluster.drivers[0].externalized_value(0),
            Some(&b"genesis".to_vec())
        );
    }

    #[test]
    fn single_node_network_externalizes_alone() {
        let mut cluster = Cluster::new(1, 1);
        let value = b"solo".to_vec();
        cluster.drivers[0].nominate(1, value.clone(), &b"genesis".to_vec());
        cluster.pump(&[]);
        assert_eq!(cluster.externalized(0), vec![(1, value)]);
    }

    #[test]
    fn ballot_timeout_bumps_the_counter_and_still_converges() {
        let mut cluster = Cluster::new(3, 3);
        let value = b"slow".to_vec();
        cluster.drivers[0].nominate(1, value.clone(), &b"genesis".to_vec());

        // Let the round finish, then fire node 0's most recent ballot timer;
        // a stale or post-externalization bump must not disturb the slot.
        cluster.pump(&[]);
        let fired: Vec<(u64, TimerClass, u64)> =
            cluster.hooks[0].timers.lock().unwrap().clone();
        for (slot, class, id) in fired {
            cluster.drivers[0].fire_timer(slot, class, id);
        }
        cluster.pump(&[]);

        assert_eq!(cluster.externalized(0), vec![(1, value.clone())]);
        assert_eq!(cluster.drivers[0].current_slot(), 2);
    }
}
