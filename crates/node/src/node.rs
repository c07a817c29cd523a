//! Node assembly and the message handler.
//!
//! [`Node::handle`] is the single entry point for everything that happens to
//! a node: peer gossip, internal notifications, and timer callbacks. It is
//! synchronous; the async shell in [`crate::runner`] (or a test harness)
//! feeds it messages and realizes the outbound messages and timers it
//! produces.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use stoa_api::consensus::TimerClass;
use stoa_api::ledger::UtxoFinder;
use stoa_api::storage::KvStore;
use stoa_consensus::Scp;
use stoa_crypto::Pair;
use stoa_ledger::Ledger;
use stoa_types::app::{
    Block, BlockPartialSig, ConsensusValue, Enrollment, Hash, PreimageInfo, PublicKey,
    QuorumSet, ScpEnvelope, Transaction, Value,
};
use stoa_types::codec;
use stoa_types::config::ConsensusParams;
use stoa_types::error::{EnrollmentError, ErrorCode, FatalError, LedgerError};
use stoa_validator::quorum::NodeStake;
use stoa_validator::signer;
use stoa_validator::{EnrollmentManager, PreimageTracker, QuorumBuilder};
use tracing::{debug, error, info, warn};

use crate::hooks::{lock, ChainState, NodeHooks, NodeShared, ScheduledTimer};
use crate::mempool::Mempool;

/// Most blocks served per catch-up request.
const SYNC_BATCH: u64 = 64;

/// Everything a node reacts to.
#[derive(Debug, Clone)]
pub enum NodeMessage {
    /// A consensus envelope from a peer.
    Envelope(ScpEnvelope),
    /// A transaction submitted by a client or peer.
    Tx(Transaction),
    /// An enrollment registered by a peer or operator.
    Enrollment(Enrollment),
    /// A revealed pre-image from a peer.
    Preimage(PreimageInfo),
    /// A partial block signature from a peer.
    Partial(BlockPartialSig),
    /// A peer asks for a quorum set it saw referenced.
    QuorumQuery(Hash),
    /// A peer answers a quorum-set query.
    QuorumReply(QuorumSet),
    /// A consensus timer fired.
    Timer {
        /// Slot the timer belongs to.
        slot: u64,
        /// Timer class.
        class: TimerClass,
        /// Timer id, checked against the slot's watermark.
        id: u64,
    },
    /// The grace period for collecting reveals and partials ran out.
    SignTimeout {
        /// Height of the block being sealed.
        height: u64,
    },
    /// The deadline for fetching a referenced quorum set ran out.
    QuorumFetchTimeout {
        /// Hash of the set that never arrived.
        hash: Hash,
    },
    /// A peer asks for committed blocks starting at a height.
    BlockRequest {
        /// First height wanted.
        start: u64,
    },
    /// A peer delivers committed blocks for catch-up.
    Blocks(Vec<Block>),
    /// A slot externalized a value (internal, produced by the driver).
    Externalized {
        /// The slot.
        slot: u64,
        /// The canonical value bytes.
        value: Value,
    },
}

/// A message for the peers, produced by [`Node::handle`]. All outbound
/// traffic is broadcast; the transport decides the fan-out.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Gossip a consensus envelope.
    Envelope(ScpEnvelope),
    /// Gossip an enrollment.
    Enrollment(Enrollment),
    /// Gossip a revealed pre-image.
    Preimage(PreimageInfo),
    /// Gossip a partial block signature.
    Partial(BlockPartialSig),
    /// Ask peers for a quorum set.
    QuorumQuery(Hash),
    /// Answer a quorum-set query.
    QuorumReply(QuorumSet),
    /// Ask peers for committed blocks from a height.
    BlockRequest(u64),
    /// Answer a block request.
    Blocks(Vec<Block>),
}

/// A running validator node.
pub struct Node {
    shared: Arc<NodeShared>,
    driver: Scp,
    /// The unsigned block for the height currently being sealed.
    pending: Option<Block>,
    /// Collected partial signatures per height.
    partials: HashMap<u64, BTreeMap<PublicKey, [u8; 32]>>,
    /// The reveal set each height's own partial was computed against.
    signed_with: HashMap<u64, Vec<usize>>,
    /// Quorum-set hashes already queried from peers.
    queried: HashSet<Hash>,
    /// Re-enrollments awaiting inclusion: records that replace an expiring
    /// cycle and therefore cannot enter the registry until the block that
    /// carries them.
    pending_enrollments: Vec<Enrollment>,
    /// The slot this node last proposed for.
    last_nominated: Option<u64>,
    /// Whether a block catch-up request is outstanding.
    syncing: bool,
}

impl Node {
    /// Assembles a node over its persistent store. The store may be fresh
    /// (genesis is installed) or carry an existing chain (it is replayed and
    /// the driver restored to the lowest open slot).
    pub fn new(
        pair: Pair,
        params: ConsensusParams,
        store: Arc<dyn KvStore>,
        genesis: Block,
    ) -> anyhow::Result<Node> {
        let mut enrollments = EnrollmentManager::load(
            store.clone(),
            params.min_freeze_stake,
            params.cycle_length,
        )?;
        let ledger = Ledger::load(store, genesis, &mut enrollments)?;

        let state = ChainState {
            ledger,
            enrollments,
            tracker: PreimageTracker::new(),
            mempool: Mempool::new(),
            quorum_sets: HashMap::new(),
            params: params.clone(),
        };
        let shared = Arc::new(NodeShared {
            pair,
            state: std::sync::Mutex::new(state),
            internal: Default::default(),
            outbox: Default::default(),
            timers: Default::default(),
        });

        let own_key = shared.pair.public();
        let initial_qset = {
            let mut state = lock(&shared.state);
            install_quorums(&mut state, own_key)
                .ok_or_else(|| anyhow::anyhow!("initial quorum configuration rejected"))?
        };

        let hooks = Arc::new(NodeHooks::new(shared.clone()));
        let mut driver = Scp::new(
            own_key,
            initial_qset,
            hooks,
            Duration::from_millis(params.nomination_timeout_ms),
            Duration::from_millis(params.ballot_timeout_ms),
        );

        // Replay the committed chain so the first open slot is current.
        let committed: Vec<(u64, Vec<u8>)> = {
            let state = lock(&shared.state);
            (0..=state.ledger.height())
                .filter_map(|height| {
                    state.ledger.block_at(height).map(|block| {
                        let value = ConsensusValue {
                            enrollments: block.header.enrollments.clone(),
                            tx_set: block.txs.clone(),
                        };
                        (height, codec::to_bytes_canonical(&value))
                    })
                })
                .collect()
        };
        for (height, value) in committed {
            driver.restore_externalized(height, value);
        }
        info!(slot = driver.current_slot(), "node restored");

        Ok(Node {
            shared,
            driver,
            pending: None,
            partials: HashMap::new(),
            signed_with: HashMap::new(),
            queried: HashSet::new(),
            pending_enrollments: Vec::new(),
            last_nominated: None,
            syncing: false,
        })
    }

    /// The node's validator key.
    pub fn public_key(&self) -> PublicKey {
        self.shared.pair.public()
    }

    /// The committed chain height.
    pub fn height(&self) -> u64 {
        lock(&self.shared.state).ledger.height()
    }

    /// The slot currently being agreed.
    pub fn current_slot(&self) -> u64 {
        self.driver.current_slot()
    }

    /// The block at `height`, if committed.
    pub fn block_at(&self, height: u64) -> Option<Block> {
        lock(&self.shared.state).ledger.block_at(height).cloned()
    }

    /// Timers scheduled since the last call. The shell must deliver each
    /// timer's message after its delay.
    pub fn take_timers(&mut self) -> Vec<ScheduledTimer> {
        lock(&self.shared.timers).drain(..).collect()
    }

    /// Handles one message and returns the peer messages it produced.
    ///
    /// A [`FatalError`] means the node must stop: the quorum externalized a
    /// value this node cannot apply.
    pub fn handle(&mut self, message: NodeMessage) -> Result<Vec<Outbound>, FatalError> {
        self.dispatch(message)?;
        // Drain internal notifications (externalizations) the dispatch
        // produced, in order.
        loop {
            let next = lock(&self.shared.internal).pop_front();
            match next {
                Some(message) => self.dispatch(message)?,
                None => break,
            }
        }
        Ok(lock(&self.shared.outbox).drain(..).collect())
    }

    fn dispatch(&mut self, message: NodeMessage) -> Result<(), FatalError> {
        match message {
            NodeMessage::Envelope(envelope) => {
                // A statement for a slot past the next height means the
                // quorum has moved on without us; fetch the gap while the
                // driver buffers the envelope.
                let slot = envelope.statement.slot_index;
                self.driver.receive_envelope(envelope);
                self.request_catchup(slot);
                self.query_missing_quorum_sets();
            }
            NodeMessage::Tx(tx) => self.on_transaction(tx),
            NodeMessage::Enrollment(enrollment) => self.on_enrollment(enrollment)?,
            NodeMessage::Preimage(info) => self.on_preimage(info)?,
            NodeMessage::Partial(partial) => {
                let height = partial.height;
                self.partials
                    .entry(height)
                    .or_default()
                    .insert(partial.signer, partial.partial);
                self.try_seal(height)?;
            }
            NodeMessage::QuorumQuery(hash) => {
                if let Some(qset) = lock(&self.shared.state).quorum_sets.get(&hash).cloned() {
                    lock(&self.shared.outbox).push(Outbound::QuorumReply(qset));
                }
            }
            NodeMessage::QuorumReply(qset) => {
                lock(&self.shared.state)
                    .quorum_sets
                    .insert(qset.hash(), qset.clone());
                self.driver.add_quorum_set(&qset);
            }
            NodeMessage::Timer { slot, class, id } => {
                self.driver.fire_timer(slot, class, id);
            }
            NodeMessage::SignTimeout { height } => {
                if self.pending.as_ref().is_some_and(|b| b.header.height == height) {
                    debug!(height, "sign timeout; proceeding with revealed subset");
                    self.try_sign(height, true);
                    self.try_seal(height)?;
                }
            }
            NodeMessage::QuorumFetchTimeout { hash } => {
                self.driver.drop_pending(&hash);
                self.queried.remove(&hash);
            }
            NodeMessage::BlockRequest { start } => {
                let blocks = lock(&self.shared.state)
                    .ledger
                    .blocks_from(start, SYNC_BATCH);
                if !blocks.is_empty() {
                    lock(&self.shared.outbox).push(Outbound::Blocks(blocks));
                }
            }
            NodeMessage::Blocks(blocks) => self.on_blocks(blocks)?,
            NodeMessage::Externalized { slot, value } => {
                self.on_externalized(slot, value)?;
            }
        }
        Ok(())
    }

    /// Buffered envelopes reference quorum sets we do not know; ask peers
    /// and arm the fetch deadline.
    fn query_missing_quorum_sets(&mut self) {
        let deadline = {
            let state = lock(&self.shared.state);
            Duration::from_millis(state.params.quorum_fetch_timeout_ms)
        };
        for hash in self.driver.pending_quorum_hashes() {
            if self.queried.insert(hash) {
                debug!(%hash, "querying peers for quorum set");
                lock(&self.shared.outbox).push(Outbound::QuorumQuery(hash));
                lock(&self.shared.timers).push(ScheduledTimer {
                    message: NodeMessage::QuorumFetchTimeout { hash },
                    delay: deadline,
                });
            }
        }
    }

    /// Asks peers for the committed blocks between our tip and `slot` when
    /// that slot is beyond the next height.
    fn request_catchup(&mut self, slot: u64) {
        if self.syncing {
            return;
        }
        let start = lock(&self.shared.state).ledger.height() + 1;
        if slot <= start {
            return;
        }
        info!(behind = slot - start, "requesting block catch-up");
        self.syncing = true;
        lock(&self.shared.outbox).push(Outbound::BlockRequest(start));
    }

    /// Applies blocks delivered by a peer, in height order, and restores the
    /// matching slots so the driver's cursor moves past them.
    fn on_blocks(&mut self, mut blocks: Vec<Block>) -> Result<(), FatalError> {
        self.syncing = false;
        blocks.sort_by_key(|b| b.header.height);
        let mut applied = false;
        for block in blocks {
            let height = block.header.height;
            let value = ConsensusValue {
                enrollments: block.header.enrollments.clone(),
                tx_set: block.txs.clone(),
            };
            let synced = {
                let mut state = lock(&self.shared.state);
                if height != state.ledger.height() + 1 {
                    continue;
                }
                let ChainState {
                    ledger,
                    enrollments,
                    ..
                } = &mut *state;
                ledger.sync_block(block.clone(), enrollments)
            };
            match synced {
                Ok(()) => {
                    self.driver
                        .restore_externalized(height, codec::to_bytes_canonical(&value));
                    if self
                        .pending
                        .as_ref()
                        .is_some_and(|b| b.header.height <= height)
                    {
                        self.pending = None;
                    }
                    self.partials.remove(&height);
                    self.signed_with.remove(&height);
                    {
                        let mut state = lock(&self.shared.state);
                        state.mempool.prune(block.txs.iter());
                    }
                    applied = true;
                }
                Err(
                    LedgerError::Storage(e)
                    | LedgerError::Enrollment(EnrollmentError::Storage(e)),
                ) => {
                    return Err(FatalError::CorruptState(format!(
                        "block persistence failed during catch-up: {e}"
                    )));
                }
                Err(e) => {
                    warn!(height, error = %e, "peer block rejected during catch-up");
                    break;
                }
            }
        }
        if applied {
            self.rebuild_quorums();
            self.maybe_nominate();
        }
        Ok(())
    }

    /// Stages a re-enrollment for this node's own stake: a fresh chain and
    /// noise pair are created and the enrollment is gossiped so every
    /// proposer can carry it once the current cycle runs out.
    pub fn reenroll(&mut self) -> anyhow::Result<()> {
        let enrollment = {
            let mut state = lock(&self.shared.state);
            let stake = state
                .enrollments
                .own()
                .map(|own| own.enroll_key)
                .ok_or_else(|| anyhow::anyhow!("node has no enrollment to renew"))?;
            let pair = self.shared.pair.clone();
            let ChainState {
                ledger,
                enrollments,
                ..
            } = &mut *state;
            enrollments.create_next(ledger.utxos(), stake, &pair)?
        };
        self.pending_enrollments.push(enrollment.clone());
        lock(&self.shared.outbox).push(Outbound::Enrollment(enrollment));
        Ok(())
    }

    /// Admits an enrollment from a peer: new stakes enter the registry
    /// directly, cycle renewals wait for inclusion. Validation rejections are
    /// logged and the record dropped; a registry that can no longer persist
    /// (after its bounded write retries) stops the node.
    fn on_enrollment(&mut self, enrollment: Enrollment) -> Result<(), FatalError> {
        let mut state = lock(&self.shared.state);
        let next = state.ledger.height() + 1;
        if state.enrollments.has(&enrollment.utxo_key) {
            if state
                .enrollments
                .check(next, state.ledger.utxos(), &enrollment)
                .is_ok()
                && !self.pending_enrollments.contains(&enrollment)
            {
                debug!(utxo = %enrollment.utxo_key, "re-enrollment staged for inclusion");
                self.pending_enrollments.push(enrollment);
            }
            return Ok(());
        }
        let ChainState {
            ledger,
            enrollments,
            ..
        } = &mut *state;
        match enrollments.add(next, ledger.utxos(), enrollment) {
            Ok(()) => Ok(()),
            Err(EnrollmentError::Storage(e)) => Err(FatalError::CorruptState(format!(
                "enrollment registry write failed: {e}"
            ))),
            Err(e) => {
                debug!(error = %e, "enrollment rejected");
                Ok(())
            }
        }
    }

    fn on_transaction(&mut self, tx: Transaction) {
        {
            let mut state = lock(&self.shared.state);
            if let Some(reason) = state.ledger.validate_tx_set(&[tx.clone()], &state.enrollments)
            {
                debug!(%reason, "transaction rejected");
                return;
            }
            if !state.mempool.insert(tx) {
                return;
            }
        }
        self.maybe_nominate();
    }

    fn on_preimage(&mut self, info: PreimageInfo) -> Result<(), FatalError> {
        let accepted = {
            let mut state = lock(&self.shared.state);
            let Some(enrollment) = state.enrollments.get(&info.enroll_key).cloned() else {
                debug!(enrollment = %info.enroll_key, "pre-image for unknown enrollment");
                return Ok(());
            };
            let Some(enrolled_height) = state.enrollments.enrolled_height(&info.enroll_key)
            else {
                debug!(enrollment = %info.enroll_key, "pre-image for pending enrollment");
                return Ok(());
            };
            match state.tracker.receive(&enrollment, enrolled_height, &info) {
                Ok(fresh) => fresh,
                Err(e) => {
                    warn!(error = %e, "pre-image rejected");
                    return Ok(());
                }
            }
        };
        if accepted {
            if let Some(height) = self.pending.as_ref().map(|b| b.header.height) {
                self.try_sign(height, false);
                self.try_seal(height)?;
            }
        }
        Ok(())
    }

    /// A slot externalized: build the block, reveal, and start sealing.
    fn on_externalized(&mut self, slot: u64, value: Value) -> Result<(), FatalError> {
        let decoded: ConsensusValue = codec::from_bytes_canonical(&value).map_err(|e| {
            FatalError::Divergence(format!("externalized value does not decode: {e}"))
        })?;
        info!(
            slot,
            txs = decoded.tx_set.len(),
            enrollments = decoded.enrollments.len(),
            "slot externalized"
        );

        let sign_timeout = {
            let mut state = lock(&self.shared.state);
            let block =
                Block::on_top_of(state.ledger.tip(), decoded.tx_set, decoded.enrollments);
            self.pending = Some(block);

            // Reveal our own pre-image for this height.
            if let Some(info) = state.enrollments.own_reveal(slot) {
                let own = state.enrollments.get(&info.enroll_key).cloned();
                if let (Some(enrollment), Some(eh)) = (
                    own,
                    state.enrollments.enrolled_height(&info.enroll_key),
                ) {
                    match state.tracker.receive(&enrollment, eh, &info) {
                        Ok(_) => {
                            lock(&self.shared.outbox).push(Outbound::Preimage(info));
                        }
                        Err(e) => warn!(error = %e, "own reveal rejected"),
                    }
                }
            }
            Duration::from_millis(state.params.block_sign_timeout_ms)
        };

        lock(&self.shared.timers).push(ScheduledTimer {
            message: NodeMessage::SignTimeout { height: slot },
            delay: sign_timeout,
        });

        self.try_sign(slot, false);
        self.try_seal(slot)
    }

    /// Bitfield indices of the active validators whose reveal for `height`
    /// is known.
    fn revealed_indices(state: &ChainState, height: u64) -> (signer::SignerSet, Vec<usize>) {
        let set = state.ledger.signer_set_at(height, &state.enrollments);
        let revealed = (0..set.len())
            .filter(|&i| {
                set.get(i)
                    .map(|(_, e)| state.tracker.get(&e.utxo_key, height).is_some())
                    .unwrap_or(false)
            })
            .collect();
        (set, revealed)
    }

    /// Computes and broadcasts our partial signature once the participant
    /// set is known: the full set, or — after the sign timeout — whoever has
    /// revealed.
    fn try_sign(&mut self, height: u64, force: bool) {
        let Some(block) = self.pending.as_ref() else {
            return;
        };
        if block.header.height != height {
            return;
        }
        let state = lock(&self.shared.state);
        let (set, revealed) = Self::revealed_indices(&state, height);
        if set.is_empty() {
            return;
        }
        if !force && revealed.len() < set.len() {
            return;
        }
        let own_key = self.shared.pair.public();
        let Some(own_index) = set.index_of(&own_key) else {
            return;
        };
        if !revealed.contains(&own_index) {
            return;
        }
        if self.signed_with.get(&height) == Some(&revealed) {
            return;
        }

        let Some(own) = state.enrollments.own() else {
            return;
        };
        let Ok(nonce) = signer::aggregate_nonce(&set, height, &state.tracker, &revealed) else {
            return;
        };
        let challenge = {
            let mut probe = block.header.clone();
            probe.signature.r = nonce.0;
            match set.challenge(&probe) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "challenge computation failed");
                    return;
                }
            }
        };
        let Some(preimage) = state.tracker.get(&own.enroll_key, height) else {
            return;
        };
        let partial = signer::sign_partial(
            self.shared.pair.secret(),
            own.noise_secret(),
            &preimage,
            &challenge,
        );
        drop(state);

        debug!(height, signers = revealed.len(), "partial signature broadcast");
        self.signed_with.insert(height, revealed);
        self.partials
            .entry(height)
            .or_default()
            .insert(own_key, partial);
        lock(&self.shared.outbox).push(Outbound::Partial(BlockPartialSig {
            height,
            signer: own_key,
            partial,
        }));
    }

    /// Seals and applies the pending block once partials from every revealed
    /// participant are in.
    fn try_seal(&mut self, height: u64) -> Result<(), FatalError> {
        let Some(block) = self.pending.as_ref() else {
            return Ok(());
        };
        if block.header.height != height {
            return Ok(());
        }

        let sealed = {
            let state = lock(&self.shared.state);
            let (set, revealed) = Self::revealed_indices(&state, height);
            if revealed.is_empty() {
                return Ok(());
            }
            let collected = self.partials.entry(height).or_default();
            let mut partials: Vec<(usize, [u8; 32])> = Vec::new();
            for &i in &revealed {
                let Some((key, _)) = set.get(i) else {
                    return Ok(());
                };
                match collected.get(key) {
                    Some(partial) => partials.push((i, *partial)),
                    None => return Ok(()), // still waiting
                }
            }
            let mut sealed = block.clone();
            if let Err(e) =
                signer::seal_header(&mut sealed.header, &set, &state.tracker, &partials)
            {
                warn!(height, error = %e, "sealing failed");
                return Ok(());
            }
            sealed
        };

        let changed = {
            let mut state = lock(&self.shared.state);
            let ChainState {
                ledger,
                enrollments,
                tracker,
                ..
            } = &mut *state;
            match ledger.apply(sealed.clone(), enrollments, tracker) {
                Ok(changed) => changed,
                Err(LedgerError::InvalidBlockSignature(msg)) => {
                    // Partials against a different participant view; more
                    // messages or the sign timeout will settle it.
                    debug!(height, %msg, "collective signature not yet consistent");
                    return Ok(());
                }
                Err(e) => {
                    error!(height, error = %e, code = e.code(), "externalized block failed to apply");
                    return Err(FatalError::Divergence(e.to_string()));
                }
            }
        };

        info!(height, "block sealed and committed");
        self.pending = None;
        self.partials.remove(&height);
        self.signed_with.remove(&height);
        self.pending_enrollments
            .retain(|e| !sealed.header.enrollments.contains(e));
        {
            let mut state = lock(&self.shared.state);
            state.mempool.prune(sealed.txs.iter());
        }

        if changed {
            self.rebuild_quorums();
        }
        self.maybe_nominate();
        Ok(())
    }

    /// Recomputes every validator's quorum configuration after the active
    /// set changed, verifies it, and installs it. On verification failure
    /// the previous configuration stays.
    fn rebuild_quorums(&mut self) {
        let own_key = self.shared.pair.public();
        let installed = {
            let mut state = lock(&self.shared.state);
            install_quorums(&mut state, own_key)
        };
        match installed {
            Some(qset) => self.driver.update_local_quorum(qset),
            None => warn!("quorum rebuild rejected; keeping previous configuration"),
        }
    }

    /// Proposes the mempool contents for the current slot, once per slot.
    fn maybe_nominate(&mut self) {
        let slot = self.driver.current_slot();
        if self.last_nominated == Some(slot) {
            return;
        }
        let (value, previous) = {
            let state = lock(&self.shared.state);
            if state.ledger.height() + 1 != slot {
                return;
            }
            let tx_set: Vec<Transaction> = state
                .mempool
                .snapshot()
                .into_iter()
                .filter(|tx| {
                    state
                        .ledger
                        .validate_tx_set(std::slice::from_ref(tx), &state.enrollments)
                        .is_none()
                })
                .collect();
            if tx_set.is_empty() {
                // An empty set is never nominated.
                return;
            }
            let mut enrollments: Vec<Enrollment> = state
                .enrollments
                .unregistered()
                .into_iter()
                .chain(self.pending_enrollments.iter().cloned())
                .filter(|e| {
                    state
                        .enrollments
                        .check(slot, state.ledger.utxos(), e)
                        .is_ok()
                })
                .collect();
            enrollments.sort_by(|a, b| a.utxo_key.cmp(&b.utxo_key));
            enrollments.dedup_by(|a, b| a.utxo_key == b.utxo_key);
            let value = ConsensusValue {
                enrollments,
                tx_set,
            };
            let previous = self
                .driver
                .externalized_value(slot.saturating_sub(1))
                .cloned()
                .unwrap_or_default();
            (codec::to_bytes_canonical(&value), previous)
        };
        if self.driver.nominate(slot, value, &previous) {
            self.last_nominated = Some(slot);
        }
    }
}

/// Builds and verifies the quorum configurations for the coming height and
/// installs them into the shared cache. Returns the local node's set, or
/// `None` when verification failed.
fn install_quorums(state: &mut ChainState, own_key: PublicKey) -> Option<QuorumSet> {
    let next = state.ledger.height() + 1;
    let active = state.enrollments.active_at(next);
    let mut stakes: Vec<NodeStake> = Vec::new();
    let mut keys: Vec<PublicKey> = Vec::new();
    for enrollment in &active {
        let Some(utxo) = state.ledger.utxos().find_utxo(&enrollment.utxo_key) else {
            continue;
        };
        stakes.push(NodeStake {
            key: utxo.address,
            amount: utxo.amount,
        });
        keys.push(utxo.address);
    }
    let count = stakes.len();
    if count == 0 {
        warn!("no active validators; keeping previous quorum configuration");
        return None;
    }

    let override_threshold = state.params.quorum_threshold_override;
    let build = |key: PublicKey| {
        let mut qset = QuorumBuilder::build(key, &stakes, count);
        if let Some(t) = override_threshold {
            qset.threshold = t.min(qset.validators.len() as u32);
        }
        qset
    };

    let own = build(own_key);
    if let Err(e) = QuorumBuilder::verify_sanity(&own_key, &own) {
        error!(error = %e, code = e.code(), "own quorum failed sanity check");
        return None;
    }

    let mut configs = BTreeMap::new();
    for key in &keys {
        configs.insert(*key, build(*key));
    }
    configs.insert(own_key, own.clone());
    if state.params.quorum_intersection_checks {
        if let Err(e) = QuorumBuilder::verify_intersection(&configs) {
            error!(error = %e, code = e.code(), "quorum intersection check failed");
            return None;
        }
    }

    for qset in configs.values() {
        state.quorum_sets.insert(qset.hash(), qset.clone());
    }
    debug!(validators = count, "quorum configurations installed");
    Some(own)
}
