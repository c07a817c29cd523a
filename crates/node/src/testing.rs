//! In-process cluster harness for integration tests.
//!
//! Nodes exchange messages through per-node queues with deterministic,
//! in-order delivery. Timers never run on a clock: the harness captures what
//! a node schedules and fires it between delivery rounds, the way the async
//! shell would after the delays elapsed.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use stoa_api::consensus::TimerClass;
use stoa_api::storage::MemoryStore;
use stoa_crypto::Pair;
use stoa_types::app::{
    Amount, Block, Enrollment, Hash, PublicKey, Signature, Transaction, TxInput, TxOutput,
    TxType, UtxoValue, MIN_FREEZE_STAKE,
};
use stoa_types::config::ConsensusParams;
use stoa_validator::EnrollmentManager;

use crate::genesis::GenesisSpec;
use crate::hooks::ScheduledTimer;
use crate::node::{Node, NodeMessage, Outbound};

/// The spendable coins granted to the cluster's test user at genesis.
pub const USER_COINS: [u64; 6] = [1_000, 1_000, 1_000, 1_000, 1_000, 100_000];

/// A deterministic in-process cluster of validator nodes.
pub struct TestCluster {
    /// The nodes, in creation order.
    pub nodes: Vec<Node>,
    /// Validator keys, in creation order.
    pub pairs: Vec<Pair>,
    /// Per-node persistent stores, kept for restarts.
    pub stores: Vec<Arc<MemoryStore>>,
    /// The shared genesis block.
    pub genesis: Block,
    /// The consensus parameters every node runs with.
    pub params: ConsensusParams,
    /// A funded test user.
    pub user: Pair,
    /// The user's coin keys, largest last.
    pub user_coins: Vec<Hash>,
    queues: Vec<VecDeque<NodeMessage>>,
    timers: Vec<Vec<ScheduledTimer>>,
    muted: HashSet<usize>,
}

impl TestCluster {
    /// Builds `n` validators with equal stakes and a funded user account.
    pub fn new(n: usize, params: ConsensusParams) -> TestCluster {
        let pairs: Vec<Pair> = (0..n).map(|_| Pair::random()).collect();
        let user = Pair::random();

        // Every validator prepares its enrollment against the stake output
        // genesis will create for it.
        let mut stores = Vec::new();
        let mut enrollments: Vec<Enrollment> = Vec::new();
        for pair in &pairs {
            let store = Arc::new(MemoryStore::new());
            let stake_key = GenesisSpec::stake_utxo_key(pair.public(), MIN_FREEZE_STAKE);
            let owner = pair.public();
            let finder = move |key: &Hash| {
                (*key == stake_key).then_some(UtxoValue {
                    unlock_height: 0,
                    tx_type: TxType::Freeze,
                    amount: MIN_FREEZE_STAKE,
                    address: owner,
                })
            };
            let mut manager = EnrollmentManager::load(
                store.clone(),
                params.min_freeze_stake,
                params.cycle_length,
            )
            .unwrap();
            enrollments.push(manager.create_own(&finder, stake_key, pair).unwrap());
            stores.push(store);
        }

        let spec = GenesisSpec {
            stakes: pairs
                .iter()
                .map(|p| (p.public(), MIN_FREEZE_STAKE))
                .collect(),
            enrollments,
            funding: USER_COINS
                .iter()
                .map(|&amount| (user.public(), Amount(amount)))
                .collect(),
        };
        let genesis = spec.build();
        let funding_tx = genesis
            .txs
            .iter()
            .find(|t| t.tx_type == TxType::Payment)
            .expect("genesis funding tx");
        let user_coins: Vec<Hash> = (0..USER_COINS.len())
            .map(|i| stoa_types::app::utxo_key(&funding_tx.hash(), i as u32))
            .collect();

        let nodes: Vec<Node> = pairs
            .iter()
            .zip(&stores)
            .map(|(pair, store)| {
                Node::new(
                    pair.clone(),
                    params.clone(),
                    store.clone(),
                    genesis.clone(),
                )
                .unwrap()
            })
            .collect();

        let queues = (0..n).map(|_| VecDeque::new()).collect();
        let timers = (0..n).map(|_| Vec::new()).collect();
        TestCluster {
            nodes,
            pairs,
            stores,
            genesis,
            params,
            user,
            user_coins,
            queues,
            timers,
            muted: HashSet::new(),
        }
    }

    /// Silences a node: it neither receives nor sends from now on.
    pub fn mute(&mut self, i: usize) {
        self.muted.insert(i);
    }

    /// Reconnects a muted node. Messages dropped while muted stay dropped.
    pub fn unmute(&mut self, i: usize) {
        self.muted.remove(&i);
    }

    /// Restarts node `i` from its persistent store, dropping all of its
    /// in-memory state.
    pub fn restart(&mut self, i: usize) {
        self.queues[i].clear();
        self.timers[i].clear();
        self.nodes[i] = Node::new(
            self.pairs[i].clone(),
            self.params.clone(),
            self.stores[i].clone(),
            self.genesis.clone(),
        )
        .unwrap();
    }

    /// Enqueues a message for node `i`.
    pub fn deliver(&mut self, i: usize, message: NodeMessage) {
        self.queues[i].push_back(message);
    }

    /// Submits a transaction to node `i`.
    pub fn submit_tx(&mut self, i: usize, tx: Transaction) {
        self.deliver(i, NodeMessage::Tx(tx));
    }

    /// A signed payment from the user's coin `coin` to `to`.
    pub fn payment(&self, coin: Hash, to: PublicKey, amount: u64) -> Transaction {
        let mut tx = Transaction {
            tx_type: TxType::Payment,
            inputs: vec![TxInput {
                utxo: coin,
                signature: Signature::default(),
            }],
            outputs: vec![TxOutput {
                amount: Amount(amount),
                address: to,
            }],
        };
        tx.inputs[0].signature = self.user.sign(&tx.hash());
        tx
    }

    /// Delivers queued messages until every queue is empty.
    pub fn pump(&mut self) {
        loop {
            let mut progress = false;
            for i in 0..self.nodes.len() {
                if self.muted.contains(&i) {
                    self.queues[i].clear();
                    continue;
                }
                while let Some(message) = self.queues[i].pop_front() {
                    progress = true;
                    let outbound = self.nodes[i].handle(message).expect("node hit fatal error");
                    let captured = self.nodes[i].take_timers();
                    self.timers[i].extend(captured);
                    for out in outbound {
                        self.broadcast(i, out);
                    }
                }
            }
            if !progress {
                break;
            }
        }
    }

    fn broadcast(&mut self, from: usize, out: Outbound) {
        let message = match out {
            Outbound::Envelope(e) => NodeMessage::Envelope(e),
            Outbound::Enrollment(e) => NodeMessage::Enrollment(e),
            Outbound::Preimage(p) => NodeMessage::Preimage(p),
            Outbound::Partial(p) => NodeMessage::Partial(p),
            Outbound::QuorumQuery(h) => NodeMessage::QuorumQuery(h),
            Outbound::QuorumReply(q) => NodeMessage::QuorumReply(q),
            Outbound::BlockRequest(start) => NodeMessage::BlockRequest { start },
            Outbound::Blocks(blocks) => NodeMessage::Blocks(blocks),
        };
        for j in 0..self.nodes.len() {
            if j != from && !self.muted.contains(&j) {
                self.queues[j].push_back(message.clone());
            }
        }
    }

    /// Fires captured timers: the newest consensus timer per slot and class,
    /// and every one-shot deadline.
    pub fn fire_timers(&mut self) {
        for i in 0..self.nodes.len() {
            if self.muted.contains(&i) {
                self.timers[i].clear();
                continue;
            }
            let captured = std::mem::take(&mut self.timers[i]);
            let mut newest: HashMap<(u64, TimerClass), NodeMessage> = HashMap::new();
            for timer in captured {
                match timer.message {
                    NodeMessage::Timer { slot, class, id } => {
                        let entry = newest
                            .entry((slot, class))
                            .or_insert(NodeMessage::Timer { slot, class, id });
                        if let NodeMessage::Timer { id: existing, .. } = entry {
                            if id > *existing {
                                *entry = NodeMessage::Timer { slot, class, id };
                            }
                        }
                    }
                    other => self.queues[i].push_back(other),
                }
            }
            for message in newest.into_values() {
                self.queues[i].push_back(message);
            }
        }
    }

    /// Pumps and fires timers until every unmuted node reaches `height`, or
    /// panics after `max_rounds`.
    pub fn run_until_height(&mut self, height: u64, max_rounds: usize) {
        for _ in 0..max_rounds {
            self.pump();
            let done = (0..self.nodes.len())
                .filter(|i| !self.muted.contains(i))
                .all(|i| self.nodes[i].height() >= height);
            if done {
                return;
            }
            self.fire_timers();
        }
        self.pump();
        let heights: Vec<u64> = self.nodes.iter().map(Node::height).collect();
        panic!("cluster did not reach height {height}; at {heights:?}");
    }

    /// Like [`TestCluster::run_until_height`] but without the expectation:
    /// runs `rounds` full rounds and returns.
    pub fn run_rounds(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.pump();
            self.fire_timers();
        }
        self.pump();
    }
}
