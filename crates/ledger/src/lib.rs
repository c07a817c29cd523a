#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::todo,
        clippy::unimplemented
    )
)]
//! The ledger: UTXO tracking, transaction-set validation, and atomic block
//! application.
//!
//! `apply` verifies everything about a block before any state moves: header
//! linkage, the transaction set, carried enrollments, and the collective
//! signature. UTXO mutations are staged on a copy and swapped in only when
//! every step has passed, so a rejected block leaves no trace.

/// The unspent-transaction-output set.
pub mod utxo;

pub use utxo::UtxoSet;

use std::collections::HashSet;
use std::sync::Arc;
use stoa_api::ledger::UtxoFinder;
use stoa_api::storage::KvStore;
use stoa_crypto::schnorr;
use stoa_types::app::{merkle_root, Block, BlockHeader, ConsensusValue, Hash, Transaction};
use stoa_types::codec;
use stoa_types::error::{LedgerError, StorageError};
use stoa_types::keys::{block_key, BLOCK_KEY_PREFIX};
use stoa_validator::enrollment::EnrollmentManager;
use stoa_validator::signer::{validate_header, RevealSource, SignerSet};
use tracing::{debug, info, warn};

/// The chain state this node has committed to.
pub struct Ledger {
    store: Arc<dyn KvStore>,
    utxos: UtxoSet,
    blocks: Vec<Block>,
}

impl Ledger {
    /// Opens the ledger: replays persisted blocks when present, otherwise
    /// installs `genesis` and its enrollments.
    pub fn load(
        store: Arc<dyn KvStore>,
        genesis: Block,
        enrollments: &mut EnrollmentManager,
    ) -> Result<Ledger, LedgerError> {
        let mut stored: Vec<Block> = Vec::new();
        for (_, raw) in store
            .iter_prefix(BLOCK_KEY_PREFIX)
            .map_err(StorageError::from)?
        {
            stored.push(codec::from_bytes_canonical(&raw).map_err(StorageError::Decode)?);
        }

        let mut ledger = Ledger {
            store,
            utxos: UtxoSet::new(),
            blocks: Vec::new(),
        };

        if stored.is_empty() {
            info!("installing genesis block");
            ledger.install(genesis, enrollments)?;
            return Ok(ledger);
        }

        if stored[0].header.hash() != genesis.header.hash() {
            return Err(LedgerError::Invalid(
                "persisted chain does not start at this network's genesis".to_string(),
            ));
        }
        info!(height = stored.len() as u64 - 1, "replaying persisted chain");
        for block in stored {
            let expected = ledger.blocks.len() as u64;
            if block.header.height != expected {
                return Err(LedgerError::InvalidHeight {
                    expected,
                    got: block.header.height,
                });
            }
            ledger.install(block, enrollments)?;
        }
        Ok(ledger)
    }

    /// Replays one trusted block into memory: applies transactions, records
    /// enrollment heights, persists. No signature re-verification; the block
    /// either came from our own store or was verified by `apply`.
    fn install(
        &mut self,
        block: Block,
        enrollments: &mut EnrollmentManager,
    ) -> Result<(), LedgerError> {
        let height = block.header.height;
        for tx in &block.txs {
            self.utxos.apply(tx, height + 1);
        }
        for enrollment in &block.header.enrollments {
            if !enrollments.has(&enrollment.utxo_key)
                || enrollments
                    .check(height, &self.utxos, enrollment)
                    .is_ok()
            {
                enrollments.add(height, &self.utxos, enrollment.clone())?;
            }
            enrollments.set_enrolled_height(&enrollment.utxo_key, height)?;
        }
        self.persist(&block)?;
        self.blocks.push(block);
        Ok(())
    }

    /// The height of the chain tip.
    pub fn height(&self) -> u64 {
        self.blocks.len().saturating_sub(1) as u64
    }

    /// The chain tip's header.
    pub fn tip(&self) -> &BlockHeader {
        // A ledger always holds at least genesis.
        &self.blocks[self.blocks.len() - 1].header
    }

    /// The block at `height`.
    pub fn block_at(&self, height: u64) -> Option<&Block> {
        self.blocks.get(height as usize)
    }

    /// Up to `count` blocks starting at `start`, for peer catch-up.
    pub fn blocks_from(&self, start: u64, count: u64) -> Vec<Block> {
        self.blocks
            .iter()
            .skip(start as usize)
            .take(count as usize)
            .cloned()
            .collect()
    }

    /// The committed UTXO set.
    pub fn utxos(&self) -> &UtxoSet {
        &self.utxos
    }

    /// Judges a transaction set proposed for the next block. `None` accepts.
    pub fn validate_tx_set(
        &self,
        txs: &[Transaction],
        enrollments: &EnrollmentManager,
    ) -> Option<String> {
        let next = self.height() + 1;
        if txs.is_empty() {
            return Some("empty transaction set".to_string());
        }
        let mut spent: HashSet<Hash> = HashSet::new();
        for tx in txs {
            if tx.inputs.is_empty() {
                return Some(format!("transaction {} has no inputs", tx.hash()));
            }
            if tx.outputs.is_empty() {
                return Some(format!("transaction {} has no outputs", tx.hash()));
            }
            let Some(out_total) = tx.output_total() else {
                return Some(format!("transaction {} output overflow", tx.hash()));
            };
            let mut in_total = 0u128;
            for input in &tx.inputs {
                if !spent.insert(input.utxo) {
                    return Some(format!("output {} spent twice in set", input.utxo));
                }
                let Some(utxo) = self.utxos.get(&input.utxo) else {
                    return Some(format!("unknown output {}", input.utxo));
                };
                if utxo.unlock_height > next {
                    return Some(format!("output {} still locked", input.utxo));
                }
                if let Some(reason) = frozen_lock_reason(enrollments, &input.utxo, next) {
                    return Some(reason);
                }
                if schnorr::verify(&utxo.address, &tx.hash(), &input.signature).is_err() {
                    return Some(format!("bad signature on output {}", input.utxo));
                }
                in_total += utxo.amount.0 as u128;
            }
            if in_total < out_total.0 as u128 {
                return Some(format!("transaction {} spends more than it owns", tx.hash()));
            }
        }
        None
    }

    /// Judges a full consensus value for the next block. `None` accepts.
    pub fn validate_value(
        &self,
        value: &ConsensusValue,
        enrollments: &EnrollmentManager,
    ) -> Option<String> {
        let next = self.height() + 1;
        if let Some(reason) = self.validate_tx_set(&value.tx_set, enrollments) {
            return Some(reason);
        }
        let mut previous: Option<&Hash> = None;
        for enrollment in &value.enrollments {
            if previous.is_some_and(|p| p >= &enrollment.utxo_key) {
                return Some("enrollments not sorted by key".to_string());
            }
            previous = Some(&enrollment.utxo_key);
            let already_pending = enrollments
                .get(&enrollment.utxo_key)
                .is_some_and(|known| known == enrollment)
                && enrollments.enrolled_height(&enrollment.utxo_key).is_none();
            if !already_pending {
                if let Err(e) = enrollments.check(next, &self.utxos, enrollment) {
                    return Some(format!("enrollment {}: {e}", enrollment.utxo_key));
                }
            }
        }
        None
    }

    /// The validator set that signs the block at `height`.
    pub fn signer_set_at(&self, height: u64, enrollments: &EnrollmentManager) -> SignerSet {
        let mut validators = Vec::new();
        for enrollment in enrollments.active_at(height) {
            match self.utxos.find_utxo(&enrollment.utxo_key) {
                Some(utxo) => validators.push((utxo.address, enrollment.clone())),
                None => warn!(utxo = %enrollment.utxo_key, "active enrollment without stake output"),
            }
        }
        SignerSet::new(validators)
    }

    /// Appends `block` atomically.
    ///
    /// Verifies header linkage, the transaction set, carried enrollments, and
    /// the collective signature; then commits the staged UTXO mutations,
    /// installs the enrollments, and persists the block. Returns whether the
    /// active validator set changes going into the next height.
    pub fn apply<R: RevealSource>(
        &mut self,
        block: Block,
        enrollments: &mut EnrollmentManager,
        reveals: &R,
    ) -> Result<bool, LedgerError> {
        let height = block.header.height;
        let expected = self.height() + 1;
        if height != expected {
            return Err(LedgerError::InvalidHeight {
                expected,
                got: height,
            });
        }
        if block.header.prev_block != self.tip().hash() {
            return Err(LedgerError::MismatchedPrevHash);
        }
        let hashes: Vec<Hash> = block.txs.iter().map(Transaction::hash).collect();
        if block.header.merkle_root != merkle_root(&hashes) {
            return Err(LedgerError::MismatchedMerkleRoot);
        }
        if let Some(reason) = self.validate_tx_set(&block.txs, enrollments) {
            return Err(LedgerError::InvalidTxSet(reason));
        }

        // Enrollments are judged against the committed UTXO set — the same
        // view value validation used — so agreement and application cannot
        // disagree.
        for enrollment in &block.header.enrollments {
            let already_pending = enrollments
                .get(&enrollment.utxo_key)
                .is_some_and(|known| known == enrollment)
                && enrollments.enrolled_height(&enrollment.utxo_key).is_none();
            if !already_pending {
                enrollments.check(height, &self.utxos, enrollment)?;
            }
        }

        let set = self.signer_set_at(height, enrollments);
        validate_header(&block.header, &set, reveals)
            .map_err(|e| LedgerError::InvalidBlockSignature(e.to_string()))?;

        // Every check has passed; stage and commit.
        let mut staged = self.utxos.clone();
        for tx in &block.txs {
            staged.apply(tx, height + 1);
        }
        for enrollment in &block.header.enrollments {
            if !enrollments.has(&enrollment.utxo_key)
                || enrollments.check(height, &self.utxos, enrollment).is_ok()
            {
                enrollments.add(height, &self.utxos, enrollment.clone())?;
            }
            enrollments.set_enrolled_height(&enrollment.utxo_key, height)?;
        }
        let next_set: HashSet<Hash> = enrollments
            .active_at(height + 1)
            .iter()
            .map(|e| e.utxo_key)
            .collect();
        let current_set: HashSet<Hash> = enrollments
            .active_at(height)
            .iter()
            .map(|e| e.utxo_key)
            .collect();

        self.persist(&block)?;
        self.utxos = staged;
        self.blocks.push(block);
        info!(height, "block appended");

        let changed = next_set != current_set;
        if changed {
            debug!(height, "active validator set changes at next height");
        }
        Ok(changed)
    }

    /// Appends a block fetched from a peer during catch-up.
    ///
    /// Header linkage, the Merkle root, and the transaction set are verified;
    /// the collective signature is not re-checked — the block extends a chain
    /// this node already trusts and was externalized by the quorum, and the
    /// reveal history needed to re-verify it is not carried by blocks.
    pub fn sync_block(
        &mut self,
        block: Block,
        enrollments: &mut EnrollmentManager,
    ) -> Result<(), LedgerError> {
        let height = block.header.height;
        let expected = self.height() + 1;
        if height != expected {
            return Err(LedgerError::InvalidHeight {
                expected,
                got: height,
            });
        }
        if block.header.prev_block != self.tip().hash() {
            return Err(LedgerError::MismatchedPrevHash);
        }
        let hashes: Vec<Hash> = block.txs.iter().map(Transaction::hash).collect();
        if block.header.merkle_root != merkle_root(&hashes) {
            return Err(LedgerError::MismatchedMerkleRoot);
        }
        if let Some(reason) = self.validate_tx_set(&block.txs, enrollments) {
            return Err(LedgerError::InvalidTxSet(reason));
        }
        info!(height, "block synced from peer");
        self.install(block, enrollments)
    }

    fn persist(&self, block: &Block) -> Result<(), LedgerError> {
        self.store
            .put(
                &block_key(block.header.height),
                &codec::to_bytes_canonical(block),
            )
            .map_err(StorageError::from)?;
        Ok(())
    }
}

/// Why a frozen output cannot be spent right now, if it cannot.
fn frozen_lock_reason(
    enrollments: &EnrollmentManager,
    utxo_key: &Hash,
    next_height: u64,
) -> Option<String> {
    let enrollment = enrollments.get(utxo_key)?;
    if enrollment.cycle_length == 0 {
        return None;
    }
    match enrollments.enrolled_height(utxo_key) {
        None => Some(format!("output {utxo_key} backs a pending enrollment")),
        Some(eh) if next_height <= eh + enrollment.cycle_length as u64 => Some(format!(
            "output {utxo_key} backs an enrollment active until height {}",
            eh + enrollment.cycle_length as u64
        )),
        Some(_) => None,
    }
}
