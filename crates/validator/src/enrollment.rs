//! The enrollment registry and the node's own enrollment data.
//!
//! Enrollments are validated against the UTXO set, persisted under
//! `validator_set::` rows, and carry a write-once `enrolled_height` recorded
//! when the block containing them is appended. The node's own pre-image chain
//! and signature-noise pair live under private `node_enroll_data::` rows so a
//! restart never loses them.

use curve25519_dalek::Scalar;
use parity_scale_codec::{Decode, Encode};
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use stoa_api::ledger::UtxoFinder;
use stoa_api::storage::KvStore;
use stoa_crypto::{schnorr, Pair, PreimageChain};
use stoa_types::app::{Amount, Enrollment, Hash, PreimageInfo, PublicKey, TxType};
use stoa_types::codec;
use stoa_types::error::{EnrollmentError, StorageError};
use stoa_types::keys::{validator_set_key, NODE_PREIMAGES_KEY, NODE_SIGNATURE_NOISE_KEY};
use tracing::{debug, info, warn};

/// Attempts for a store write before the error surfaces.
const PERSIST_ATTEMPTS: u32 = 3;

/// One persisted registry row.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct EnrollmentRecord {
    /// The enrollment as received.
    pub enrollment: Enrollment,
    /// Height of the block that included it; unset while pending. Write-once.
    pub enrolled_height: Option<u64>,
}

/// The node's private signature-noise pair, persisted across restarts.
#[derive(Debug, Clone, Encode, Decode)]
struct SignatureNoise {
    secret: [u8; 32],
    public: [u8; 32],
}

/// Private per-enrollment state of this node.
pub struct OwnEnrollment {
    /// `utxo_key` of the node's enrollment.
    pub enroll_key: Hash,
    /// The signature-noise scalar `r₀`.
    noise_secret: Scalar,
    /// The pre-image chain backing the published `random_seed`.
    chain: PreimageChain,
}

impl OwnEnrollment {
    /// The noise scalar, needed to derive per-block nonces.
    pub fn noise_secret(&self) -> &Scalar {
        &self.noise_secret
    }

    /// The pre-image chain.
    pub fn chain(&self) -> &PreimageChain {
        &self.chain
    }
}

/// The enrollment registry.
pub struct EnrollmentManager {
    store: Arc<dyn KvStore>,
    min_freeze_stake: Amount,
    cycle_length: u32,
    records: BTreeMap<Hash, EnrollmentRecord>,
    own: Option<OwnEnrollment>,
    /// Data for a re-enrollment that has been created but not yet included
    /// in a block; swapped into `own` at inclusion.
    next_own: Option<OwnEnrollment>,
}

impl EnrollmentManager {
    /// Opens the registry, loading every persisted record and, when present,
    /// the node's own enrollment data.
    pub fn load(
        store: Arc<dyn KvStore>,
        min_freeze_stake: Amount,
        cycle_length: u32,
    ) -> Result<EnrollmentManager, EnrollmentError> {
        let mut records = BTreeMap::new();
        for (_, raw) in store.iter_prefix(stoa_types::keys::VALIDATOR_SET_PREFIX)? {
            let record: EnrollmentRecord =
                codec::from_bytes_canonical(&raw).map_err(StorageError::Decode)?;
            records.insert(record.enrollment.utxo_key, record);
        }

        let own = Self::load_own(store.as_ref(), &records)?;
        if let Some(own) = &own {
            info!(enroll_key = %own.enroll_key, "restored own enrollment data");
        }
        Ok(EnrollmentManager {
            store,
            min_freeze_stake,
            cycle_length,
            records,
            own,
            next_own: None,
        })
    }

    fn load_own(
        store: &dyn KvStore,
        records: &BTreeMap<Hash, EnrollmentRecord>,
    ) -> Result<Option<OwnEnrollment>, EnrollmentError> {
        let Some(noise_raw) = store.get(NODE_SIGNATURE_NOISE_KEY)? else {
            return Ok(None);
        };
        let Some(chain_raw) = store.get(NODE_PREIMAGES_KEY)? else {
            return Ok(None);
        };
        let noise: SignatureNoise =
            codec::from_bytes_canonical(&noise_raw).map_err(StorageError::Decode)?;
        let elements: Vec<Hash> =
            codec::from_bytes_canonical(&chain_raw).map_err(StorageError::Decode)?;
        let secret = schnorr::scalar_from_bytes(&noise.secret)
            .map_err(|_| StorageError::Backend("corrupt signature noise".to_string()))?;

        // The noise commitment doubles as the enrollment signature's R, which
        // is how the record belonging to this node is recognized.
        let own = records
            .values()
            .find(|r| r.enrollment.enroll_sig.r == noise.public)
            .map(|r| OwnEnrollment {
                enroll_key: r.enrollment.utxo_key,
                noise_secret: secret,
                chain: PreimageChain::from_elements(elements),
            });
        if own.is_none() {
            warn!("signature noise present but no matching enrollment record");
        }
        Ok(own)
    }

    /// The node's own enrollment data, if it has enrolled.
    pub fn own(&self) -> Option<&OwnEnrollment> {
        self.own.as_ref()
    }

    /// Validates an enrollment as of `height` without touching the registry:
    /// the referenced UTXO must exist, be a freeze output of sufficient
    /// amount, and the signature must verify against its owner. A `utxo_key`
    /// already registered fails the duplicate check unless its previous cycle
    /// has run out by `height` (re-enrollment).
    pub fn check(
        &self,
        height: u64,
        finder: &dyn UtxoFinder,
        enrollment: &Enrollment,
    ) -> Result<(), EnrollmentError> {
        let utxo = finder
            .find_utxo(&enrollment.utxo_key)
            .ok_or(EnrollmentError::UtxoNotFound(enrollment.utxo_key))?;
        if utxo.tx_type != TxType::Freeze {
            return Err(EnrollmentError::NotFrozen(enrollment.utxo_key));
        }
        if utxo.amount < self.min_freeze_stake {
            return Err(EnrollmentError::InsufficientStake {
                got: utxo.amount.0,
                min: self.min_freeze_stake.0,
            });
        }
        if schnorr::verify(
            &utxo.address,
            &enrollment.signing_digest(),
            &enrollment.enroll_sig,
        )
        .is_err()
        {
            return Err(EnrollmentError::InvalidSignature);
        }
        if let Some(existing) = self.records.get(&enrollment.utxo_key) {
            let expired = existing
                .enrolled_height
                .is_some_and(|eh| height >= eh + existing.enrollment.cycle_length as u64);
            if !expired {
                return Err(EnrollmentError::Duplicate(enrollment.utxo_key));
            }
        }
        Ok(())
    }

    /// Validates and registers an enrollment observed at `height`.
    pub fn add(
        &mut self,
        height: u64,
        finder: &dyn UtxoFinder,
        enrollment: Enrollment,
    ) -> Result<(), EnrollmentError> {
        self.check(height, finder, &enrollment)?;
        if self.records.contains_key(&enrollment.utxo_key) {
            debug!(utxo = %enrollment.utxo_key, height, "replacing expired enrollment");
        }

        let record = EnrollmentRecord {
            enrollment,
            enrolled_height: None,
        };
        self.persist(&record)?;
        info!(utxo = %record.enrollment.utxo_key, height, "enrollment registered");
        self.records.insert(record.enrollment.utxo_key, record);
        Ok(())
    }

    /// Deletes an enrollment; absent keys are not an error.
    pub fn remove(&mut self, utxo_key: &Hash) -> Result<(), EnrollmentError> {
        if self.records.remove(utxo_key).is_some() {
            with_retry(|| self.store.delete(&validator_set_key(utxo_key)))?;
        }
        Ok(())
    }

    /// Whether an enrollment is registered under `utxo_key`.
    pub fn has(&self, utxo_key: &Hash) -> bool {
        self.records.contains_key(utxo_key)
    }

    /// The enrollment registered under `utxo_key`.
    pub fn get(&self, utxo_key: &Hash) -> Option<&Enrollment> {
        self.records.get(utxo_key).map(|r| &r.enrollment)
    }

    /// The recorded inclusion height for `utxo_key`.
    pub fn enrolled_height(&self, utxo_key: &Hash) -> Option<u64> {
        self.records.get(utxo_key).and_then(|r| r.enrolled_height)
    }

    /// Enrollments not yet included in a block, ascending by `utxo_key`.
    pub fn unregistered(&self) -> Vec<Enrollment> {
        self.records
            .values()
            .filter(|r| r.enrolled_height.is_none())
            .map(|r| r.enrollment.clone())
            .collect()
    }

    /// Records the inclusion height for `utxo_key`. Returns false — with the
    /// first value retained — when a height was already recorded.
    pub fn set_enrolled_height(
        &mut self,
        utxo_key: &Hash,
        height: u64,
    ) -> Result<bool, EnrollmentError> {
        let Some(record) = self.records.get_mut(utxo_key) else {
            return Ok(false);
        };
        if record.enrolled_height.is_some() {
            warn!(utxo = %utxo_key, height, "enrolled height already set");
            return Ok(false);
        }
        record.enrolled_height = Some(height);
        let snapshot = record.clone();
        self.persist(&snapshot)?;

        // A staged re-enrollment becomes the live one once its record lands.
        if self
            .next_own
            .as_ref()
            .is_some_and(|next| {
                next.enroll_key == *utxo_key
                    && next.chain.seed() == Some(snapshot.enrollment.random_seed)
            })
        {
            info!(utxo = %utxo_key, height, "re-enrollment active; rotating own chain");
            self.own = self.next_own.take();
        }
        Ok(true)
    }

    /// Enrollments active when signing block `height`: included at `eh`,
    /// usable for the `cycle_length` blocks after it.
    pub fn active_at(&self, height: u64) -> Vec<&Enrollment> {
        self.records
            .values()
            .filter(|r| {
                r.enrolled_height.is_some_and(|eh| {
                    height > eh && height <= eh + r.enrollment.cycle_length as u64
                })
            })
            .map(|r| &r.enrollment)
            .collect()
    }

    /// Creates and persists the node's next enrollment over the frozen
    /// output `utxo_key` owned by `pair`, without touching the registry. The
    /// record activates through the usual inclusion path; until then the
    /// current cycle's chain keeps signing.
    pub fn create_next(
        &mut self,
        finder: &dyn UtxoFinder,
        utxo_key: Hash,
        pair: &Pair,
    ) -> Result<Enrollment, EnrollmentError> {
        let utxo = finder
            .find_utxo(&utxo_key)
            .ok_or(EnrollmentError::UtxoNotFound(utxo_key))?;
        if utxo.tx_type != TxType::Freeze {
            return Err(EnrollmentError::NotFrozen(utxo_key));
        }
        if utxo.address != pair.public() {
            return Err(EnrollmentError::InvalidSignature);
        }

        let chain = PreimageChain::generate(self.cycle_length);
        let random_seed = chain
            .seed()
            .ok_or_else(|| StorageError::Backend("empty pre-image chain".to_string()))?;
        let noise_secret = Scalar::random(&mut OsRng);

        let mut enrollment = Enrollment {
            utxo_key,
            random_seed,
            cycle_length: self.cycle_length,
            enroll_sig: Default::default(),
        };
        // Signing with the noise scalar as nonce publishes its commitment as
        // the signature's R; peers later derive per-block nonces from it.
        enrollment.enroll_sig = pair.sign_with_nonce(&noise_secret, &enrollment.signing_digest());

        let noise = SignatureNoise {
            secret: noise_secret.to_bytes(),
            public: enrollment.enroll_sig.r,
        };
        with_retry(|| {
            self.store
                .put(NODE_SIGNATURE_NOISE_KEY, &codec::to_bytes_canonical(&noise))
        })?;
        with_retry(|| {
            self.store.put(
                NODE_PREIMAGES_KEY,
                &codec::to_bytes_canonical(&chain.elements().to_vec()),
            )
        })?;

        self.next_own = Some(OwnEnrollment {
            enroll_key: utxo_key,
            noise_secret,
            chain,
        });
        info!(utxo = %utxo_key, "next enrollment staged");
        Ok(enrollment)
    }

    /// Creates, signs, registers, and persists this node's own enrollment —
    /// the first-enrollment path, where no previous cycle exists.
    pub fn create_own(
        &mut self,
        finder: &dyn UtxoFinder,
        utxo_key: Hash,
        pair: &Pair,
    ) -> Result<Enrollment, EnrollmentError> {
        let enrollment = self.create_next(finder, utxo_key, pair)?;
        self.records.remove(&utxo_key);
        self.add(0, finder, enrollment.clone())?;
        self.own = self.next_own.take();
        info!(utxo = %utxo_key, "own enrollment created");
        Ok(enrollment)
    }

    /// The pre-image this node reveals for block `height`, if its enrollment
    /// is active there.
    pub fn own_reveal(&self, height: u64) -> Option<PreimageInfo> {
        let own = self.own.as_ref()?;
        let eh = self.enrolled_height(&own.enroll_key)?;
        let offset = height.checked_sub(eh + 1)?;
        let hash = own.chain.reveal_at(offset)?;
        Some(PreimageInfo {
            enroll_key: own.enroll_key,
            hash,
            height,
        })
    }

    /// The owner address of an enrollment, read back from the UTXO set.
    pub fn owner_of(&self, finder: &dyn UtxoFinder, utxo_key: &Hash) -> Option<PublicKey> {
        finder.find_utxo(utxo_key).map(|u| u.address)
    }

    fn persist(&self, record: &EnrollmentRecord) -> Result<(), EnrollmentError> {
        let key = validator_set_key(&record.enrollment.utxo_key);
        let value = codec::to_bytes_canonical(record);
        with_retry(|| self.store.put(&key, &value))?;
        Ok(())
    }
}

/// Retries a store operation a bounded number of times before surfacing the
/// error; callers treat the surfaced error as fatal.
fn with_retry<F>(mut op: F) -> Result<(), StorageError>
where
    F: FnMut() -> Result<(), StorageError>,
{
    let mut last = None;
    for attempt in 1..=PERSIST_ATTEMPTS {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, error = %e, "store write failed");
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| StorageError::Backend("retry without error".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use stoa_api::storage::MemoryStore;
    use stoa_types::app::{UtxoValue, MIN_FREEZE_STAKE};

    fn frozen_utxo(owner: &Pair, amount: u64) -> UtxoValue {
        UtxoValue {
            unlock_height: 0,
            tx_type: TxType::Freeze,
            amount: Amount(amount),
            address: owner.public(),
        }
    }

    fn manager(cycle: u32) -> EnrollmentManager {
        EnrollmentManager::load(Arc::new(MemoryStore::new()), MIN_FREEZE_STAKE, cycle).unwrap()
    }

    struct MapFinder(HashMap<Hash, UtxoValue>);
    impl UtxoFinder for MapFinder {
        fn find_utxo(&self, key: &Hash) -> Option<UtxoValue> {
            self.0.get(key).cloned()
        }
    }

    fn setup() -> (EnrollmentManager, MapFinder, Pair, Hash) {
        let pair = Pair::random();
        let key = Hash::digest(b"stake-utxo");
        let mut utxos = HashMap::new();
        utxos.insert(key, frozen_utxo(&pair, MIN_FREEZE_STAKE.0));
        (manager(8), MapFinder(utxos), pair, key)
    }

    #[test]
    fn create_own_produces_verifiable_enrollment() {
        let (mut mgr, finder, pair, key) = setup();
        let enrollment = mgr.create_own(&finder, key, &pair).unwrap();

        assert_eq!(enrollment.cycle_length, 8);
        assert!(mgr.has(&key));
        assert!(schnorr::verify(
            &pair.public(),
            &enrollment.signing_digest(),
            &enrollment.enroll_sig
        )
        .is_ok());
        // The chain's seed is the published random_seed.
        assert_eq!(mgr.own().unwrap().chain().seed(), Some(enrollment.random_seed));
    }

    #[test]
    fn own_data_survives_reload() {
        let store = Arc::new(MemoryStore::new());
        let pair = Pair::random();
        let key = Hash::digest(b"stake-utxo");
        let mut utxos = HashMap::new();
        utxos.insert(key, frozen_utxo(&pair, MIN_FREEZE_STAKE.0));
        let finder = MapFinder(utxos);

        let seed = {
            let mut mgr =
                EnrollmentManager::load(store.clone(), MIN_FREEZE_STAKE, 8).unwrap();
            let enrollment = mgr.create_own(&finder, key, &pair).unwrap();
            mgr.set_enrolled_height(&key, 1).unwrap();
            enrollment.random_seed
        };

        let mgr = EnrollmentManager::load(store, MIN_FREEZE_STAKE, 8).unwrap();
        let own = mgr.own().expect("own enrollment restored");
        assert_eq!(own.enroll_key, key);
        assert_eq!(own.chain().seed(), Some(seed));
        assert_eq!(mgr.enrolled_height(&key), Some(1));
    }

    #[test]
    fn add_rejects_missing_unfrozen_and_underfunded_utxos() {
        let (mut mgr, mut finder, pair, key) = setup();
        let enrollment = mgr.create_own(&finder, key, &pair).unwrap();
        let mut other = manager(8);

        assert!(matches!(
            other.add(1, &MapFinder(HashMap::new()), enrollment.clone()),
            Err(EnrollmentError::UtxoNotFound(_))
        ));

        finder.0.get_mut(&key).unwrap().tx_type = TxType::Payment;
        assert!(matches!(
            other.add(1, &finder, enrollment.clone()),
            Err(EnrollmentError::NotFrozen(_))
        ));

        finder.0.get_mut(&key).unwrap().tx_type = TxType::Freeze;
        finder.0.get_mut(&key).unwrap().amount = Amount(MIN_FREEZE_STAKE.0 - 1);
        assert!(matches!(
            other.add(1, &finder, enrollment),
            Err(EnrollmentError::InsufficientStake { .. })
        ));
    }

    #[test]
    fn add_rejects_bad_signature_and_duplicates() {
        let (mut mgr, finder, pair, key) = setup();
        let enrollment = mgr.create_own(&finder, key, &pair).unwrap();

        let mut other = manager(8);
        let mut forged = enrollment.clone();
        forged.random_seed = Hash::digest(b"forged");
        assert!(matches!(
            other.add(1, &finder, forged),
            Err(EnrollmentError::InvalidSignature)
        ));

        other.add(1, &finder, enrollment.clone()).unwrap();
        assert!(matches!(
            other.add(1, &finder, enrollment),
            Err(EnrollmentError::Duplicate(_))
        ));
    }

    #[test]
    fn re_enrollment_allowed_once_cycle_ran_out() {
        let (mut mgr, finder, pair, key) = setup();
        let first = mgr.create_own(&finder, key, &pair).unwrap();

        let mut other = manager(8);
        other.add(1, &finder, first.clone()).unwrap();
        other.set_enrolled_height(&key, 1).unwrap();

        // Fresh record for the same stake, before and after expiry.
        let renewal = mgr.create_own(&finder, key, &pair).unwrap();
        assert!(matches!(
            other.add(5, &finder, renewal.clone()),
            Err(EnrollmentError::Duplicate(_))
        ));
        other.add(9, &finder, renewal).unwrap();
        assert_eq!(other.enrolled_height(&key), None);
    }

    #[test]
    fn enrolled_height_is_write_once() {
        let (mut mgr, finder, pair, key) = setup();
        mgr.create_own(&finder, key, &pair).unwrap();

        assert!(mgr.set_enrolled_height(&key, 3).unwrap());
        assert!(!mgr.set_enrolled_height(&key, 4).unwrap());
        assert_eq!(mgr.enrolled_height(&key), Some(3));
        assert!(!mgr.set_enrolled_height(&Hash::digest(b"absent"), 1).unwrap());
    }

    #[test]
    fn unregistered_sorts_by_utxo_key() {
        let mut mgr = manager(8);
        let mut utxos = HashMap::new();
        let mut keys = Vec::new();
        for n in [3u8, 1, 2] {
            let pair = Pair::random();
            let key = Hash([n; 32]);
            utxos.insert(key, frozen_utxo(&pair, MIN_FREEZE_STAKE.0));
            keys.push((key, pair));
        }
        let finder = MapFinder(utxos);
        for (key, pair) in &keys {
            let mut own = manager(8);
            let enrollment = own.create_own(&finder, *key, pair).unwrap();
            mgr.add(1, &finder, enrollment).unwrap();
        }
        let pending = mgr.unregistered();
        assert_eq!(pending.len(), 3);
        assert!(pending.windows(2).all(|w| w[0].utxo_key < w[1].utxo_key));

        mgr.set_enrolled_height(&keys[0].0, 1).unwrap();
        assert_eq!(mgr.unregistered().len(), 2);
    }

    #[test]
    fn activity_window_is_cycle_bounded() {
        let (mut mgr, finder, pair, key) = setup();
        mgr.create_own(&finder, key, &pair).unwrap();
        mgr.set_enrolled_height(&key, 10).unwrap();

        assert!(mgr.active_at(10).is_empty());
        assert_eq!(mgr.active_at(11).len(), 1);
        assert_eq!(mgr.active_at(18).len(), 1);
        assert!(mgr.active_at(19).is_empty());
    }

    #[test]
    fn own_reveals_follow_the_chain() {
        let (mut mgr, finder, pair, key) = setup();
        let enrollment = mgr.create_own(&finder, key, &pair).unwrap();
        mgr.set_enrolled_height(&key, 0).unwrap();

        // Height 1 reveals the seed; height 2 its pre-image.
        let first = mgr.own_reveal(1).unwrap();
        assert_eq!(first.hash, enrollment.random_seed);
        let second = mgr.own_reveal(2).unwrap();
        assert_eq!(Hash::digest(&second.hash.0), first.hash);
        // Past the chain, nothing is left to reveal.
        assert!(mgr.own_reveal(9).is_none());
        assert!(mgr.own_reveal(8).is_some());
    }

    #[test]
    fn remove_is_idempotent() {
        let (mut mgr, finder, pair, key) = setup();
        mgr.create_own(&finder, key, &pair).unwrap();
        mgr.remove(&key).unwrap();
        assert!(!mgr.has(&key));
        mgr.remove(&key).unwrap();
    }
}
