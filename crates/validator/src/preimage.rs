//! Tracking of pre-images revealed by enrolled validators.
//!
//! A reveal for height `h` must hash back, in the right number of steps, to
//! the newest reveal already known for the enrollment (or to its published
//! `random_seed`). Accepted reveals are what later lets a block's collective
//! signature be verified: each participant's per-block nonce commitment is
//! derived from its revealed element.

use std::collections::{BTreeMap, HashMap};
use stoa_crypto::hashchain;
use stoa_types::app::{Enrollment, Hash, PreimageInfo};
use stoa_types::error::CryptoError;
use tracing::{debug, trace};

/// Revealed pre-images per enrollment, keyed by block height.
#[derive(Debug, Default)]
pub struct PreimageTracker {
    revealed: HashMap<Hash, BTreeMap<u64, Hash>>,
}

impl PreimageTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies and stores a revealed pre-image.
    ///
    /// `enrolled_height` is the inclusion height of `enrollment`; the reveal
    /// for height `h` sits `h - (enrolled_height + 1)` steps into the chain.
    /// Returns false for reveals that are already known or out of the
    /// enrollment's cycle.
    pub fn receive(
        &mut self,
        enrollment: &Enrollment,
        enrolled_height: u64,
        info: &PreimageInfo,
    ) -> Result<bool, CryptoError> {
        if info.enroll_key != enrollment.utxo_key {
            return Err(CryptoError::HashChain(
                "reveal does not reference this enrollment".to_string(),
            ));
        }
        let Some(offset) = info.height.checked_sub(enrolled_height + 1) else {
            return Ok(false);
        };
        if offset >= enrollment.cycle_length as u64 {
            return Ok(false);
        }

        let known = self.revealed.entry(info.enroll_key).or_default();
        if let Some(existing) = known.get(&info.height) {
            return if existing == &info.hash {
                Ok(false)
            } else {
                Err(CryptoError::HashChain(
                    "conflicting reveal for the same height".to_string(),
                ))
            };
        }

        // Link against the newest earlier reveal, falling back to the seed.
        // The seed doubles as the reveal for the first active height, so it
        // anchors at `enrolled_height + 1`.
        let (anchor_height, anchor) = known
            .range(..info.height)
            .next_back()
            .map(|(h, hash)| (*h, *hash))
            .unwrap_or((enrolled_height + 1, enrollment.random_seed));
        let distance = info.height - anchor_height;
        hashchain::verify_reveal(&info.hash, distance, &anchor)?;

        trace!(enrollment = %info.enroll_key, height = info.height, "pre-image accepted");
        known.insert(info.height, info.hash);
        Ok(true)
    }

    /// The reveal stored for `enroll_key` at `height`.
    pub fn get(&self, enroll_key: &Hash, height: u64) -> Option<Hash> {
        self.revealed.get(enroll_key)?.get(&height).copied()
    }

    /// Whether any reveal at all is known for `enroll_key`.
    pub fn has_any(&self, enroll_key: &Hash) -> bool {
        self.revealed
            .get(enroll_key)
            .is_some_and(|m| !m.is_empty())
    }

    /// Forgets everything known about an enrollment, e.g. when it expires.
    pub fn forget(&mut self, enroll_key: &Hash) {
        if self.revealed.remove(enroll_key).is_some() {
            debug!(enrollment = %enroll_key, "pre-image history dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoa_crypto::PreimageChain;
    use stoa_types::app::Signature;

    fn enrollment_with_chain(cycle: u32) -> (Enrollment, PreimageChain) {
        let chain = PreimageChain::from_initial(&Hash::digest(b"s0"), cycle);
        let enrollment = Enrollment {
            utxo_key: Hash::digest(b"stake"),
            random_seed: chain.seed().unwrap(),
            cycle_length: cycle,
            enroll_sig: Signature::default(),
        };
        (enrollment, chain)
    }

    fn reveal(enrollment: &Enrollment, chain: &PreimageChain, eh: u64, height: u64) -> PreimageInfo {
        PreimageInfo {
            enroll_key: enrollment.utxo_key,
            hash: chain.reveal_at(height - (eh + 1)).unwrap(),
            height,
        }
    }

    #[test]
    fn sequential_reveals_accepted() {
        let (enrollment, chain) = enrollment_with_chain(8);
        let mut tracker = PreimageTracker::new();
        for height in 1..=8 {
            let info = reveal(&enrollment, &chain, 0, height);
            assert!(tracker.receive(&enrollment, 0, &info).unwrap());
            assert_eq!(tracker.get(&enrollment.utxo_key, height), Some(info.hash));
        }
    }

    #[test]
    fn gap_reveals_verify_over_distance() {
        let (enrollment, chain) = enrollment_with_chain(8);
        let mut tracker = PreimageTracker::new();
        // Skip straight to height 5; the reveal must chain 5 steps back to
        // the seed.
        let info = reveal(&enrollment, &chain, 0, 5);
        assert!(tracker.receive(&enrollment, 0, &info).unwrap());
        // And a later reveal anchors on height 5, not the seed.
        let info = reveal(&enrollment, &chain, 0, 7);
        assert!(tracker.receive(&enrollment, 0, &info).unwrap());
    }

    #[test]
    fn bogus_and_conflicting_reveals_rejected() {
        let (enrollment, chain) = enrollment_with_chain(8);
        let mut tracker = PreimageTracker::new();

        let mut forged = reveal(&enrollment, &chain, 0, 1);
        forged.hash = Hash::digest(b"not-in-chain");
        assert!(tracker.receive(&enrollment, 0, &forged).is_err());

        let good = reveal(&enrollment, &chain, 0, 1);
        assert!(tracker.receive(&enrollment, 0, &good).unwrap());
        // Same height, same hash: idempotent. Different hash: error.
        assert!(!tracker.receive(&enrollment, 0, &good).unwrap());
        let mut conflicting = good.clone();
        conflicting.hash = Hash::digest(b"other");
        assert!(tracker.receive(&enrollment, 0, &conflicting).is_err());
    }

    #[test]
    fn reveals_outside_the_cycle_ignored() {
        let (enrollment, chain) = enrollment_with_chain(8);
        let mut tracker = PreimageTracker::new();
        // At the inclusion height the seed itself is already public.
        let at_inclusion = PreimageInfo {
            enroll_key: enrollment.utxo_key,
            hash: enrollment.random_seed,
            height: 0,
        };
        assert!(!tracker.receive(&enrollment, 0, &at_inclusion).unwrap());
        // Beyond the cycle there is nothing left to reveal.
        let beyond = PreimageInfo {
            enroll_key: enrollment.utxo_key,
            hash: chain.reveal_at(7).unwrap(),
            height: 9,
        };
        assert!(!tracker.receive(&enrollment, 0, &beyond).unwrap());
    }

    #[test]
    fn forget_drops_history() {
        let (enrollment, chain) = enrollment_with_chain(8);
        let mut tracker = PreimageTracker::new();
        let info = reveal(&enrollment, &chain, 0, 1);
        tracker.receive(&enrollment, 0, &info).unwrap();
        assert!(tracker.has_any(&enrollment.utxo_key));
        tracker.forget(&enrollment.utxo_key);
        assert!(!tracker.has_any(&enrollment.utxo_key));
    }
}
