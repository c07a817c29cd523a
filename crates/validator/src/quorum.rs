//! Deterministic stake-weighted quorum construction and verification.
//!
//! Every validator derives its own quorum from the active enrollment set:
//! itself, plus stake-weighted draws from the other validators, with a
//! unanimous threshold. The generator is seeded from the validator's own key
//! so the result is stable across restarts; different validators draw
//! different (but heavily overlapping) sets, and a global intersection check
//! guards the configuration before it is installed.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::{BTreeMap, BTreeSet};
use stoa_types::app::{Amount, Hash, PublicKey, QuorumSet};
use stoa_types::error::QuorumError;
use tracing::{debug, warn};

/// Fewest members a quorum may have (subject to availability).
pub const QUORUM_MIN: usize = 3;
/// Most members a quorum may have.
pub const QUORUM_MAX: usize = 7;

/// Seeding key folded into the generator seed. Fixed for the lifetime of the
/// network so a node rebuilds the same quorum from the same enrollment set.
const SEED_KEY: [u8; 8] = *b"stoa.qb1";

/// One candidate quorum member: an active validator and its frozen stake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStake {
    /// The validator's address.
    pub key: PublicKey,
    /// Its staked amount.
    pub amount: Amount,
}

/// Builds per-validator quorum configurations.
#[derive(Debug, Default)]
pub struct QuorumBuilder;

impl QuorumBuilder {
    /// Derives `own_key`'s quorum from the stakes of the other active
    /// validators. `active_count` is the total number of active enrollments,
    /// which fixes the target size `min(max(3, N + 1), 7)`; the result is
    /// capped by availability.
    pub fn build(own_key: PublicKey, stakes: &[NodeStake], active_count: usize) -> QuorumSet {
        let mut pool: Vec<NodeStake> = stakes
            .iter()
            .filter(|s| s.key != own_key)
            .cloned()
            .collect();
        // Stake-descending, key-ascending for equal stakes, so the draw
        // sequence is a pure function of the input set.
        pool.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.key.cmp(&b.key)));

        let target = QUORUM_MAX.min(QUORUM_MIN.max(active_count + 1));
        let mut rng = ChaCha20Rng::from_seed(seed_for(&own_key));

        let mut members: BTreeSet<PublicKey> = BTreeSet::new();
        members.insert(own_key);
        let total: u128 = pool.iter().map(|s| s.amount.0 as u128).sum();
        while members.len() < target && members.len() <= pool.len() && total > 0 {
            let mut point = rng.gen_range(0..total);
            for stake in &pool {
                let weight = stake.amount.0 as u128;
                if point < weight {
                    // Duplicate draws are rejected; the loop draws again.
                    members.insert(stake.key);
                    break;
                }
                point -= weight;
            }
        }

        let validators: Vec<PublicKey> = members.into_iter().collect();
        debug!(own = %own_key, size = validators.len(), "quorum built");
        QuorumSet {
            threshold: validators.len() as u32,
            validators,
            inner_sets: vec![],
        }
    }

    /// Structural checks on a single configuration: thresholds in range,
    /// members sorted and unique, the owner present, no empty nested sets.
    pub fn verify_sanity(own_key: &PublicKey, qset: &QuorumSet) -> Result<(), QuorumError> {
        fn check(qset: &QuorumSet, depth: u32) -> Result<(), QuorumError> {
            if depth > 2 {
                return Err(QuorumError::Sanity("nesting deeper than two levels".to_string()));
            }
            let members = qset.member_count();
            if members == 0 {
                return Err(QuorumError::Sanity("empty quorum set".to_string()));
            }
            if qset.threshold == 0 || qset.threshold as usize > members {
                return Err(QuorumError::Sanity(format!(
                    "threshold {} out of range for {} members",
                    qset.threshold, members
                )));
            }
            if qset.validators.windows(2).any(|w| w[0] >= w[1]) {
                return Err(QuorumError::Sanity(
                    "members not sorted or not unique".to_string(),
                ));
            }
            for inner in &qset.inner_sets {
                check(inner, depth + 1)?;
            }
            Ok(())
        }
        check(qset, 0)?;
        if !qset.all_validators().contains(own_key) {
            return Err(QuorumError::Sanity("owner missing from own quorum".to_string()));
        }
        Ok(())
    }

    /// The global intersection property: no two validators' quorums may be
    /// disjoint, or the network could externalize two different histories.
    pub fn verify_intersection(
        configs: &BTreeMap<PublicKey, QuorumSet>,
    ) -> Result<(), QuorumError> {
        let flattened: Vec<(&PublicKey, Vec<PublicKey>)> = configs
            .iter()
            .map(|(owner, qset)| (owner, qset.all_validators()))
            .collect();
        for (i, (owner_a, members_a)) in flattened.iter().enumerate() {
            let set_a: BTreeSet<&PublicKey> = members_a.iter().collect();
            for (owner_b, members_b) in flattened.iter().skip(i + 1) {
                if !members_b.iter().any(|m| set_a.contains(m)) {
                    warn!(a = %owner_a, b = %owner_b, "disjoint quorums");
                    return Err(QuorumError::Intersection(format!(
                        "quorums of {owner_a} and {owner_b} are disjoint"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Generator seed: the hash of the validator's key, its first bytes folded
/// with the fixed network key.
fn seed_for(own_key: &PublicKey) -> [u8; 32] {
    let mut seed = Hash::digest(&own_key.0).0;
    for (byte, key_byte) in seed.iter_mut().zip(SEED_KEY.iter()) {
        *byte ^= key_byte;
    }
    seed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> PublicKey {
        PublicKey([n; 32])
    }

    fn stakes(amounts: &[(u8, u64)]) -> Vec<NodeStake> {
        amounts
            .iter()
            .map(|&(n, a)| NodeStake {
                key: key(n),
                amount: Amount(a),
            })
            .collect()
    }

    #[test]
    fn build_is_deterministic_and_self_inclusive() {
        let pool = stakes(&[(1, 40_000), (2, 40_000), (3, 80_000), (4, 40_000)]);
        let a = QuorumBuilder::build(key(9), &pool, 5);
        let b = QuorumBuilder::build(key(9), &pool, 5);
        assert_eq!(a, b);
        assert!(a.validators.contains(&key(9)));
        assert_eq!(a.threshold as usize, a.validators.len());
        assert!(a.validators.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn size_tracks_the_active_count() {
        // Three equal validators: everyone ends up with everyone.
        let pool = stakes(&[(1, 40_000), (2, 40_000), (3, 40_000)]);
        let qset = QuorumBuilder::build(key(2), &pool, 3);
        assert_eq!(qset.validators.len(), 3);

        // Two active enrollments: the target is min(max(3, 3), 7) = 3, but
        // only two keys exist.
        let pool = stakes(&[(1, 40_000), (2, 40_000)]);
        let qset = QuorumBuilder::build(key(2), &pool, 2);
        assert_eq!(qset.validators.len(), 2);
        assert_eq!(qset.threshold, 2);

        // A large set caps at seven members.
        let pool = stakes(&(1..=20u8).map(|n| (n, 40_000)).collect::<Vec<_>>());
        let qset = QuorumBuilder::build(key(1), &pool, 20);
        assert_eq!(qset.validators.len(), QUORUM_MAX);
    }

    #[test]
    fn sanity_accepts_built_configurations() {
        let pool = stakes(&[(1, 40_000), (2, 50_000), (3, 60_000)]);
        let qset = QuorumBuilder::build(key(2), &pool, 4);
        QuorumBuilder::verify_sanity(&key(2), &qset).unwrap();
    }

    #[test]
    fn sanity_rejects_malformed_sets() {
        let owner = key(1);
        let unsorted = QuorumSet {
            threshold: 2,
            validators: vec![key(2), key(1)],
            inner_sets: vec![],
        };
        assert!(QuorumBuilder::verify_sanity(&owner, &unsorted).is_err());

        let zero_threshold = QuorumSet {
            threshold: 0,
            validators: vec![key(1)],
            inner_sets: vec![],
        };
        assert!(QuorumBuilder::verify_sanity(&owner, &zero_threshold).is_err());

        let overweight = QuorumSet {
            threshold: 3,
            validators: vec![key(1), key(2)],
            inner_sets: vec![],
        };
        assert!(QuorumBuilder::verify_sanity(&owner, &overweight).is_err());

        let empty_inner = QuorumSet {
            threshold: 2,
            validators: vec![key(1)],
            inner_sets: vec![QuorumSet::default()],
        };
        assert!(QuorumBuilder::verify_sanity(&owner, &empty_inner).is_err());

        let missing_owner = QuorumSet {
            threshold: 1,
            validators: vec![key(2)],
            inner_sets: vec![],
        };
        assert!(QuorumBuilder::verify_sanity(&owner, &missing_owner).is_err());
    }

    #[test]
    fn intersection_holds_for_built_configurations() {
        let members: Vec<(u8, u64)> = (1..=4).map(|n| (n, 40_000 + n as u64)).collect();
        let pool = stakes(&members);
        let mut configs = BTreeMap::new();
        for (n, _) in &members {
            configs.insert(key(*n), QuorumBuilder::build(key(*n), &pool, 4));
        }
        QuorumBuilder::verify_intersection(&configs).unwrap();
    }

    #[test]
    fn disjoint_quorums_detected() {
        let mut configs = BTreeMap::new();
        configs.insert(
            key(1),
            QuorumSet {
                threshold: 2,
                validators: vec![key(1), key(2)],
                inner_sets: vec![],
            },
        );
        configs.insert(
            key(3),
            QuorumSet {
                threshold: 2,
                validators: vec![key(3), key(4)],
                inner_sets: vec![],
            },
        );
        assert!(matches!(
            QuorumBuilder::verify_intersection(&configs),
            Err(QuorumError::Intersection(_))
        ));
    }
}
