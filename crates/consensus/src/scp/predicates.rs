//! Federated-voting predicates over quorum sets.
//!
//! The two building blocks of federated agreement: a statement is *accepted*
//! once a v-blocking set asserts it (they intersect every slice, so the node
//! cannot make progress against them) or once a full quorum votes for it; it
//! is *confirmed* once a full quorum asserts acceptance. Quorum discovery is
//! transitive — a set of nodes only forms a quorum if every member's own
//! slice is satisfied within the set — and computed as a fixpoint that prunes
//! unsatisfied members.

use std::collections::{BTreeMap, BTreeSet};
use stoa_types::app::{PublicKey, QuorumSet, ScpStatement};

/// Whether `nodes` satisfies one slice of `qset`: at least `threshold` of its
/// direct members (validators and nested sets) are present.
pub(crate) fn is_quorum_slice(qset: &QuorumSet, nodes: &BTreeSet<PublicKey>) -> bool {
    let mut satisfied = qset.validators.iter().filter(|v| nodes.contains(v)).count();
    satisfied += qset
        .inner_sets
        .iter()
        .filter(|inner| is_quorum_slice(inner, nodes))
        .count();
    satisfied >= qset.threshold as usize
}

/// Whether `nodes` blocks `qset`: no slice can be satisfied without touching
/// `nodes`. Equivalently, more than `members - threshold` direct members are
/// hit.
pub(crate) fn is_v_blocking(qset: &QuorumSet, nodes: &BTreeSet<PublicKey>) -> bool {
    if qset.threshold == 0 {
        return false;
    }
    let need = qset.member_count() - qset.threshold as usize + 1;
    let mut hit = qset.validators.iter().filter(|v| nodes.contains(v)).count();
    hit += qset
        .inner_sets
        .iter()
        .filter(|inner| is_v_blocking(inner, nodes))
        .count();
    hit >= need
}

/// Whether some subset of `nodes` forms a quorum containing a slice of
/// `local`. Nodes whose own slice cannot be satisfied within the set are
/// pruned until a fixpoint is reached.
pub(crate) fn find_quorum<F>(
    local: &QuorumSet,
    mut nodes: BTreeSet<PublicKey>,
    qset_of: F,
) -> bool
where
    F: Fn(&PublicKey) -> Option<QuorumSet>,
{
    loop {
        if nodes.is_empty() {
            return false;
        }
        let pruned: BTreeSet<PublicKey> = nodes
            .iter()
            .filter(|node| match qset_of(node) {
                Some(qset) => is_quorum_slice(&qset, &nodes),
                None => false,
            })
            .copied()
            .collect();
        if pruned.len() == nodes.len() {
            return is_quorum_slice(local, &pruned);
        }
        nodes = pruned;
    }
}

/// The accept rule of federated voting: true once a v-blocking set has
/// accepted the statement, or once a quorum has voted for or accepted it.
pub(crate) fn federated_accept<V, A, F>(
    local: &QuorumSet,
    voted: V,
    accepted: A,
    statements: &BTreeMap<PublicKey, ScpStatement>,
    qset_of: F,
) -> bool
where
    V: Fn(&ScpStatement) -> bool,
    A: Fn(&ScpStatement) -> bool,
    F: Fn(&PublicKey) -> Option<QuorumSet>,
{
    let accepting: BTreeSet<PublicKey> = statements
        .iter()
        .filter(|(_, st)| accepted(st))
        .map(|(node, _)| *node)
        .collect();
    if is_v_blocking(local, &accepting) {
        return true;
    }
    let voting: BTreeSet<PublicKey> = statements
        .iter()
        .filter(|(_, st)| voted(st) || accepted(st))
        .map(|(node, _)| *node)
        .collect();
    find_quorum(local, voting, qset_of)
}

/// The confirm rule: a quorum asserts acceptance.
pub(crate) fn federated_ratify<A, F>(
    local: &QuorumSet,
    accepted: A,
    statements: &BTreeMap<PublicKey, ScpStatement>,
    qset_of: F,
) -> bool
where
    A: Fn(&ScpStatement) -> bool,
    F: Fn(&PublicKey) -> Option<QuorumSet>,
{
    let accepting: BTreeSet<PublicKey> = statements
        .iter()
        .filter(|(_, st)| accepted(st))
        .map(|(node, _)| *node)
        .collect();
    find_quorum(local, accepting, qset_of)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> PublicKey {
        PublicKey([n; 32])
    }

    fn flat(threshold: u32, members: &[u8]) -> QuorumSet {
        QuorumSet {
            threshold,
            validators: members.iter().map(|&n| key(n)).collect(),
            inner_sets: vec![],
        }
    }

    fn set(members: &[u8]) -> BTreeSet<PublicKey> {
        members.iter().map(|&n| key(n)).collect()
    }

    #[test]
    fn slice_needs_threshold_members() {
        let qset = flat(2, &[1, 2, 3]);
        assert!(is_quorum_slice(&qset, &set(&[1, 2])));
        assert!(is_quorum_slice(&qset, &set(&[1, 2, 3])));
        assert!(!is_quorum_slice(&qset, &set(&[3])));
    }

    #[test]
    fn nested_sets_count_as_one_member() {
        let qset = QuorumSet {
            threshold: 2,
            validators: vec![key(1)],
            inner_sets: vec![flat(1, &[2, 3])],
        };
        assert!(is_quorum_slice(&qset, &set(&[1, 3])));
        assert!(!is_quorum_slice(&qset, &set(&[1])));
    }

    #[test]
    fn unanimous_threshold_makes_every_member_blocking() {
        let qset = flat(3, &[1, 2, 3]);
        assert!(is_v_blocking(&qset, &set(&[2])));
        assert!(!is_v_blocking(&qset, &set(&[9])));

        let majority = flat(2, &[1, 2, 3]);
        assert!(!is_v_blocking(&majority, &set(&[2])));
        assert!(is_v_blocking(&majority, &set(&[2, 3])));
    }

    #[test]
    fn zero_threshold_blocks_nothing() {
        let qset = flat(0, &[1, 2]);
        assert!(!is_v_blocking(&qset, &set(&[1, 2])));
    }

    #[test]
    fn quorum_search_prunes_unsatisfied_members() {
        // Nodes 1..=3 all use the same unanimous slice. With node 3 missing
        // its quorum set, the remaining pair cannot satisfy anyone's slice.
        let shared = flat(3, &[1, 2, 3]);
        let resolve = |node: &PublicKey| {
            if *node == key(3) {
                None
            } else {
                Some(shared.clone())
            }
        };
        assert!(!find_quorum(&shared, set(&[1, 2, 3]), resolve));

        let resolve_all = |_: &PublicKey| Some(shared.clone());
        assert!(find_quorum(&shared, set(&[1, 2, 3]), resolve_all));
        assert!(!find_quorum(&shared, set(&[1, 2]), resolve_all));
    }

    #[test]
    fn overlapping_quorums_intersect_through_search() {
        // 1 trusts {1,2}, 2 trusts {2,3}, 3 trusts {1,3}: the whole triangle
        // is a quorum for each of them.
        let q1 = flat(2, &[1, 2]);
        let q2 = flat(2, &[2, 3]);
        let q3 = flat(2, &[1, 3]);
        let resolve = move |node: &PublicKey| {
            if *node == key(1) {
                Some(q1.clone())
            } else if *node == key(2) {
                Some(q2.clone())
            } else if *node == key(3) {
                Some(q3.clone())
            } else {
                None
            }
        };
        assert!(find_quorum(&flat(2, &[1, 2]), set(&[1, 2, 3]), resolve));
    }
}
