//! The nomination protocol: agreeing on a set of candidate values for a slot.
//!
//! Every node votes for the values it wants in the block and echoes the votes
//! of its peers (provided they validate). Federated voting then promotes
//! values to *accepted* and finally to *candidates*; the first candidate set
//! change hands the slot over to the ballot protocol.

use super::predicates::{federated_accept, federated_ratify};
use super::slot::ProtocolContext;
use std::collections::{BTreeMap, BTreeSet};
use stoa_api::consensus::ValueValidity;
use stoa_types::app::{Hash, PublicKey, ScpNominate, ScpPledges, ScpStatement, Value};
use tracing::{debug, trace};

/// Nomination-phase state for one slot.
#[derive(Debug, Default)]
pub(crate) struct NominationState {
    /// Values this node votes for.
    votes: BTreeSet<Value>,
    /// Values accepted as nominated.
    accepted: BTreeSet<Value>,
    /// Values confirmed as nominated.
    candidates: BTreeSet<Value>,
    /// Latest nomination statement per node, own statement included.
    statements: BTreeMap<PublicKey, ScpStatement>,
    /// Whether `nominate` has run at least once.
    started: bool,
}

/// What a round of nomination processing changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct NominationOutcome {
    /// The candidate set grew; the slot should (re-)combine and ballot.
    pub candidates_changed: bool,
}

impl NominationState {
    /// Candidate values ordered by their hash, the order `combine_candidates`
    /// receives them in.
    pub(crate) fn candidates_by_hash(&self) -> Vec<Value> {
        let mut ordered: Vec<(Hash, &Value)> = self
            .candidates
            .iter()
            .map(|v| (Hash::digest(v), v))
            .collect();
        ordered.sort();
        ordered.into_iter().map(|(_, v)| v.clone()).collect()
    }

    /// Votes for `value` (and keeps voting for everything voted before).
    /// Emits an updated NOMINATE statement.
    pub(crate) fn nominate(
        &mut self,
        ctx: &ProtocolContext<'_>,
        value: Value,
    ) -> NominationOutcome {
        self.started = true;
        if self.votes.insert(value) {
            self.emit(ctx);
            self.update_from_statements(ctx)
        } else {
            NominationOutcome::default()
        }
    }

    /// Re-emits the current votes. Called by the nomination timer so that a
    /// lost broadcast does not stall the round.
    pub(crate) fn renominate(&mut self, ctx: &ProtocolContext<'_>) {
        if self.started {
            self.emit(ctx);
        }
    }

    /// Feeds one peer statement into the protocol.
    pub(crate) fn process(
        &mut self,
        ctx: &ProtocolContext<'_>,
        statement: ScpStatement,
    ) -> NominationOutcome {
        let nominate = match &statement.pledges {
            ScpPledges::Nominate(n) => n,
            _ => return NominationOutcome::default(),
        };
        if !self.is_newer(&statement.node_id, nominate) {
            trace!(node = %statement.node_id, "stale nomination statement ignored");
            return NominationOutcome::default();
        }

        // Echo peer votes, so that a value proposed by one node can gather a
        // full quorum of voters. The slot stops feeding this protocol once
        // the ballot locks in a commit, which bounds the vote set.
        let mut voted_new = false;
        for value in nominate.votes.iter().chain(nominate.accepted.iter()) {
            if !self.votes.contains(value)
                && ctx.hooks.validate_value(ctx.slot_index, value) != ValueValidity::Invalid
            {
                self.votes.insert(value.clone());
                voted_new = true;
            }
        }

        self.statements.insert(statement.node_id, statement);
        let outcome = self.update_from_statements(ctx);
        if voted_new {
            self.emit(ctx);
        }
        outcome
    }

    /// Runs the accept/confirm rules over everything currently on the table.
    fn update_from_statements(&mut self, ctx: &ProtocolContext<'_>) -> NominationOutcome {
        let mut outcome = NominationOutcome::default();
        let mut accepted_new = false;

        let on_table: BTreeSet<Value> = self
            .statements
            .values()
            .filter_map(|st| match &st.pledges {
                ScpPledges::Nominate(n) => Some(n),
                _ => None,
            })
            .flat_map(|n| n.votes.iter().chain(n.accepted.iter()).cloned())
            .chain(self.votes.iter().cloned())
            .collect();

        for value in &on_table {
            if !self.accepted.contains(value) {
                let accepted = federated_accept(
                    ctx.local_qset,
                    |st| statement_votes(st, value),
                    |st| statement_accepts(st, value),
                    &self.statements,
                    ctx.resolver(&self.statements),
                );
                if accepted {
                    debug!(slot = ctx.slot_index, value = %Hash::digest(value), "nominated value accepted");
                    self.votes.insert(value.clone());
                    self.accepted.insert(value.clone());
                    accepted_new = true;
                }
            }
            if self.accepted.contains(value) && !self.candidates.contains(value) {
                let confirmed = federated_ratify(
                    ctx.local_qset,
                    |st| statement_accepts(st, value),
                    &self.statements,
                    ctx.resolver(&self.statements),
                );
                if confirmed {
                    debug!(slot = ctx.slot_index, value = %Hash::digest(value), "nomination candidate confirmed");
                    self.candidates.insert(value.clone());
                    outcome.candidates_changed = true;
                }
            }
        }

        if accepted_new {
            self.emit(ctx);
            // Newly accepted values may immediately confirm against the
            // statements already on the table.
            let follow_up = self.update_from_statements(ctx);
            outcome.candidates_changed |= follow_up.candidates_changed;
        }
        outcome
    }

    /// Builds, signs, broadcasts, and self-records the node's own statement.
    fn emit(&mut self, ctx: &ProtocolContext<'_>) {
        let pledges = ScpPledges::Nominate(ScpNominate {
            votes: sorted_by_hash(&self.votes),
            accepted: sorted_by_hash(&self.accepted),
        });
        let statement = ctx.sign_and_emit(pledges);
        self.statements.insert(ctx.node_id, statement);
    }

    /// A statement replaces the stored one only if it carries strictly more
    /// information: supersets of both vote sets, at least one strictly larger.
    fn is_newer(&self, node: &PublicKey, incoming: &ScpNominate) -> bool {
        let existing = match self.statements.get(node) {
            Some(st) => match &st.pledges {
                ScpPledges::Nominate(n) => n,
                _ => return true,
            },
            None => return true,
        };
        let old_votes: BTreeSet<&Value> = existing.votes.iter().collect();
        let old_accepted: BTreeSet<&Value> = existing.accepted.iter().collect();
        let new_votes: BTreeSet<&Value> = incoming.votes.iter().collect();
        let new_accepted: BTreeSet<&Value> = incoming.accepted.iter().collect();
        new_votes.is_superset(&old_votes)
            && new_accepted.is_superset(&old_accepted)
            && (new_votes.len() > old_votes.len() || new_accepted.len() > old_accepted.len())
    }
}

fn statement_votes(st: &ScpStatement, value: &Value) -> bool {
    match &st.pledges {
        ScpPledges::Nominate(n) => n.votes.contains(value),
        _ => false,
    }
}

fn statement_accepts(st: &ScpStatement, value: &Value) -> bool {
    match &st.pledges {
        ScpPledges::Nominate(n) => n.accepted.contains(value),
        _ => false,
    }
}

fn sorted_by_hash(values: &BTreeSet<Value>) -> Vec<Value> {
    let mut ordered: Vec<(Hash, &Value)> = values.iter().map(|v| (Hash::digest(v), v)).collect();
    ordered.sort();
    ordered.into_iter().map(|(_, v)| v.clone()).collect()
}
