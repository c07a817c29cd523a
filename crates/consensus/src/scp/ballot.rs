//! The ballot protocol: prepare, confirm, and externalize a concrete value.
//!
//! A ballot is a `(counter, value)` pair. Preparing a ballot aborts every
//! lower incompatible ballot; committing locks the value in. Each transition
//! runs the federated accept/confirm rules over the latest ballot statement
//! of every node:
//!
//! `vote-prepare → accept-prepare → confirm-prepare → vote-commit →
//!  accept-commit → confirm-commit → externalize`
//!
//! Counters only ever move up; a ballot timeout bumps the counter so a
//! wedged round can retry with the same value.

use super::predicates::{federated_accept, federated_ratify};
use super::slot::ProtocolContext;
use std::collections::{BTreeMap, BTreeSet};
use stoa_types::app::{
    Ballot, PublicKey, ScpConfirm, ScpExternalize, ScpPledges, ScpPrepare, ScpStatement, Value,
};
use tracing::{debug, info, trace};

/// Ballot-phase progress for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum BallotPhase {
    /// Still preparing; nothing committed.
    Prepare,
    /// A commit has been accepted.
    Confirm,
    /// The commit is confirmed; the value is final.
    Externalize,
}

/// Ballot-protocol state for one slot.
#[derive(Debug)]
pub(crate) struct BallotState {
    phase: BallotPhase,
    /// The ballot currently being tried.
    ballot: Option<Ballot>,
    /// Highest ballot accepted as prepared.
    prepared: Option<Ballot>,
    /// Highest accepted-prepared ballot incompatible with `prepared`.
    prepared_prime: Option<Ballot>,
    /// Highest confirmed-prepared ballot (`h`).
    high: Option<Ballot>,
    /// Lowest ballot of the commit range being voted or accepted (`c`).
    commit: Option<Ballot>,
    /// Latest ballot statement per node, own statement included.
    statements: BTreeMap<PublicKey, ScpStatement>,
    /// Set once, on confirm-commit.
    externalized: Option<Value>,
}

impl Default for BallotState {
    fn default() -> Self {
        Self {
            phase: BallotPhase::Prepare,
            ballot: None,
            prepared: None,
            prepared_prime: None,
            high: None,
            commit: None,
            statements: BTreeMap::new(),
            externalized: None,
        }
    }
}

/// `a` covers `c`: same value, at least the counter.
fn covers(a: &Ballot, c: &Ballot) -> bool {
    a.value == c.value && a.counter >= c.counter
}

impl BallotState {
    pub(crate) fn started(&self) -> bool {
        self.ballot.is_some()
    }

    pub(crate) fn externalized(&self) -> Option<&Value> {
        self.externalized.as_ref()
    }

    /// Installs an externalized value directly, bypassing the protocol. Used
    /// only when replaying ledger history at startup.
    pub(crate) fn force_externalize(&mut self, value: Value) {
        self.phase = BallotPhase::Externalize;
        let ballot = Ballot {
            counter: 1,
            value: value.clone(),
        };
        self.ballot = Some(ballot.clone());
        self.commit = Some(ballot.clone());
        self.high = Some(ballot);
        self.externalized = Some(value);
    }

    /// True once the protocol can no longer switch values: a commit vote is
    /// out or the prepare phase is over.
    pub(crate) fn locked(&self) -> bool {
        self.phase != BallotPhase::Prepare || self.commit.is_some()
    }

    /// Starts balloting on `value`, or re-targets a running prepare round
    /// when nomination has converged on a different combined value. A value
    /// change advances the counter so the statement supersedes the old one.
    pub(crate) fn bump(&mut self, ctx: &ProtocolContext<'_>, value: Value) -> Option<Value> {
        if self.locked() || self.externalized.is_some() {
            return None;
        }
        let counter = match &self.ballot {
            None => 1,
            Some(b) if b.value == value => return None,
            Some(b) => b.counter + 1,
        };
        self.ballot = Some(Ballot { counter, value });
        debug!(slot = ctx.slot_index, counter, "ballot started");
        self.emit(ctx);
        self.advance(ctx)
    }

    /// Ballot-timeout handling: move to the next counter to force progress.
    pub(crate) fn bump_counter(&mut self, ctx: &ProtocolContext<'_>) -> Option<Value> {
        if self.externalized.is_some() {
            return None;
        }
        let Some(current) = self.ballot.clone() else {
            return None;
        };
        // Retry with the confirmed-prepared value when one exists; it is the
        // value the network is converging on.
        let value = self
            .high
            .as_ref()
            .map(|h| h.value.clone())
            .unwrap_or(current.value);
        self.ballot = Some(Ballot {
            counter: current.counter + 1,
            value,
        });
        debug!(
            slot = ctx.slot_index,
            counter = current.counter + 1,
            "ballot counter bumped"
        );
        self.emit(ctx);
        self.advance(ctx)
    }

    /// Feeds one peer statement into the protocol. Returns the externalized
    /// value when this statement completed the slot.
    pub(crate) fn process(
        &mut self,
        ctx: &ProtocolContext<'_>,
        statement: ScpStatement,
    ) -> Option<Value> {
        if self.externalized.is_some() {
            return None;
        }
        if !sane_ballot_statement(&statement) {
            trace!(node = %statement.node_id, "malformed ballot statement dropped");
            return None;
        }
        if !self.is_newer(&statement) {
            trace!(node = %statement.node_id, "stale ballot statement ignored");
            return None;
        }
        self.statements.insert(statement.node_id, statement);
        self.advance(ctx)
    }

    /// Runs every transition rule until none applies, emitting at most one
    /// updated statement per change.
    fn advance(&mut self, ctx: &ProtocolContext<'_>) -> Option<Value> {
        loop {
            let mut changed = false;
            changed |= self.attempt_accept_prepared(ctx);
            changed |= self.attempt_confirm_prepared(ctx);
            changed |= self.attempt_accept_commit(ctx);
            if self.attempt_confirm_commit(ctx) {
                return self.externalized.clone();
            }
            if !changed {
                return None;
            }
        }
    }

    /// Every ballot mentioned by any statement, highest first, that could
    /// become accepted-prepared.
    fn prepare_candidates(&self) -> Vec<Ballot> {
        let mut seen: BTreeSet<Ballot> = BTreeSet::new();
        for st in self.statements.values() {
            match &st.pledges {
                ScpPledges::Prepare(p) => {
                    seen.insert(p.ballot.clone());
                    if let Some(prepared) = &p.prepared {
                        seen.insert(prepared.clone());
                    }
                    if let Some(prime) = &p.prepared_prime {
                        seen.insert(prime.clone());
                    }
                }
                ScpPledges::Confirm(c) => {
                    seen.insert(c.ballot.clone());
                    seen.insert(Ballot {
                        counter: c.n_prepared,
                        value: c.ballot.value.clone(),
                    });
                }
                ScpPledges::Externalize(e) => {
                    seen.insert(e.commit.clone());
                }
                ScpPledges::Nominate(_) => {}
            }
        }
        if let Some(b) = &self.ballot {
            seen.insert(b.clone());
        }
        seen.into_iter().rev().collect()
    }

    fn attempt_accept_prepared(&mut self, ctx: &ProtocolContext<'_>) -> bool {
        let mut changed = false;
        for candidate in self.prepare_candidates() {
            if self.prepared.as_ref().is_some_and(|p| covers(p, &candidate)) {
                continue;
            }
            if self
                .prepared_prime
                .as_ref()
                .is_some_and(|p| covers(p, &candidate))
            {
                continue;
            }
            let accepted = federated_accept(
                ctx.local_qset,
                |st| votes_prepare(st, &candidate),
                |st| accepts_prepare(st, &candidate),
                &self.statements,
                ctx.resolver(&self.statements),
            );
            if accepted {
                debug!(slot = ctx.slot_index, counter = candidate.counter, "ballot accepted prepared");
                self.set_prepared(candidate);
                self.emit(ctx);
                changed = true;
                break;
            }
        }
        changed
    }

    /// Records a newly accepted-prepared ballot, keeping `prepared` the
    /// highest and `prepared_prime` the highest with a different value.
    fn set_prepared(&mut self, candidate: Ballot) {
        match &self.prepared {
            Some(p) if *p >= candidate => {
                if p.value != candidate.value
                    && self.prepared_prime.as_ref().map_or(true, |pp| *pp < candidate)
                {
                    self.prepared_prime = Some(candidate);
                }
            }
            Some(p) => {
                if p.value != candidate.value {
                    self.prepared_prime = self.prepared.take();
                }
                self.prepared = Some(candidate);
            }
            None => self.prepared = Some(candidate),
        }
    }

    fn attempt_confirm_prepared(&mut self, ctx: &ProtocolContext<'_>) -> bool {
        let mut changed = false;
        for candidate in self.prepare_candidates() {
            if self.high.as_ref().is_some_and(|h| covers(h, &candidate)) {
                continue;
            }
            let confirmed = federated_ratify(
                ctx.local_qset,
                |st| accepts_prepare(st, &candidate),
                &self.statements,
                ctx.resolver(&self.statements),
            );
            if confirmed {
                debug!(slot = ctx.slot_index, counter = candidate.counter, "ballot confirmed prepared");
                self.high = Some(candidate.clone());
                // Adopt the converged value if we were balloting another;
                // counters never go down, so peers treat the update as newer.
                let compatible = self
                    .ballot
                    .as_ref()
                    .is_some_and(|b| b.value == candidate.value);
                if !compatible {
                    let counter = self
                        .ballot
                        .as_ref()
                        .map_or(candidate.counter, |b| b.counter.max(candidate.counter));
                    self.ballot = Some(Ballot {
                        counter,
                        value: candidate.value.clone(),
                    });
                }
                // Start voting to commit, unless a higher incompatible
                // prepared ballot has aborted these counters.
                if self.commit.is_none() {
                    let aborted = self
                        .prepared
                        .as_ref()
                        .is_some_and(|p| p.value != candidate.value && p.counter >= candidate.counter)
                        || self
                            .prepared_prime
                            .as_ref()
                            .is_some_and(|p| {
                                p.value != candidate.value && p.counter >= candidate.counter
                            });
                    let ballot_counter = self.ballot.as_ref().map_or(1, |b| b.counter);
                    if !aborted && ballot_counter <= candidate.counter {
                        self.commit = Some(Ballot {
                            counter: ballot_counter,
                            value: candidate.value.clone(),
                        });
                    }
                }
                self.emit(ctx);
                changed = true;
                break;
            }
        }
        changed
    }

    /// Boundary commit counters mentioned by any statement for `value`. Only
    /// boundaries need testing: each statement's commit assertion is an
    /// interval, so acceptance over an arbitrary range is decided at its
    /// endpoints.
    fn commit_candidates(&self, value: &Value) -> BTreeSet<u32> {
        let mut counters = BTreeSet::new();
        for st in self.statements.values() {
            match &st.pledges {
                ScpPledges::Prepare(p) => {
                    if p.ballot.value == *value && p.n_c != 0 {
                        counters.insert(p.n_c);
                        counters.insert(p.n_h);
                    }
                }
                ScpPledges::Confirm(c) => {
                    if c.ballot.value == *value {
                        counters.insert(c.n_commit);
                        counters.insert(c.n_h);
                    }
                }
                ScpPledges::Externalize(e) => {
                    if e.commit.value == *value {
                        counters.insert(e.commit.counter);
                        counters.insert(e.n_h);
                    }
                }
                ScpPledges::Nominate(_) => {}
            }
        }
        counters
    }

    fn attempt_accept_commit(&mut self, ctx: &ProtocolContext<'_>) -> bool {
        if self.phase != BallotPhase::Prepare {
            return false;
        }
        // A node can accept a commit through a v-blocking set even before it
        // voted to commit itself, so fall back to the confirmed-prepared
        // value when no commit vote is pending.
        let value = match self.commit.as_ref().or(self.high.as_ref()) {
            Some(b) => b.value.clone(),
            None => return false,
        };
        let accepted: Vec<u32> = self
            .commit_candidates(&value)
            .into_iter()
            .filter(|&counter| {
                federated_accept(
                    ctx.local_qset,
                    |st| votes_commit(st, counter, &value),
                    |st| accepts_commit(st, counter, &value),
                    &self.statements,
                    ctx.resolver(&self.statements),
                )
            })
            .collect();
        let (Some(&low), Some(&high)) = (accepted.first(), accepted.last()) else {
            return false;
        };
        info!(slot = ctx.slot_index, low, high, "commit accepted");
        self.phase = BallotPhase::Confirm;
        self.commit = Some(Ballot {
            counter: low,
            value: value.clone(),
        });
        self.high = Some(Ballot {
            counter: high,
            value: value.clone(),
        });
        let counter = self.ballot.as_ref().map_or(high, |b| b.counter.max(high));
        self.ballot = Some(Ballot { counter, value });
        self.emit(ctx);
        true
    }

    fn attempt_confirm_commit(&mut self, ctx: &ProtocolContext<'_>) -> bool {
        if self.phase != BallotPhase::Confirm {
            return false;
        }
        let value = match &self.commit {
            Some(c) => c.value.clone(),
            None => return false,
        };
        let confirmed: Vec<u32> = self
            .commit_candidates(&value)
            .into_iter()
            .filter(|&counter| {
                federated_ratify(
                    ctx.local_qset,
                    |st| accepts_commit(st, counter, &value),
                    &self.statements,
                    ctx.resolver(&self.statements),
                )
            })
            .collect();
        let (Some(&low), Some(&high)) = (confirmed.first(), confirmed.last()) else {
            return false;
        };
        info!(slot = ctx.slot_index, low, high, "commit confirmed; value externalized");
        self.phase = BallotPhase::Externalize;
        self.commit = Some(Ballot {
            counter: low,
            value: value.clone(),
        });
        self.high = Some(Ballot {
            counter: high,
            value: value.clone(),
        });
        self.externalized = Some(value);
        self.emit(ctx);
        true
    }

    /// Builds and broadcasts the statement describing the current state.
    fn emit(&mut self, ctx: &ProtocolContext<'_>) {
        let Some(ballot) = self.ballot.clone() else {
            return;
        };
        let pledges = match self.phase {
            BallotPhase::Prepare => ScpPledges::Prepare(ScpPrepare {
                ballot,
                prepared: self.prepared.clone(),
                prepared_prime: self.prepared_prime.clone(),
                n_c: self.commit.as_ref().map_or(0, |c| c.counter),
                n_h: self.high.as_ref().map_or(0, |h| h.counter),
            }),
            BallotPhase::Confirm => ScpPledges::Confirm(ScpConfirm {
                ballot,
                n_prepared: self.prepared.as_ref().map_or(0, |p| p.counter),
                n_commit: self.commit.as_ref().map_or(0, |c| c.counter),
                n_h: self.high.as_ref().map_or(0, |h| h.counter),
            }),
            BallotPhase::Externalize => ScpPledges::Externalize(ScpExternalize {
                commit: self.commit.clone().unwrap_or(ballot),
                n_h: self.high.as_ref().map_or(0, |h| h.counter),
            }),
        };
        let statement = ctx.sign_and_emit(pledges);
        self.statements.insert(ctx.node_id, statement);
    }

    /// Statement ordering: later phases win; within a phase, strictly more
    /// progress wins.
    fn is_newer(&self, incoming: &ScpStatement) -> bool {
        let Some(existing) = self.statements.get(&incoming.node_id) else {
            return true;
        };
        match (&existing.pledges, &incoming.pledges) {
            (ScpPledges::Prepare(old), ScpPledges::Prepare(new)) => {
                let old_rank = (
                    &old.ballot,
                    &old.prepared,
                    &old.prepared_prime,
                    old.n_h,
                    old.n_c,
                );
                let new_rank = (
                    &new.ballot,
                    &new.prepared,
                    &new.prepared_prime,
                    new.n_h,
                    new.n_c,
                );
                new_rank > old_rank
            }
            (ScpPledges::Confirm(old), ScpPledges::Confirm(new)) => {
                (&new.ballot, new.n_prepared, new.n_commit, new.n_h)
                    > (&old.ballot, old.n_prepared, old.n_commit, old.n_h)
            }
            (ScpPledges::Externalize(_), ScpPledges::Externalize(_)) => false,
            (old, new) => phase_rank(new) > phase_rank(old),
        }
    }
}

fn phase_rank(pledges: &ScpPledges) -> u8 {
    match pledges {
        ScpPledges::Nominate(_) => 0,
        ScpPledges::Prepare(_) => 1,
        ScpPledges::Confirm(_) => 2,
        ScpPledges::Externalize(_) => 3,
    }
}

/// Internal-consistency checks on a peer's ballot statement.
fn sane_ballot_statement(statement: &ScpStatement) -> bool {
    match &statement.pledges {
        ScpPledges::Prepare(p) => {
            if p.ballot.counter == 0 {
                return false;
            }
            if let (Some(prepared), Some(prime)) = (&p.prepared, &p.prepared_prime) {
                if prepared.value == prime.value || prime > prepared {
                    return false;
                }
            }
            p.n_c <= p.n_h
        }
        ScpPledges::Confirm(c) => {
            c.ballot.counter != 0 && c.n_commit != 0 && c.n_commit <= c.n_h
        }
        ScpPledges::Externalize(e) => e.commit.counter != 0 && e.commit.counter <= e.n_h,
        ScpPledges::Nominate(_) => false,
    }
}

/// A PREPARE for ballot `b` votes to prepare every lower-or-equal compatible
/// ballot; CONFIRM and EXTERNALIZE are committed to their value entirely.
fn votes_prepare(st: &ScpStatement, c: &Ballot) -> bool {
    match &st.pledges {
        ScpPledges::Prepare(p) => covers(&p.ballot, c),
        ScpPledges::Confirm(confirm) => confirm.ballot.value == c.value,
        ScpPledges::Externalize(e) => e.commit.value == c.value,
        ScpPledges::Nominate(_) => false,
    }
}

fn accepts_prepare(st: &ScpStatement, c: &Ballot) -> bool {
    match &st.pledges {
        ScpPledges::Prepare(p) => {
            p.prepared.as_ref().is_some_and(|prepared| covers(prepared, c))
                || p.prepared_prime.as_ref().is_some_and(|prime| covers(prime, c))
        }
        ScpPledges::Confirm(confirm) => {
            confirm.ballot.value == c.value && confirm.n_prepared >= c.counter
        }
        ScpPledges::Externalize(e) => e.commit.value == c.value,
        ScpPledges::Nominate(_) => false,
    }
}

fn votes_commit(st: &ScpStatement, counter: u32, value: &Value) -> bool {
    match &st.pledges {
        ScpPledges::Prepare(p) => {
            p.ballot.value == *value && p.n_c != 0 && p.n_c <= counter && counter <= p.n_h
        }
        ScpPledges::Confirm(c) => c.ballot.value == *value && c.n_commit <= counter,
        ScpPledges::Externalize(e) => e.commit.value == *value && e.commit.counter <= counter,
        ScpPledges::Nominate(_) => false,
    }
}

fn accepts_commit(st: &ScpStatement, counter: u32, value: &Value) -> bool {
    match &st.pledges {
        ScpPledges::Confirm(c) => {
            c.ballot.value == *value && c.n_commit <= counter && counter <= c.n_h
        }
        ScpPledges::Externalize(e) => {
            e.commit.value == *value && e.commit.counter <= counter && counter <= e.n_h
        }
        ScpPledges::Nominate(_) | ScpPledges::Prepare(_) => false,
    }
}
