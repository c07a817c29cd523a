//! Per-slot state: phase routing between nomination and balloting.
//!
//! Slots never reference the driver; driver-owned capabilities come in as a
//! [`ProtocolContext`] handle on every call, and newly externalized values
//! travel back up the return path so the driver can deliver them in height
//! order.

use super::ballot::BallotState;
use super::nomination::NominationState;
use crate::timer::SlotTimers;
use std::collections::BTreeMap;
use std::time::Duration;
use stoa_api::consensus::{DriverHooks, TimerClass, ValueValidity};
use stoa_types::app::{
    Hash, PublicKey, QuorumSet, ScpEnvelope, ScpPledges, ScpStatement, Value,
};
use tracing::{debug, info, trace};

/// Externally visible phase of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// Gathering candidate values.
    Nominating,
    /// Preparing and committing a concrete value.
    Balloting,
    /// Terminal: a value has been externalized.
    Externalized,
}

/// The driver-owned capabilities a slot borrows for the duration of one call.
pub(crate) struct ProtocolContext<'a> {
    /// This node's key, under which own statements are recorded.
    pub node_id: PublicKey,
    /// The slot being driven.
    pub slot_index: u64,
    /// This node's quorum set.
    pub local_qset: &'a QuorumSet,
    /// Hash of `local_qset`, carried in emitted statements.
    pub local_qset_hash: Hash,
    /// Host capabilities.
    pub hooks: &'a dyn DriverHooks,
    /// Delay of the nomination retry timer.
    pub nomination_timeout: Duration,
    /// Delay of the ballot-counter timer.
    pub ballot_timeout: Duration,
}

impl<'a> ProtocolContext<'a> {
    /// Resolves a peer's quorum set from its latest statement in `statements`.
    pub(crate) fn resolver<'s>(
        &'s self,
        statements: &'s BTreeMap<PublicKey, ScpStatement>,
    ) -> impl Fn(&PublicKey) -> Option<QuorumSet> + 's {
        move |node| {
            statements
                .get(node)
                .and_then(|st| self.hooks.get_quorum_set(&st.quorum_set_hash))
        }
    }

    /// Builds, signs, and broadcasts a statement; returns it for
    /// self-recording.
    pub(crate) fn sign_and_emit(&self, pledges: ScpPledges) -> ScpStatement {
        let statement = ScpStatement {
            node_id: self.node_id,
            slot_index: self.slot_index,
            quorum_set_hash: self.local_qset_hash,
            pledges,
        };
        let signature = self.hooks.sign_envelope(&statement);
        let envelope = ScpEnvelope {
            statement: statement.clone(),
            signature,
        };
        self.hooks.emit_envelope(&envelope);
        statement
    }
}

/// Consensus state for one block height.
pub(crate) struct Slot {
    index: u64,
    nomination: NominationState,
    ballot: BallotState,
    timers: SlotTimers,
    /// Set when the slot was replayed from the ledger rather than agreed
    /// live; such slots skip the externalization callback.
    replayed: bool,
}

impl Slot {
    pub(crate) fn new(index: u64) -> Slot {
        Slot {
            index,
            nomination: NominationState::default(),
            ballot: BallotState::default(),
            timers: SlotTimers::new(),
            replayed: false,
        }
    }

    pub(crate) fn phase(&self) -> SlotPhase {
        if self.ballot.externalized().is_some() {
            SlotPhase::Externalized
        } else if self.ballot.started() {
            SlotPhase::Balloting
        } else {
            SlotPhase::Nominating
        }
    }

    pub(crate) fn externalized(&self) -> Option<&Value> {
        self.ballot.externalized()
    }

    pub(crate) fn replayed(&self) -> bool {
        self.replayed
    }

    /// Proposes `value` for this slot and starts the nomination retry timer.
    pub(crate) fn nominate(&mut self, ctx: &ProtocolContext<'_>, value: Value) -> Option<Value> {
        if self.phase() == SlotPhase::Externalized {
            return None;
        }
        debug!(slot = self.index, "nominating");
        let outcome = self.nomination.nominate(ctx, value);
        self.arm_timer(ctx, TimerClass::Nomination, ctx.nomination_timeout);
        if outcome.candidates_changed {
            self.start_balloting(ctx)
        } else {
            None
        }
    }

    /// Feeds a validated statement into the right protocol. Returns the
    /// value this statement externalized, if any.
    pub(crate) fn process_statement(
        &mut self,
        ctx: &ProtocolContext<'_>,
        statement: ScpStatement,
    ) -> Option<Value> {
        if self.phase() == SlotPhase::Externalized {
            trace!(slot = self.index, "statement for externalized slot ignored");
            return None;
        }
        match &statement.pledges {
            ScpPledges::Nominate(_) => {
                // Nomination keeps absorbing votes while the ballot can still
                // switch values; it freezes once a commit vote is out.
                if self.ballot.locked() {
                    return None;
                }
                let outcome = self.nomination.process(ctx, statement);
                if outcome.candidates_changed {
                    self.start_balloting(ctx)
                } else {
                    None
                }
            }
            _ => {
                let externalized = self.ballot.process(ctx, statement);
                if externalized.is_some() {
                    self.finish(ctx);
                }
                externalized
            }
        }
    }

    /// Combines the confirmed candidates and hands the result to the ballot
    /// protocol.
    fn start_balloting(&mut self, ctx: &ProtocolContext<'_>) -> Option<Value> {
        let candidates = self.nomination.candidates_by_hash();
        let combined = ctx.hooks.combine_candidates(self.index, &candidates)?;
        info!(slot = self.index, candidates = candidates.len(), "candidates combined; balloting");
        self.timers.cancel_all(TimerClass::Nomination);
        self.arm_timer(ctx, TimerClass::Ballot, ctx.ballot_timeout);
        let externalized = self.ballot.bump(ctx, combined);
        if externalized.is_some() {
            self.finish(ctx);
        }
        externalized
    }

    /// Timer dispatch. Stale ids are a no-op by construction.
    pub(crate) fn handle_timer(
        &mut self,
        ctx: &ProtocolContext<'_>,
        class: TimerClass,
        id: u64,
    ) -> Option<Value> {
        if !self.timers.is_live(class, id) {
            trace!(slot = self.index, ?class, id, "stale timer ignored");
            return None;
        }
        match class {
            TimerClass::Nomination => {
                debug!(slot = self.index, "nomination timeout; re-nominating");
                self.nomination.renominate(ctx);
                self.arm_timer(ctx, TimerClass::Nomination, ctx.nomination_timeout);
                None
            }
            TimerClass::Ballot => {
                debug!(slot = self.index, "ballot timeout; bumping counter");
                let externalized = self.ballot.bump_counter(ctx);
                if externalized.is_some() {
                    self.finish(ctx);
                } else {
                    self.arm_timer(ctx, TimerClass::Ballot, ctx.ballot_timeout);
                }
                externalized
            }
        }
    }

    /// Marks the slot externalized without running the protocol. Used when
    /// replaying committed blocks at startup.
    pub(crate) fn restore_externalized(&mut self, value: Value) {
        self.replayed = true;
        self.ballot.force_externalize(value);
        self.timers.cancel_all(TimerClass::Nomination);
        self.timers.cancel_all(TimerClass::Ballot);
    }

    fn finish(&mut self, _ctx: &ProtocolContext<'_>) {
        self.timers.cancel_all(TimerClass::Nomination);
        self.timers.cancel_all(TimerClass::Ballot);
    }

    fn arm_timer(&mut self, ctx: &ProtocolContext<'_>, class: TimerClass, delay: Duration) {
        let id = self.timers.schedule(class);
        ctx.hooks.setup_timer(self.index, class, id, delay);
    }

    /// Statement-level validity used by the driver before any state mutation:
    /// ballot values must not be provably invalid.
    pub(crate) fn statement_value_valid(
        hooks: &dyn DriverHooks,
        statement: &ScpStatement,
    ) -> bool {
        let slot = statement.slot_index;
        let check = |value: &Value| hooks.validate_value(slot, value) != ValueValidity::Invalid;
        match &statement.pledges {
            // Nomination votes are screened at echo time instead; a vote for
            // a value we cannot validate yet must not kill the envelope.
            ScpPledges::Nominate(_) => true,
            ScpPledges::Prepare(p) => check(&p.ballot.value),
            ScpPledges::Confirm(c) => check(&c.ballot.value),
            ScpPledges::Externalize(e) => check(&e.commit.value),
        }
    }
}
