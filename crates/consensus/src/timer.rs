//! Per-slot cooperative timers with watermark cancellation.
//!
//! Timer ids grow monotonically per class. A callback may already be in
//! flight when the slot wants to cancel, so cancellation never touches the
//! callback itself: the watermark is advanced past every outstanding id and
//! the callback's own validity check turns it into a no-op. Only the newest
//! id of a class is live; an id that has been superseded by a later schedule
//! is equally dead.

use std::collections::HashMap;
use stoa_api::consensus::TimerClass;

/// Timer bookkeeping for one slot.
#[derive(Debug, Default)]
pub struct SlotTimers {
    next_id: HashMap<TimerClass, u64>,
    watermark: HashMap<TimerClass, u64>,
}

impl SlotTimers {
    /// Creates empty bookkeeping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next id for `class`. The caller passes the id to the
    /// host scheduler; when it fires, [`SlotTimers::is_live`] decides whether
    /// the callback still applies.
    pub fn schedule(&mut self, class: TimerClass) -> u64 {
        let next = self.next_id.entry(class).or_insert(0);
        let id = *next;
        *next += 1;
        id
    }

    /// Cancels every outstanding timer of `class` by advancing the watermark
    /// above all allocated ids.
    pub fn cancel_all(&mut self, class: TimerClass) {
        let next = self.next_id.get(&class).copied().unwrap_or(0);
        self.watermark.insert(class, next);
    }

    /// Whether a fired `(class, id)` callback is still the live one: at or
    /// above the cancellation watermark and not superseded by a newer id.
    pub fn is_live(&self, class: TimerClass, id: u64) -> bool {
        let next = self.next_id.get(&class).copied().unwrap_or(0);
        let watermark = self.watermark.get(&class).copied().unwrap_or(0);
        id >= watermark && id + 1 == next
    }
}
