//! The driver, slots, and the two per-slot protocols.

mod ballot;
mod driver;
mod nomination;
mod predicates;
mod slot;

pub use driver::{EnvelopeState, Scp};
pub use slot::SlotPhase;
