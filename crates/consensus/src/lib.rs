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
//! The federated-agreement state machine for the stoa kernel.
//!
//! One [`scp::Scp`] driver owns one slot per block height. A slot moves
//! through nomination (which values should the block hold), balloting
//! (prepare/confirm over a concrete value), and finally externalization,
//! after which the value is irrevocable and handed to the ledger. The driver
//! talks to the rest of the node exclusively through
//! [`stoa_api::consensus::DriverHooks`].

/// The driver, slots, and the two per-slot protocols.
pub mod scp;
/// Per-slot cooperative timers with watermark cancellation.
pub mod timer;

pub use scp::{EnvelopeState, Scp, SlotPhase};
