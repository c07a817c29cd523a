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
//! Trait seams between the stoa kernel's subsystems.
//!
//! Each subsystem depends on these interfaces rather than on each other's
//! concrete types: the consensus driver sees its environment through
//! [`consensus::DriverHooks`], the enrollment registry reads coins through
//! [`ledger::UtxoFinder`] and persists through [`storage::KvStore`], and the
//! node's peer surface is [`network::NetworkClient`].

/// The consensus driver's capability surface.
pub mod consensus;
/// Read access to the UTXO set.
pub mod ledger;
/// The logical peer RPC surface.
pub mod network;
/// Durable key-value persistence.
pub mod storage;

pub use consensus::{DriverHooks, TimerClass, ValueValidity};
pub use ledger::UtxoFinder;
pub use network::NetworkClient;
pub use storage::{KvStore, MemoryStore};
