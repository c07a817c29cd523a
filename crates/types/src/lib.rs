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
//! Core data model, canonical codec, and error taxonomy for the stoa kernel.

/// Application-level data structures: transactions, blocks, enrollments,
/// consensus statements and quorum sets.
pub mod app;
/// The deterministic, canonical binary codec used for all consensus-critical
/// hashing, signing, and persistence.
pub mod codec;
/// Node and consensus configuration structures.
pub mod config;
/// Typed errors for every subsystem, with stable machine-readable codes.
pub mod error;
/// Constants for well-known persistent-store keys.
pub mod keys;
