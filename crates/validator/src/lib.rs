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
//! Validator machinery for the stoa kernel: the enrollment registry, revealed
//! pre-image tracking, deterministic quorum construction, and the collective
//! block-signing protocol.

/// The enrollment registry and the node's own enrollment data.
pub mod enrollment;
/// Tracking of pre-images revealed by enrolled validators.
pub mod preimage;
/// Deterministic stake-weighted quorum construction and verification.
pub mod quorum;
/// Collective Schnorr block signing and verification.
pub mod signer;

pub use enrollment::EnrollmentManager;
pub use preimage::PreimageTracker;
pub use quorum::QuorumBuilder;
pub use signer::SignerSet;
