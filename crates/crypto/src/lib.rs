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
//! Cryptographic primitives for the stoa kernel: Schnorr signatures over
//! ristretto255 and the pre-image hash chains that bind per-block nonces.

/// Pre-image hash chains revealed one element per block.
pub mod hashchain;
/// Schnorr signing, verification, and additive aggregation.
pub mod schnorr;

pub use hashchain::PreimageChain;
pub use schnorr::Pair;
