//! Pre-image hash chains.
//!
//! A validator draws a random scalar `s₀` and derives `h₁ = H(s₀)`,
//! `h_{i+1} = H(h_i)`. The terminal element is published at enrollment time
//! as the `random_seed`; earlier elements are revealed one per block, newest
//! to oldest, so a revealed element always hashes to an already-known one.

use curve25519_dalek::Scalar;
use rand::rngs::OsRng;
use stoa_types::app::Hash;
use stoa_types::error::CryptoError;

/// The full chain a validator keeps private for one enrollment cycle.
///
/// `chain[i]` holds `h_{i+1}`, so the element revealed at cycle offset `k`
/// is `chain[len - 1 - k]` and `chain[len - 1]` is the published seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreimageChain {
    chain: Vec<Hash>,
}

impl PreimageChain {
    /// Draws a fresh `s₀` and derives a chain of `length` elements.
    pub fn generate(length: u32) -> PreimageChain {
        let s0 = Scalar::random(&mut OsRng);
        Self::from_initial(&Hash(s0.to_bytes()), length)
    }

    /// Derives a chain of `length` elements from a fixed initial secret.
    pub fn from_initial(s0: &Hash, length: u32) -> PreimageChain {
        let mut chain = Vec::with_capacity(length as usize);
        let mut current = Hash::digest(&s0.0);
        for _ in 0..length {
            chain.push(current);
            current = Hash::digest(&current.0);
        }
        PreimageChain { chain }
    }

    /// Restores a persisted chain.
    pub fn from_elements(chain: Vec<Hash>) -> PreimageChain {
        PreimageChain { chain }
    }

    /// The published terminal element.
    pub fn seed(&self) -> Option<Hash> {
        self.chain.last().copied()
    }

    /// Chain length.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// True for a zero-length chain.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// The element revealed at cycle offset `k` (0 is the seed itself).
    pub fn reveal_at(&self, k: u64) -> Option<Hash> {
        self.chain
            .len()
            .checked_sub(1 + k as usize)
            .and_then(|i| self.chain.get(i).copied())
    }

    /// The stored elements, oldest first. Used for persistence.
    pub fn elements(&self) -> &[Hash] {
        &self.chain
    }
}

/// Checks that `revealed` hashes forward to `known` in exactly `distance`
/// steps, where `known` is an element revealed earlier (or the seed).
pub fn verify_reveal(revealed: &Hash, distance: u64, known: &Hash) -> Result<(), CryptoError> {
    if distance == 0 {
        return if revealed == known {
            Ok(())
        } else {
            Err(CryptoError::HashChain(
                "re-revealed element differs from the known one".to_string(),
            ))
        };
    }
    let mut current = *revealed;
    for _ in 0..distance {
        current = Hash::digest(&current.0);
    }
    if current == *known {
        Ok(())
    } else {
        Err(CryptoError::HashChain(format!(
            "element does not reach the known hash in {distance} steps"
        )))
    }
}
