//! The canonical binary codec every consensus-critical byte goes through.
//!
//! Thin wrappers around `parity-scale-codec` (SCALE): little-endian integers,
//! compact length prefixes on sequences, field order equal to declaration
//! order, no self-describing tags. Centralizing the codec here ensures every
//! component hashes and persists the exact same byte representation of the
//! same value, which is a consensus requirement — two peers disagreeing on the
//! bytes of a transaction set would never agree on its hash.

use crate::error::SerializationError;
use parity_scale_codec::{Decode, DecodeAll, Encode};

/// Encodes a value into its canonical byte representation.
///
/// Use this for anything that is hashed, signed, or written to the store.
pub fn to_bytes_canonical<T: Encode>(v: &T) -> Vec<u8> {
    v.encode()
}

/// Decodes a value from its canonical byte representation.
///
/// Fails fast on trailing bytes or malformed input; partially-consumed input
/// is treated as an error so that no two byte strings decode to the same value.
pub fn from_bytes_canonical<T: Decode>(b: &[u8]) -> Result<T, SerializationError> {
    T::decode_all(&mut &*b).map_err(|e| SerializationError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[derive(Encode, Decode, Debug, PartialEq, Eq)]
    struct Sample {
        id: u32,
        name: String,
        tags: Vec<u8>,
    }

    #[test]
    fn canonical_roundtrip() {
        let original = Sample {
            id: 42,
            name: "sample".to_string(),
            tags: vec![1, 2, 3],
        };
        let encoded = to_bytes_canonical(&original);
        assert!(!encoded.is_empty());
        let decoded = from_bytes_canonical::<Sample>(&encoded).unwrap();
        assert_eq!(original, decoded);

        let mut set = BTreeSet::new();
        set.insert([1u8; 32]);
        set.insert([2u8; 32]);
        let encoded = to_bytes_canonical(&set);
        let decoded = from_bytes_canonical::<BTreeSet<[u8; 32]>>(&encoded).unwrap();
        assert_eq!(set, decoded);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut encoded = to_bytes_canonical(&7u32);
        encoded.push(0xFF);
        assert!(from_bytes_canonical::<u32>(&encoded).is_err());
    }

    #[test]
    fn integers_are_little_endian() {
        assert_eq!(to_bytes_canonical(&0x0102_0304u32), vec![4, 3, 2, 1]);
        assert_eq!(to_bytes_canonical(&1u64)[0], 1);
    }
}
