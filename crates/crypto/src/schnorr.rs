//! Schnorr signatures over ristretto255.
//!
//! The single-signer and collective schemes share one verification equation:
//! `s·G == R + c·P` with challenge `c = H(R ‖ P ‖ m)`. Collective signing
//! works because nonces, public keys, and response scalars all add: each
//! participant contributes `s_v = r_v + c·x_v` against the aggregate `R` and
//! aggregate `P`, and the sums satisfy the same equation.

use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::traits::Identity;
use curve25519_dalek::{RistrettoPoint, Scalar};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use stoa_types::app::{Hash, PublicKey, Signature};
use stoa_types::error::CryptoError;
use zeroize::Zeroize;

/// Decompresses a wire public key into a curve point.
pub fn decompress(key: &PublicKey) -> Result<RistrettoPoint, CryptoError> {
    CompressedRistretto(key.0)
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey(format!("not a ristretto point: {key}")))
}

/// Compresses a curve point into a wire public key.
pub fn compress(point: &RistrettoPoint) -> PublicKey {
    PublicKey(point.compress().to_bytes())
}

/// Parses a canonically-encoded scalar.
pub fn scalar_from_bytes(bytes: &[u8; 32]) -> Result<Scalar, CryptoError> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes)).ok_or(CryptoError::InvalidScalar)
}

/// Reduces a 32-byte hash into a scalar. Used to turn revealed pre-images
/// into nonce contributions.
pub fn scalar_from_hash(hash: &Hash) -> Scalar {
    Scalar::from_bytes_mod_order(hash.0)
}

/// The Fiat–Shamir challenge: `H(R ‖ P ‖ m)` reduced mod the group order.
pub fn challenge(nonce: &PublicKey, key: &PublicKey, digest: &Hash) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(nonce.0);
    hasher.update(key.0);
    hasher.update(digest.0);
    Scalar::from_hash(hasher)
}

/// A signing key pair.
pub struct Pair {
    secret: Scalar,
    public: PublicKey,
}

impl Pair {
    /// Generates a fresh random pair.
    pub fn random() -> Pair {
        Pair::from_scalar(Scalar::random(&mut OsRng))
    }

    /// Builds a pair from an existing secret scalar.
    pub fn from_scalar(secret: Scalar) -> Pair {
        let public = compress(&RistrettoPoint::mul_base(&secret));
        Pair { secret, public }
    }

    /// Parses a hex-encoded secret scalar, as carried in node configuration.
    pub fn from_seed_hex(seed: &str) -> Result<Pair, CryptoError> {
        let bytes = hex::decode(seed)
            .map_err(|e| CryptoError::InvalidKey(format!("seed is not hex: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("seed must be 32 bytes".to_string()))?;
        Ok(Pair::from_scalar(Scalar::from_bytes_mod_order(arr)))
    }

    /// The wire public key.
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// The secret scalar. Needed by the collective signer to form partial
    /// responses; never serialized by this crate.
    pub fn secret(&self) -> &Scalar {
        &self.secret
    }

    /// Signs a digest with a fresh random nonce.
    pub fn sign(&self, digest: &Hash) -> Signature {
        let mut nonce = Scalar::random(&mut OsRng);
        let signature = self.sign_with_nonce(&nonce, digest);
        nonce.zeroize();
        signature
    }

    /// Signs a digest with a caller-chosen nonce. Enrollment signatures use
    /// this to publish the signature-noise commitment as the signature's `R`,
    /// which later anchors per-block nonce derivation. The nonce must never
    /// be reused across distinct digests.
    pub fn sign_with_nonce(&self, nonce: &Scalar, digest: &Hash) -> Signature {
        let big_r = compress(&RistrettoPoint::mul_base(nonce));
        let c = challenge(&big_r, &self.public, digest);
        let s = nonce + c * self.secret;
        Signature {
            r: big_r.0,
            s: s.to_bytes(),
        }
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl Clone for Pair {
    fn clone(&self) -> Self {
        Pair {
            secret: self.secret,
            public: self.public,
        }
    }
}

impl std::fmt::Debug for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pair").field("public", &self.public).finish()
    }
}

/// Verifies `sig` over `digest` against `key`.
///
/// `key` may be a single validator's key or an additive aggregate; the
/// equation is the same.
pub fn verify(key: &PublicKey, digest: &Hash, sig: &Signature) -> Result<(), CryptoError> {
    let point = decompress(key)?;
    let big_r = CompressedRistretto(sig.r)
        .decompress()
        .ok_or(CryptoError::InvalidSignature)?;
    let s = scalar_from_bytes(&sig.s).map_err(|_| CryptoError::InvalidSignature)?;
    let c = challenge(&PublicKey(sig.r), key, digest);
    if RistrettoPoint::mul_base(&s) == big_r + c * point {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}

/// Verifies `sig` with an externally supplied challenge scalar.
///
/// Collective block signatures bind the challenge to the *full* validator
/// set's aggregate key while the equation is checked against the sum of the
/// keys that actually participated, so the two cannot be derived from one
/// another inside this function.
pub fn verify_with_challenge(
    key: &PublicKey,
    c: &Scalar,
    sig: &Signature,
) -> Result<(), CryptoError> {
    let point = decompress(key)?;
    let big_r = CompressedRistretto(sig.r)
        .decompress()
        .ok_or(CryptoError::InvalidSignature)?;
    let s = scalar_from_bytes(&sig.s).map_err(|_| CryptoError::InvalidSignature)?;
    if RistrettoPoint::mul_base(&s) == big_r + c * point {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}

/// Sums a set of wire public keys into one curve point.
pub fn sum_points<'a, I>(keys: I) -> Result<RistrettoPoint, CryptoError>
where
    I: IntoIterator<Item = &'a PublicKey>,
{
    let mut acc = RistrettoPoint::identity();
    for key in keys {
        acc += decompress(key)?;
    }
    Ok(acc)
}

/// Sums a set of wire public keys into one aggregate wire key.
pub fn aggregate_keys<'a, I>(keys: I) -> Result<PublicKey, CryptoError>
where
    I: IntoIterator<Item = &'a PublicKey>,
{
    Ok(compress(&sum_points(keys)?))
}

/// Forms one participant's response scalar: `s_v = nonce + c·secret`.
pub fn partial_response(secret: &Scalar, nonce: &Scalar, c: &Scalar) -> [u8; 32] {
    (nonce + c * secret).to_bytes()
}

/// Combines an aggregate nonce with the participants' response scalars.
pub fn combine_partials<'a, I>(aggregate_nonce: &PublicKey, partials: I) -> Result<Signature, CryptoError>
where
    I: IntoIterator<Item = &'a [u8; 32]>,
{
    let mut s = Scalar::ZERO;
    for partial in partials {
        s += scalar_from_bytes(partial)?;
    }
    Ok(Signature {
        r: aggregate_nonce.0,
        s: s.to_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let pair = Pair::random();
        let digest = Hash::digest(b"message");
        let sig = pair.sign(&digest);
        assert!(verify(&pair.public(), &digest, &sig).is_ok());
        assert!(verify(&pair.public(), &Hash::digest(b"other"), &sig).is_err());

        let stranger = Pair::random();
        assert!(verify(&stranger.public(), &digest, &sig).is_err());
    }

    #[test]
    fn seed_hex_is_deterministic() {
        let seed = hex::encode([7u8; 32]);
        let a = Pair::from_seed_hex(&seed).unwrap();
        let b = Pair::from_seed_hex(&seed).unwrap();
        assert_eq!(a.public(), b.public());
        assert!(Pair::from_seed_hex("zz").is_err());
        assert!(Pair::from_seed_hex("aabb").is_err());
    }

    #[test]
    fn two_party_collective_signature_verifies() {
        let digest = Hash::digest(b"block");
        let signers = [Pair::random(), Pair::random()];
        let nonces = [Scalar::from(11u64), Scalar::from(23u64)];

        let nonce_points: Vec<RistrettoPoint> =
            nonces.iter().map(RistrettoPoint::mul_base).collect();
        let big_r = compress(&(nonce_points[0] + nonce_points[1]));
        let keys: Vec<PublicKey> = signers.iter().map(Pair::public).collect();
        let aggregate = aggregate_keys(keys.iter()).unwrap();
        let c = challenge(&big_r, &aggregate, &digest);

        let partials: Vec<[u8; 32]> = signers
            .iter()
            .zip(&nonces)
            .map(|(pair, nonce)| partial_response(pair.secret(), nonce, &c))
            .collect();
        let sig = combine_partials(&big_r, partials.iter()).unwrap();
        assert!(verify(&aggregate, &digest, &sig).is_ok());

        // Dropping one partial breaks the equation.
        let partial_sig = combine_partials(&big_r, partials.iter().take(1)).unwrap();
        assert!(verify(&aggregate, &digest, &partial_sig).is_err());
    }

    #[test]
    fn scalar_parsing_rejects_non_canonical() {
        assert!(scalar_from_bytes(&[0xFF; 32]).is_err());
        let s = Scalar::from(42u64);
        assert_eq!(scalar_from_bytes(&s.to_bytes()).unwrap(), s);
    }
}
