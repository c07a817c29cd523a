//! Collective Schnorr block signing and verification.
//!
//! The validator set of a height signs the block header jointly. Every
//! participant's nonce is pinned in advance: `r_h = r₀ + scalar(preimage_h)`,
//! where `r₀` is the signature-noise scalar committed in the enrollment
//! signature and `preimage_h` is the chain element revealed for the height.
//! Peers therefore compute each participant's public nonce from public data
//! alone, and the header's bitfield says exactly whose nonces must sum to the
//! signature's `R`.

use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::traits::Identity;
use curve25519_dalek::{RistrettoPoint, Scalar};
use stoa_crypto::schnorr;
use stoa_types::app::{BitField, BlockHeader, Enrollment, Hash, PublicKey, Signature};
use stoa_types::error::BlockSigError;
use tracing::debug;

/// The active validator set of one height: `(address, enrollment)` pairs
/// sorted ascending by address. The sort position is the validator's bitfield
/// index.
#[derive(Debug, Clone)]
pub struct SignerSet {
    validators: Vec<(PublicKey, Enrollment)>,
}

/// Read access to revealed pre-images during verification.
pub trait RevealSource {
    /// The pre-image revealed by `enroll_key` for `height`, if known.
    fn reveal(&self, enroll_key: &Hash, height: u64) -> Option<Hash>;

    /// Whether any reveal at all is known for `enroll_key`.
    fn has_reveals(&self, enroll_key: &Hash) -> bool;
}

impl RevealSource for crate::preimage::PreimageTracker {
    fn reveal(&self, enroll_key: &Hash, height: u64) -> Option<Hash> {
        self.get(enroll_key, height)
    }

    fn has_reveals(&self, enroll_key: &Hash) -> bool {
        self.has_any(enroll_key)
    }
}

impl SignerSet {
    /// Builds the set from the active enrollments and their owners.
    pub fn new(mut validators: Vec<(PublicKey, Enrollment)>) -> SignerSet {
        validators.sort_by(|a, b| a.0.cmp(&b.0));
        SignerSet { validators }
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// True when no validator is active.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// The bitfield index of `key`.
    pub fn index_of(&self, key: &PublicKey) -> Option<usize> {
        self.validators.iter().position(|(k, _)| k == key)
    }

    /// The validator at bitfield index `i`.
    pub fn get(&self, i: usize) -> Option<&(PublicKey, Enrollment)> {
        self.validators.get(i)
    }

    /// Addresses in bitfield order.
    pub fn keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.validators.iter().map(|(k, _)| k)
    }

    /// The aggregate key of the full set, which the challenge binds.
    pub fn aggregate_key(&self) -> Result<PublicKey, BlockSigError> {
        schnorr::aggregate_keys(self.keys()).map_err(|_| BlockSigError::InvalidSignature)
    }

    /// The challenge scalar every participant signs under for `header`.
    pub fn challenge(&self, header: &BlockHeader) -> Result<Scalar, BlockSigError> {
        let aggregate = self.aggregate_key()?;
        Ok(schnorr::challenge(
            &PublicKey(header.signature.r),
            &aggregate,
            &header.signing_digest(),
        ))
    }
}

/// The public per-block nonce of one validator: the enrollment's noise
/// commitment plus the revealed pre-image folded into the group.
pub fn expected_nonce(
    enrollment: &Enrollment,
    preimage: &Hash,
) -> Result<RistrettoPoint, BlockSigError> {
    let noise = CompressedRistretto(enrollment.enroll_sig.r)
        .decompress()
        .ok_or(BlockSigError::InvalidSignature)?;
    Ok(noise + RistrettoPoint::mul_base(&schnorr::scalar_from_hash(preimage)))
}

/// The private per-block nonce matching [`expected_nonce`].
pub fn derive_nonce(noise_secret: &Scalar, preimage: &Hash) -> Scalar {
    noise_secret + schnorr::scalar_from_hash(preimage)
}

/// One validator's response scalar for a block.
pub fn sign_partial(
    signing_secret: &Scalar,
    noise_secret: &Scalar,
    preimage: &Hash,
    challenge: &Scalar,
) -> [u8; 32] {
    schnorr::partial_response(signing_secret, &derive_nonce(noise_secret, preimage), challenge)
}

/// Sums the expected public nonces of the participants named by `indices`.
pub fn aggregate_nonce<R: RevealSource>(
    set: &SignerSet,
    height: u64,
    reveals: &R,
    indices: &[usize],
) -> Result<PublicKey, BlockSigError> {
    let mut sum = RistrettoPoint::identity();
    for &i in indices {
        let (_, enrollment) = set.get(i).ok_or(BlockSigError::NotEnrolled)?;
        let preimage = reveals
            .reveal(&enrollment.utxo_key, height)
            .ok_or(BlockSigError::MissingPreimage)?;
        sum += expected_nonce(enrollment, &preimage)?;
    }
    Ok(schnorr::compress(&sum))
}

/// Installs the collective signature on `header`: the participants' bitfield
/// and `(R, Σ s_v)`.
pub fn seal_header<R: RevealSource>(
    header: &mut BlockHeader,
    set: &SignerSet,
    reveals: &R,
    partials: &[(usize, [u8; 32])],
) -> Result<(), BlockSigError> {
    let indices: Vec<usize> = partials.iter().map(|(i, _)| *i).collect();
    let nonce = aggregate_nonce(set, header.height, reveals, &indices)?;
    let scalars: Vec<[u8; 32]> = partials.iter().map(|(_, s)| *s).collect();
    let signature = schnorr::combine_partials(&nonce, scalars.iter())
        .map_err(|_| BlockSigError::InvalidSignature)?;

    let mut bits = BitField::new(set.len());
    for i in indices {
        bits.set(i);
    }
    header.validators = bits;
    header.signature = signature;
    debug!(height = header.height, signers = partials.len(), "header sealed");
    Ok(())
}

/// Verifies a header's collective signature against the height's validator
/// set and the revealed pre-images.
pub fn validate_header<R: RevealSource>(
    header: &BlockHeader,
    set: &SignerSet,
    reveals: &R,
) -> Result<(), BlockSigError> {
    // Zero participants would degenerate to the identity on both sides of
    // the equation, letting an all-zero signature pass.
    if header.validators.count_ones() == 0 {
        return Err(BlockSigError::InvalidSignature);
    }

    let mut expected = RistrettoPoint::identity();
    let mut participants: Vec<&PublicKey> = Vec::new();

    for i in header.validators.iter_ones() {
        let Some((key, enrollment)) = set.get(i) else {
            return Err(BlockSigError::NotEnrolled);
        };
        if !reveals.has_reveals(&enrollment.utxo_key) {
            return Err(BlockSigError::NoPreimages);
        }
        let preimage = reveals
            .reveal(&enrollment.utxo_key, header.height)
            .ok_or(BlockSigError::MissingPreimage)?;
        expected += expected_nonce(enrollment, &preimage)?;
        participants.push(key);
    }
    if header.validators.len() != set.len() {
        return Err(BlockSigError::NotEnrolled);
    }

    if schnorr::compress(&expected).0 != header.signature.r {
        return Err(BlockSigError::NonceMismatch);
    }

    let participating_key =
        schnorr::aggregate_keys(participants).map_err(|_| BlockSigError::InvalidSignature)?;
    let challenge = set.challenge(header)?;
    schnorr::verify_with_challenge(&participating_key, &challenge, &header.signature)
        .map_err(|_| BlockSigError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preimage::PreimageTracker;
    use stoa_crypto::{Pair, PreimageChain};
    use stoa_types::app::Block;

    struct Validator {
        pair: Pair,
        noise: Scalar,
        chain: PreimageChain,
        enrollment: Enrollment,
    }

    fn validator(tag: &[u8]) -> Validator {
        let pair = Pair::random();
        let chain = PreimageChain::from_initial(&Hash::digest(tag), 8);
        let noise = Scalar::from_bytes_mod_order(Hash::digest(&[tag, b"-noise"].concat()).0);
        let mut enrollment = Enrollment {
            utxo_key: Hash::digest(&[tag, b"-stake"].concat()),
            random_seed: chain.seed().unwrap(),
            cycle_length: 8,
            enroll_sig: Signature::default(),
        };
        enrollment.enroll_sig = pair.sign_with_nonce(&noise, &enrollment.signing_digest());
        Validator {
            pair,
            noise,
            chain,
            enrollment,
        }
    }

    /// Signers enrolled at height 0; everyone has revealed through `height`.
    fn harness(n: usize, height: u64) -> (Vec<Validator>, SignerSet, PreimageTracker) {
        let validators: Vec<Validator> =
            (0..n).map(|i| validator(format!("v{i}").as_bytes())).collect();
        let set = SignerSet::new(
            validators
                .iter()
                .map(|v| (v.pair.public(), v.enrollment.clone()))
                .collect(),
        );
        let mut tracker = PreimageTracker::new();
        for v in &validators {
            for h in 1..=height {
                let info = stoa_types::app::PreimageInfo {
                    enroll_key: v.enrollment.utxo_key,
                    hash: v.chain.reveal_at(h - 1).unwrap(),
                    height: h,
                };
                tracker.receive(&v.enrollment, 0, &info).unwrap();
            }
        }
        (validators, set, tracker)
    }

    fn signed_header(
        validators: &[Validator],
        set: &SignerSet,
        tracker: &PreimageTracker,
        height: u64,
        signer_indices: &[usize],
    ) -> BlockHeader {
        let mut block = Block::genesis(vec![], vec![]);
        block.header.height = height;
        let challenge = {
            // The challenge depends on R, which is fixed by the signer set.
            let nonce = aggregate_nonce(set, height, tracker, signer_indices).unwrap();
            let mut probe = block.header.clone();
            probe.signature.r = nonce.0;
            set.challenge(&probe).unwrap()
        };

        let mut partials = Vec::new();
        for v in validators {
            let index = set.index_of(&v.pair.public()).unwrap();
            if !signer_indices.contains(&index) {
                continue;
            }
            let preimage = tracker.reveal(&v.enrollment.utxo_key, height).unwrap();
            let partial = sign_partial(v.pair.secret(), &v.noise, &preimage, &challenge);
            partials.push((index, partial));
        }
        seal_header(&mut block.header, set, tracker, &partials).unwrap();
        block.header
    }

    #[test]
    fn full_participation_verifies() {
        let (validators, set, tracker) = harness(3, 2);
        let header = signed_header(&validators, &set, &tracker, 2, &[0, 1, 2]);
        validate_header(&header, &set, &tracker).unwrap();
        assert_eq!(header.validators.count_ones(), 3);
    }

    #[test]
    fn partial_participation_verifies_with_matching_bitfield() {
        let (validators, set, tracker) = harness(4, 1);
        let header = signed_header(&validators, &set, &tracker, 1, &[0, 1, 3]);
        validate_header(&header, &set, &tracker).unwrap();
        assert!(!header.validators.get(2));
    }

    #[test]
    fn unenrolled_bit_is_rejected() {
        let (validators, set, tracker) = harness(2, 2);
        let mut header = signed_header(&validators, &set, &tracker, 2, &[0, 1]);
        // Forge a wider bitfield with a bit outside the active set.
        let mut bits = BitField::new(3);
        bits.set(0);
        bits.set(1);
        bits.set(2);
        header.validators = bits;
        assert_eq!(
            validate_header(&header, &set, &tracker),
            Err(BlockSigError::NotEnrolled)
        );
        assert_eq!(
            BlockSigError::NotEnrolled.to_string(),
            "Validator is not enrolled"
        );
    }

    #[test]
    fn missing_preimages_are_distinguished() {
        let (validators, set, mut tracker) = harness(3, 3);
        let header = signed_header(&validators, &set, &tracker, 3, &[0, 1, 2]);

        // Validator at index 2 revealed nothing at all.
        let lost = &set.get(2).unwrap().1.utxo_key;
        tracker.forget(lost);
        assert_eq!(
            validate_header(&header, &set, &tracker),
            Err(BlockSigError::NoPreimages)
        );
        assert_eq!(
            BlockSigError::NoPreimages.to_string(),
            "Validator has not revealed any preimages"
        );

        // Re-reveal only up to height 2: the height-3 entry is missing.
        let v = validators
            .iter()
            .find(|v| &v.enrollment.utxo_key == lost)
            .unwrap();
        for h in 1..=2 {
            let info = stoa_types::app::PreimageInfo {
                enroll_key: v.enrollment.utxo_key,
                hash: v.chain.reveal_at(h - 1).unwrap(),
                height: h,
            };
            tracker.receive(&v.enrollment, 0, &info).unwrap();
        }
        assert_eq!(
            validate_header(&header, &set, &tracker),
            Err(BlockSigError::MissingPreimage)
        );
        assert_eq!(
            BlockSigError::MissingPreimage.to_string(),
            "Validator has not revealed the preimage for this block height"
        );
    }

    #[test]
    fn bitfield_and_nonce_sum_must_agree() {
        let (validators, set, tracker) = harness(3, 1);
        let mut header = signed_header(&validators, &set, &tracker, 1, &[0, 1, 2]);
        // Claim validator 2 did not sign although its nonce is in R.
        header.validators.clear(2);
        assert_eq!(
            validate_header(&header, &set, &tracker),
            Err(BlockSigError::NonceMismatch)
        );
        assert_eq!(
            BlockSigError::NonceMismatch.to_string(),
            "Signature.R does not match expected R"
        );
    }

    #[test]
    fn tampered_response_scalar_is_rejected() {
        let (validators, set, tracker) = harness(3, 1);
        let mut header = signed_header(&validators, &set, &tracker, 1, &[0, 1, 2]);
        header.signature.s = Scalar::from(99u64).to_bytes();
        assert_eq!(
            validate_header(&header, &set, &tracker),
            Err(BlockSigError::InvalidSignature)
        );
        assert_eq!(BlockSigError::InvalidSignature.to_string(), "Signature is invalid");
    }

    #[test]
    fn nonce_derivation_matches_expected_point() {
        let v = validator(b"solo");
        let preimage = v.chain.reveal_at(3).unwrap();
        let secret = derive_nonce(&v.noise, &preimage);
        let public = expected_nonce(&v.enrollment, &preimage).unwrap();
        assert_eq!(RistrettoPoint::mul_base(&secret), public);
    }

    #[test]
    fn signers_missing_their_own_reveal_cannot_be_aggregated() {
        let (_validators, set, tracker) = harness(2, 1);
        assert_eq!(
            aggregate_nonce(&set, 2, &tracker, &[0]),
            Err(BlockSigError::MissingPreimage)
        );
    }

    struct NoReveals;
    impl RevealSource for NoReveals {
        fn reveal(&self, _: &Hash, _: u64) -> Option<Hash> {
            None
        }
        fn has_reveals(&self, _: &Hash) -> bool {
            false
        }
    }

    #[test]
    fn empty_participation_is_rejected_outright() {
        let (_, set, _) = harness(2, 1);
        let mut block = Block::genesis(vec![], vec![]);
        block.header.height = 1;
        block.header.validators = BitField::new(2);
        assert_eq!(
            validate_header(&block.header, &set, &NoReveals),
            Err(BlockSigError::InvalidSignature)
        );
    }
}
