//! The logical peer RPC surface.
//!
//! Transport and serialization live outside the core; this trait is the shape
//! of what a peer can be asked. Registration-style endpoints report failure as
//! a message string, matching the user-visible behavior of those endpoints.

use async_trait::async_trait;
use stoa_types::app::{
    Block, BlockPartialSig, Enrollment, Hash, PreimageInfo, QuorumSet, ScpEnvelope, Transaction,
};

/// A handle to one peer (or to a broadcast group of peers).
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Delivers a consensus envelope.
    async fn gossip_envelope(&self, envelope: ScpEnvelope);

    /// Delivers a revealed pre-image.
    async fn gossip_preimage(&self, info: PreimageInfo);

    /// Delivers a partial block signature.
    async fn gossip_partial(&self, partial: BlockPartialSig);

    /// Fetches a referenced quorum set.
    async fn get_quorum_set(&self, hash: Hash) -> Option<QuorumSet>;

    /// Submits a transaction to the peer's mempool.
    async fn put_transaction(&self, tx: Transaction);

    /// The peer's current block height.
    async fn get_block_height(&self) -> u64;

    /// Up to `count` blocks starting at `start`.
    async fn get_blocks_from(&self, start: u64, count: u64) -> Vec<Block>;

    /// Registers an enrollment. `Err` carries the rejection message.
    async fn enroll_validator(&self, enrollment: Enrollment) -> Result<(), String>;

    /// Whether the peer knows an enrollment under this key.
    async fn has_enrollment(&self, key: Hash) -> bool;

    /// Fetches an enrollment by key.
    async fn get_enrollment(&self, key: Hash) -> Option<Enrollment>;

    /// Asks the peer to produce its own enrollment record (admin-only).
    async fn create_enrollment_data(&self) -> Result<Enrollment, String>;
}
