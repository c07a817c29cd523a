//! The async shell around the synchronous node core.
//!
//! The core never blocks; this shell owns the tokio side: it drains the
//! node's mailbox, realizes scheduled timers as sleeps, and pushes outbound
//! messages to the peer network.

use crate::node::{Node, NodeMessage, Outbound};
use stoa_api::network::NetworkClient;
use stoa_types::error::FatalError;
use tokio::sync::mpsc;
use tracing::info;

/// Feeds a node from a mailbox until the channel closes or a fatal error
/// stops it.
pub async fn run(
    mut node: Node,
    mut inbox: mpsc::UnboundedReceiver<NodeMessage>,
    loopback: mpsc::UnboundedSender<NodeMessage>,
    network: std::sync::Arc<dyn NetworkClient>,
) -> Result<(), FatalError> {
    while let Some(message) = inbox.recv().await {
        let outbound = node.handle(message)?;
        for timer in node.take_timers() {
            let loopback = loopback.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timer.delay).await;
                let _ = loopback.send(timer.message);
            });
        }
        for out in outbound {
            forward(&network, &loopback, out).await;
        }
    }
    info!("mailbox closed; node stopping");
    Ok(())
}

/// A peerless network for standalone nodes: gossip goes nowhere and every
/// query comes back empty.
pub struct NullNetwork;

#[async_trait::async_trait]
impl NetworkClient for NullNetwork {
    async fn gossip_envelope(&self, _: stoa_types::app::ScpEnvelope) {}
    async fn gossip_preimage(&self, _: stoa_types::app::PreimageInfo) {}
    async fn gossip_partial(&self, _: stoa_types::app::BlockPartialSig) {}
    async fn get_quorum_set(&self, _: stoa_types::app::Hash) -> Option<stoa_types::app::QuorumSet> {
        None
    }
    async fn put_transaction(&self, _: stoa_types::app::Transaction) {}
    async fn get_block_height(&self) -> u64 {
        0
    }
    async fn get_blocks_from(&self, _: u64, _: u64) -> Vec<stoa_types::app::Block> {
        Vec::new()
    }
    async fn enroll_validator(&self, _: stoa_types::app::Enrollment) -> Result<(), String> {
        Err("standalone node has no peers".to_string())
    }
    async fn has_enrollment(&self, _: stoa_types::app::Hash) -> bool {
        false
    }
    async fn get_enrollment(&self, _: stoa_types::app::Hash) -> Option<stoa_types::app::Enrollment> {
        None
    }
    async fn create_enrollment_data(&self) -> Result<stoa_types::app::Enrollment, String> {
        Err("standalone node has no peers".to_string())
    }
}

async fn forward(
    network: &std::sync::Arc<dyn NetworkClient>,
    loopback: &mpsc::UnboundedSender<NodeMessage>,
    out: Outbound,
) {
    match out {
        Outbound::Envelope(envelope) => network.gossip_envelope(envelope).await,
        Outbound::Enrollment(enrollment) => {
            if let Err(reason) = network.enroll_validator(enrollment).await {
                tracing::debug!(%reason, "peer rejected enrollment");
            }
        }
        Outbound::Preimage(info) => network.gossip_preimage(info).await,
        Outbound::Partial(partial) => network.gossip_partial(partial).await,
        Outbound::QuorumQuery(hash) => {
            // Resolved through the peer RPC surface; the reply loops back
            // into the mailbox like any other input.
            let network = network.clone();
            let loopback = loopback.clone();
            tokio::spawn(async move {
                if let Some(qset) = network.get_quorum_set(hash).await {
                    let _ = loopback.send(NodeMessage::QuorumReply(qset));
                }
            });
        }
        Outbound::BlockRequest(start) => {
            let network = network.clone();
            let loopback = loopback.clone();
            tokio::spawn(async move {
                let blocks = network.get_blocks_from(start, 64).await;
                if !blocks.is_empty() {
                    let _ = loopback.send(NodeMessage::Blocks(blocks));
                }
            });
        }
        // Only meaningful on transports that deliver queries as messages;
        // the RPC surface answers queries synchronously instead.
        Outbound::QuorumReply(_) | Outbound::Blocks(_) => {}
    }
}
