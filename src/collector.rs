//! Metadata collector: one overlay scan per reconcile tick (§4.C).

use tracing::debug;

use crate::metadata::{NodeType, PeerMetadata, METADATA_KEY};
use crate::normalizer::{rewrite_advertised, select_peer_ip, select_self_ip};
use crate::overlay::OverlayHost;

/// One collected peer plus the stale `node_id` the normalizer evicted for
/// it, if any, so the caller can drop the old key under the write lock.
#[derive(Debug, Clone)]
pub struct CollectedPeer {
    /// The (possibly normalized) metadata for this peer.
    pub metadata: PeerMetadata,
    /// The pre-rewrite `node_id`, if normalization changed it.
    pub stale_node_id: Option<String>,
}

/// Result of one collection pass: the self entry (already normalized) and
/// every connected peer that published parseable metadata.
#[derive(Debug, Clone)]
pub struct Collection {
    /// This node's own (possibly rewritten) metadata.
    pub self_metadata: PeerMetadata,
    /// The stale `node_id` evicted for self, if normalization changed it.
    pub self_stale_node_id: Option<String>,
    /// Every peer whose metadata blob parsed successfully this tick.
    pub peers: Vec<CollectedPeer>,
}

/// Build the self entry from `(raft_address, http_address, node_type,
/// raft_log_index)`, normalize it against the overlay's own listen
/// addresses, then fetch and normalize every connected peer's published
/// metadata. Peers with missing or unparseable metadata are simply skipped
/// this tick — a [`crate::error::BridgeError`] is never returned from here;
/// that is the §7 `TransientObservation` policy.
pub async fn collect(
    overlay: &dyn OverlayHost,
    raft_address: String,
    http_address: String,
    node_type: NodeType,
    raft_log_index: u64,
) -> Collection {
    let mut self_metadata = PeerMetadata::for_self(raft_address, http_address, node_type, raft_log_index);
    let self_stale_node_id = if let Some(self_ip) = select_self_ip(overlay).await {
        let outcome = rewrite_advertised(&mut self_metadata, &self_ip.to_string(), true);
        outcome.stale_node_id
    } else {
        None
    };

    let store = overlay.peer_store();
    let mut peers = Vec::new();
    for peer_id in overlay.connected_peers().await {
        let Some(blob) = store.get(&peer_id, METADATA_KEY).await else {
            debug!(peer = %peer_id, "no metadata published yet, skipping this tick");
            continue;
        };

        let mut metadata: PeerMetadata = match serde_json::from_slice(&blob) {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(peer = %peer_id, error = %err, "malformed peer metadata, skipping this tick");
                continue;
            }
        };

        let stale_node_id = if let Some(peer_ip) = select_peer_ip(overlay, &peer_id).await {
            rewrite_advertised(&mut metadata, &peer_ip.to_string(), true).stale_node_id
        } else {
            None
        };

        metadata.touch();
        peers.push(CollectedPeer {
            metadata,
            stale_node_id,
        });
    }

    Collection {
        self_metadata,
        self_stale_node_id,
        peers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::MockOverlayHost;
    use std::str::FromStr;

    #[tokio::test]
    async fn collect_skips_peers_with_no_published_metadata() {
        let host = MockOverlayHost::new("self");
        host.connect_peer("peer-a", vec![]).await;

        let collection = collect(
            &host,
            "127.0.0.1:4002".into(),
            "127.0.0.1:4001".into(),
            NodeType::Bootstrap,
            0,
        )
        .await;

        assert!(collection.peers.is_empty());
    }

    #[tokio::test]
    async fn collect_skips_peers_with_malformed_metadata() {
        let host = MockOverlayHost::new("self");
        host.connect_peer("peer-a", vec![]).await;
        host.publish_for_peer("peer-a", "rqlite_metadata", b"not json".to_vec())
            .await;

        let collection = collect(
            &host,
            "127.0.0.1:4002".into(),
            "127.0.0.1:4001".into(),
            NodeType::Bootstrap,
            0,
        )
        .await;

        assert!(collection.peers.is_empty());
    }

    #[tokio::test]
    async fn collect_normalizes_peer_address_from_connection_evidence() {
        let host = MockOverlayHost::new("self");
        let addr = multiaddr::Multiaddr::from_str("/ip4/203.0.113.9/tcp/9000").unwrap();
        host.connect_peer("peer-a", vec![addr]).await;

        let peer_meta = PeerMetadata::for_self(
            "127.0.0.1:4002".into(),
            "127.0.0.1:4001".into(),
            NodeType::Worker,
            3,
        );
        host.publish_for_peer(
            "peer-a",
            "rqlite_metadata",
            serde_json::to_vec(&peer_meta).unwrap(),
        )
        .await;

        let collection = collect(
            &host,
            "10.0.0.1:4002".into(),
            "10.0.0.1:4001".into(),
            NodeType::Bootstrap,
            0,
        )
        .await;

        assert_eq!(collection.peers.len(), 1);
        let collected = &collection.peers[0].metadata;
        assert_eq!(collected.raft_address, "203.0.113.9:4002");
        assert_eq!(collected.node_id, "203.0.113.9:4002");
    }
}
