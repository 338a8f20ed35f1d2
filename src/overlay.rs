//! The overlay-host seam: the trait boundary this crate depends on but does
//! not implement in production. §1 lists the overlay host as an external
//! collaborator — this module is the contract it must satisfy, plus an
//! in-memory double used throughout this crate's own test suite.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use multiaddr::Multiaddr;
use tokio::sync::RwLock;

/// Identifier the overlay network uses for a connected peer. Distinct from
/// [`crate::metadata::NodeId`]: the overlay's peer ID is whatever the
/// transport layer assigns (a libp2p-style peer ID, in the common case),
/// while the `NodeId` is the database's own `RaftAddress`-derived identity.
pub type PeerId = String;

/// Read/write access to a peer's published key/value metadata, as exposed
/// by the overlay host. The bridge only ever touches the
/// [`crate::metadata::METADATA_KEY`] key, but the trait is intentionally
/// generic — the overlay may use the same store for other purposes.
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Fetch a value published by `peer` under `key`, if any.
    async fn get(&self, peer: &PeerId, key: &str) -> Option<Vec<u8>>;

    /// Publish a value for the local node under `key`.
    async fn set(&self, key: &str, value: Vec<u8>);
}

/// The overlay network surface the bridge depends on: peer discovery,
/// connection evidence for address normalization, and the peer metadata
/// store.
#[async_trait]
pub trait OverlayHost: Send + Sync {
    /// Peers currently connected to this node.
    async fn connected_peers(&self) -> Vec<PeerId>;

    /// Active connection addresses to `peer` — proven reachable, and
    /// therefore preferred evidence for address normalization.
    async fn connections_to(&self, peer: &PeerId) -> Vec<Multiaddr>;

    /// Addresses known for `peer` from the address book but not currently
    /// connected — weaker evidence, consulted only if there is no active
    /// connection.
    async fn address_book(&self, peer: &PeerId) -> Vec<Multiaddr>;

    /// This node's own listen addresses, used to normalize self metadata.
    async fn listen_addresses(&self) -> Vec<Multiaddr>;

    /// The peer metadata key/value store.
    fn peer_store(&self) -> Arc<dyn PeerStore>;

    /// Ask the overlay to attempt a fresh round of peer exchange. Opaque
    /// and fire-and-forget — the reconciler does not await its effects
    /// beyond the next scheduled collection.
    async fn trigger_peer_exchange(&self);
}

/// An in-memory [`PeerStore`] backing [`MockOverlayHost`].
#[derive(Default)]
struct MockPeerStore {
    /// Values published per peer, keyed by (`peer`, key).
    values: RwLock<HashMap<(PeerId, String), Vec<u8>>>,
    /// The identity under which `set` publishes — the mock's "self" peer.
    self_id: PeerId,
}

#[async_trait]
impl PeerStore for MockPeerStore {
    async fn get(&self, peer: &PeerId, key: &str) -> Option<Vec<u8>> {
        self.values
            .read()
            .await
            .get(&(peer.clone(), key.to_string()))
            .cloned()
    }

    async fn set(&self, key: &str, value: Vec<u8>) {
        self.values
            .write()
            .await
            .insert((self.self_id.clone(), key.to_string()), value);
    }
}

/// An in-memory [`OverlayHost`] double used by this crate's own test suite.
/// Not shipped as production overlay implementation — see §1/§4.J.
pub struct MockOverlayHost {
    self_id: PeerId,
    peers: RwLock<Vec<PeerId>>,
    connections: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
    address_book: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    store: Arc<MockPeerStore>,
    exchange_triggers: RwLock<u64>,
}

impl MockOverlayHost {
    /// Create a new mock overlay host identifying itself as `self_id`.
    #[must_use]
    pub fn new(self_id: impl Into<PeerId>) -> Self {
        let self_id = self_id.into();
        Self {
            store: Arc::new(MockPeerStore {
                values: RwLock::default(),
                self_id: self_id.clone(),
            }),
            self_id,
            peers: RwLock::default(),
            connections: RwLock::default(),
            address_book: RwLock::default(),
            listen_addrs: RwLock::default(),
            exchange_triggers: RwLock::default(),
        }
    }

    /// Register `peer` as connected, with the given proven-reachable
    /// connection addresses.
    pub async fn connect_peer(&self, peer: impl Into<PeerId>, addrs: Vec<Multiaddr>) {
        let peer = peer.into();
        self.peers.write().await.push(peer.clone());
        self.connections.write().await.insert(peer, addrs);
    }

    /// Record address-book-only (unproven) addresses for `peer`.
    pub async fn set_address_book(&self, peer: impl Into<PeerId>, addrs: Vec<Multiaddr>) {
        self.address_book.write().await.insert(peer.into(), addrs);
    }

    /// Set this host's own listen addresses.
    pub async fn set_listen_addresses(&self, addrs: Vec<Multiaddr>) {
        *self.listen_addrs.write().await = addrs;
    }

    /// Publish `value` under `key` as if `peer` had done so, bypassing the
    /// "self only" restriction `PeerStore::set` enforces — test setup only.
    pub async fn publish_for_peer(&self, peer: impl Into<PeerId>, key: &str, value: Vec<u8>) {
        self.store
            .values
            .write()
            .await
            .insert((peer.into(), key.to_string()), value);
    }

    /// Number of times [`OverlayHost::trigger_peer_exchange`] was called.
    pub async fn exchange_trigger_count(&self) -> u64 {
        *self.exchange_triggers.read().await
    }

    /// This mock's own peer identity.
    #[must_use]
    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }
}

#[async_trait]
impl OverlayHost for MockOverlayHost {
    async fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.read().await.clone()
    }

    async fn connections_to(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.connections.read().await.get(peer).cloned().unwrap_or_default()
    }

    async fn address_book(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.address_book.read().await.get(peer).cloned().unwrap_or_default()
    }

    async fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.listen_addrs.read().await.clone()
    }

    fn peer_store(&self) -> Arc<dyn PeerStore> {
        self.store.clone()
    }

    async fn trigger_peer_exchange(&self) {
        *self.exchange_triggers.write().await += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_fetch_metadata_blob() {
        let host = MockOverlayHost::new("self");
        host.connect_peer("peer-a", vec![]).await;
        host.publish_for_peer("peer-a", "rqlite_metadata", b"hello".to_vec())
            .await;

        let store = host.peer_store();
        let value = store.get(&"peer-a".to_string(), "rqlite_metadata").await;
        assert_eq!(value, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn trigger_peer_exchange_is_counted() {
        let host = MockOverlayHost::new("self");
        host.trigger_peer_exchange().await;
        host.trigger_peer_exchange().await;
        assert_eq!(host.exchange_trigger_count().await, 2);
    }
}
