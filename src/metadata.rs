//! Peer metadata, health bookkeeping, and the on-disk roster entry shape.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier for a node, equal to its `RaftAddress` by policy once
/// normalization has completed.
pub type NodeId = String;

/// Role a database node advertises to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// The conventional first member of the cluster; preferred join target.
    Bootstrap,
    /// Any node that joins an existing cluster.
    Worker,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootstrap => write!(f, "bootstrap"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// The opaque cluster-protocol version tag carried on the wire.
pub const CLUSTER_VERSION: &str = "1.0";

/// The overlay peer-store key under which a node publishes its
/// [`PeerMetadata`].
pub const METADATA_KEY: &str = "rqlite_metadata";

/// Snapshot of one database node's advertised identity, as exchanged
/// through the overlay's peer key/value store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMetadata {
    /// Stable identifier; equals `raft_address` once normalized.
    pub node_id: NodeId,
    /// `host:port` for Raft transport.
    pub raft_address: String,
    /// `host:port` for the database HTTP API.
    pub http_address: String,
    /// Whether this node is a bootstrap node or an ordinary worker.
    pub node_type: NodeType,
    /// Monotonic (under normal operation) Raft log index for this node.
    pub raft_log_index: u64,
    /// When this metadata was last (re-)observed. Serialized so the value
    /// survives a round trip through the overlay's key/value store.
    pub last_seen: DateTime<Utc>,
    /// Opaque cluster-protocol version tag.
    pub cluster_version: String,
}

impl PeerMetadata {
    /// Build self metadata prior to any address normalization.
    #[must_use]
    pub fn for_self(
        raft_address: String,
        http_address: String,
        node_type: NodeType,
        raft_log_index: u64,
    ) -> Self {
        Self {
            node_id: raft_address.clone(),
            raft_address,
            http_address,
            node_type,
            raft_log_index,
            last_seen: Utc::now(),
            cluster_version: CLUSTER_VERSION.to_string(),
        }
    }

    /// Refresh `last_seen` to now, as the Metadata Collector does on every
    /// successful re-observation of a peer.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// Health classification of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Observed within the current reconcile window.
    Active,
    /// Not yet past the inactivity limit but showing failures.
    Degraded,
    /// Past the inactivity limit; eligible for sweeping.
    Inactive,
}

/// Per-remote-peer health bookkeeping. Never populated for self, and never
/// written to disk — this is process-internal state used for the
/// inactivity sweep.
#[derive(Debug, Clone)]
pub struct PeerHealth {
    /// Last time any observation of this peer was made.
    pub last_seen: Instant,
    /// Last time an observation succeeded (distinct from `last_seen` only
    /// once failure tracking is introduced upstream of this crate).
    pub last_successful: Instant,
    /// Consecutive-failure counter, reset to zero on any fresh observation.
    pub failure_count: u32,
    /// Current health classification.
    pub status: PeerStatus,
}

impl PeerHealth {
    /// Health record for a peer observed for the first time.
    #[must_use]
    pub fn new_observed(now: Instant) -> Self {
        Self {
            last_seen: now,
            last_successful: now,
            failure_count: 0,
            status: PeerStatus::Active,
        }
    }

    /// Refresh on re-observation: bump `last_seen`, clear failures, mark
    /// active. Per spec this does *not* touch `last_successful`.
    pub fn observe(&mut self, now: Instant) {
        self.last_seen = now;
        self.failure_count = 0;
        self.status = PeerStatus::Active;
    }
}

/// The on-disk shape of one roster member, as consumed by the database on
/// boot to recover its voting membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Equal to `address` in this version; kept as a separate field because
    /// the on-disk shape is a stable, independently-documented contract.
    pub id: String,
    /// The peer's Raft address.
    pub address: String,
    /// Always `false` in this version; voting-member demotion is not
    /// implemented by the bridge.
    pub non_voter: bool,
}

impl From<&PeerMetadata> for RosterEntry {
    fn from(meta: &PeerMetadata) -> Self {
        Self {
            id: meta.raft_address.clone(),
            address: meta.raft_address.clone(),
            non_voter: false,
        }
    }
}
