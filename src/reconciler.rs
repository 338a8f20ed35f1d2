//! Membership reconciler: merges collected metadata into the roster,
//! gates on quorum, and triggers atomic roster writes (§4.D–§4.F).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::collector::{self, Collection};
use crate::error::BridgeResult;
use crate::metadata::{NodeId, NodeType, PeerHealth, PeerMetadata, RosterEntry};
use crate::overlay::OverlayHost;
use crate::roster;

/// Capability the Reconciler hands to the Database Supervisor so that a
/// self-address rewrite can be propagated without the supervisor holding a
/// reference back into the reconciler (§9, breaking the service ↔
/// supervisor cyclic reference).
#[async_trait]
pub trait AdvertisedAddressSink: Send + Sync {
    /// Called whenever normalization rewrites the self Raft/HTTP addresses.
    async fn update_advertised_addresses(&self, raft_address: String, http_address: String);
}

/// A no-op sink for callers that do not need to react to self-address
/// rewrites (most tests).
#[derive(Debug, Default)]
pub struct NullAddressSink;

#[async_trait]
impl AdvertisedAddressSink for NullAddressSink {
    async fn update_advertised_addresses(&self, _raft_address: String, _http_address: String) {}
}

struct Inner {
    known_peers: HashMap<NodeId, PeerMetadata>,
    peer_health: HashMap<NodeId, PeerHealth>,
    raft_address: String,
    http_address: String,
    last_update: Option<Instant>,
}

impl Inner {
    fn self_id(&self) -> &str {
        &self.raft_address
    }
}

/// Outcome of a single reconcile tick, returned to the caller for logging
/// or test assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Whether a roster write was attempted and succeeded.
    pub changed: bool,
    /// `node_id`s newly added to `known_peers` this tick.
    pub added: Vec<NodeId>,
    /// `node_id`s whose metadata changed this tick.
    pub updated: Vec<NodeId>,
}

/// Process-wide membership state: known peers, their health, and the
/// self-identity the normalizer may rewrite. Guarded by a single
/// readers-writer lock per §5; no I/O is ever performed while the lock is
/// held (R1), and self-address fields are copied out before any blocking
/// call (R2).
pub struct Reconciler {
    inner: Arc<RwLock<Inner>>,
    min_cluster_size: u32,
    inactivity_limit: std::time::Duration,
    data_dir: PathBuf,
    database_name: String,
    node_type: NodeType,
}

impl Reconciler {
    /// Construct a reconciler seeded with this node's own (pre-normalized)
    /// Raft/HTTP addresses. Self is present in `known_peers` from
    /// construction on, per invariant I1.
    ///
    /// `data_dir` and `database_name` must match the values the
    /// [`crate::supervisor::DatabaseSupervisor`] for this instance is
    /// constructed with: the roster is written under
    /// `<data_dir>/<database_name>/rqlite/raft/peers.json`, the same path
    /// the database reads on boot (`DatabaseSupervisor::data_dir`).
    #[must_use]
    pub fn new(
        raft_address: String,
        http_address: String,
        node_type: NodeType,
        min_cluster_size: u32,
        inactivity_limit: std::time::Duration,
        data_dir: PathBuf,
        database_name: String,
    ) -> Self {
        let self_metadata = PeerMetadata::for_self(raft_address.clone(), http_address.clone(), node_type, 0);
        let mut known_peers = HashMap::new();
        known_peers.insert(self_metadata.node_id.clone(), self_metadata);

        Self {
            inner: Arc::new(RwLock::new(Inner {
                known_peers,
                peer_health: HashMap::new(),
                raft_address,
                http_address,
                last_update: None,
            })),
            min_cluster_size,
            inactivity_limit,
            data_dir,
            database_name,
            node_type,
        }
    }

    /// `<data_dir>/<database_name>`, the root [`roster::write_roster`]
    /// resolves `rqlite/raft/peers.json` under. Scoping by
    /// `database_name` here is what keeps this path aligned with
    /// [`crate::supervisor::DatabaseSupervisor::data_dir`], which joins
    /// the same `database_name` segment before appending `rqlite`.
    fn roster_dir(&self) -> PathBuf {
        self.data_dir.join(&self.database_name)
    }

    /// Run one reconcile tick: collect from the overlay, merge under the
    /// write lock, release the lock, and write the roster if the merge and
    /// quorum gating both permit it (§4.D).
    pub async fn reconcile(
        &self,
        overlay: &dyn OverlayHost,
        sink: &dyn AdvertisedAddressSink,
        raft_log_index: u64,
    ) -> BridgeResult<ReconcileOutcome> {
        let (raft_address, http_address) = {
            let guard = self.inner.read().await;
            (guard.raft_address.clone(), guard.http_address.clone())
        };

        let collection = collector::collect(overlay, raft_address, http_address, self.node_type, raft_log_index).await;

        let (commit, candidate) = self.compute(collection).await;

        if commit.changed {
            if let Some((new_raft, new_http)) = commit.self_address_update.clone() {
                sink.update_advertised_addresses(new_raft, new_http).await;
            }
            match roster::write_roster(&self.roster_dir(), &candidate) {
                Ok(()) => {
                    let mut guard = self.inner.write().await;
                    guard.last_update = Some(Instant::now());
                    info!(added = commit.outcome.added.len(), updated = commit.outcome.updated.len(), "reconciled membership, roster written");
                }
                Err(err) => {
                    error!(
                        error = %err,
                        data_dir = %self.roster_dir().display(),
                        peer_count = candidate.len(),
                        "roster write failed, will retry next tick"
                    );
                    return Ok(ReconcileOutcome::default());
                }
            }
        } else if let Some((new_raft, new_http)) = commit.self_address_update {
            // Self address changed but quorum gating withheld the write;
            // still propagate the corrected advertise pair to the supervisor.
            sink.update_advertised_addresses(new_raft, new_http).await;
        }

        Ok(commit.outcome)
    }

    async fn compute(&self, collection: Collection) -> (CommitPlan, Vec<RosterEntry>) {
        let mut guard = self.inner.write().await;

        let mut added = Vec::new();
        let mut updated = Vec::new();
        let mut self_address_update = None;

        if let Some(stale) = collection.self_stale_node_id {
            guard.known_peers.remove(&stale);
            guard.peer_health.remove(&stale);
        }

        let self_changed_address = guard.raft_address != collection.self_metadata.raft_address
            || guard.http_address != collection.self_metadata.http_address;
        if self_changed_address {
            guard.raft_address = collection.self_metadata.raft_address.clone();
            guard.http_address = collection.self_metadata.http_address.clone();
            self_address_update = Some((guard.raft_address.clone(), guard.http_address.clone()));
        }

        merge_one(&mut guard, collection.self_metadata, &mut added, &mut updated);

        for peer in collection.peers {
            if let Some(stale) = peer.stale_node_id {
                guard.known_peers.remove(&stale);
                guard.peer_health.remove(&stale);
            }
            merge_one(&mut guard, peer.metadata, &mut added, &mut updated);
        }

        let self_id = guard.self_id().to_string();
        let remote_peer_count = guard.known_peers.keys().filter(|id| **id != self_id).count();
        let candidate: Vec<RosterEntry> = guard.known_peers.values().map(RosterEntry::from).collect();

        let should_write = !added.is_empty() || !updated.is_empty() || guard.last_update.is_none();

        let mut changed = should_write;
        if guard.last_update.is_none() {
            let quorum_met = u32::try_from(remote_peer_count).unwrap_or(u32::MAX) >= self.min_cluster_size.saturating_sub(1);
            if !quorum_met {
                debug!(remote_peer_count, min_cluster_size = self.min_cluster_size, "quorum not yet met, skipping roster write");
                changed = false;
            }
        }
        if candidate.is_empty() {
            changed = false;
        }

        (
            CommitPlan {
                changed,
                self_address_update,
                outcome: ReconcileOutcome {
                    changed,
                    added,
                    updated,
                },
            },
            candidate,
        )
    }

    /// Sweep peers not seen within `inactivity_limit`, evicting them from
    /// both maps and triggering a roster write if anything was removed
    /// (§4.E). The *only* removal path besides a `node_id` rewrite.
    pub async fn sweep_inactive(&self) -> BridgeResult<bool> {
        let now = Instant::now();
        let (removed_any, candidate) = {
            let mut guard = self.inner.write().await;
            let stale: Vec<NodeId> = guard
                .peer_health
                .iter()
                .filter(|(_, health)| now.duration_since(health.last_seen) > self.inactivity_limit)
                .map(|(id, _)| id.clone())
                .collect();

            for id in &stale {
                guard.known_peers.remove(id);
                guard.peer_health.remove(id);
            }

            let candidate: Vec<RosterEntry> = guard.known_peers.values().map(RosterEntry::from).collect();
            (!stale.is_empty(), candidate)
        };

        if removed_any {
            roster::write_roster(&self.roster_dir(), &candidate)?;
            let mut guard = self.inner.write().await;
            guard.last_update = Some(Instant::now());
        }

        Ok(removed_any)
    }

    /// All known peers except self (§4.F).
    pub async fn get_active_peers(&self) -> Vec<PeerMetadata> {
        let guard = self.inner.read().await;
        let self_id = guard.self_id().to_string();
        guard
            .known_peers
            .iter()
            .filter(|(id, _)| **id != self_id)
            .map(|(_, meta)| meta.clone())
            .collect()
    }

    /// Every known peer, self included (§4.F).
    pub async fn get_all_peers(&self) -> Vec<PeerMetadata> {
        self.inner.read().await.known_peers.values().cloned().collect()
    }

    /// The remote peer with the highest `raft_log_index`, if any (§4.F).
    pub async fn get_node_with_highest_log_index(&self) -> Option<PeerMetadata> {
        let guard = self.inner.read().await;
        let self_id = guard.self_id().to_string();
        guard
            .known_peers
            .values()
            .filter(|meta| meta.node_id != self_id)
            .max_by_key(|meta| meta.raft_log_index)
            .cloned()
    }

    /// Raft addresses of all known peers ordered by `raft_log_index`
    /// descending (§4.F).
    pub async fn find_join_targets(&self) -> Vec<String> {
        let guard = self.inner.read().await;
        let mut peers: Vec<&PeerMetadata> = guard.known_peers.values().collect();
        peers.sort_by_key(|meta| std::cmp::Reverse(meta.raft_log_index));
        peers.into_iter().map(|meta| meta.raft_address.clone()).collect()
    }

    /// Whether the roster was written within the last 5 minutes (§4.F).
    pub async fn has_recent_peers_json(&self) -> bool {
        let guard = self.inner.read().await;
        guard
            .last_update
            .is_some_and(|t| t.elapsed() < std::time::Duration::from_secs(5 * 60))
    }

    /// Force a collect + merge + write regardless of change detection,
    /// bypassing quorum gating. Callers are responsible for having
    /// externally determined that this is safe (§4.F).
    pub async fn force_write_peers_json(
        &self,
        overlay: &dyn OverlayHost,
        sink: &dyn AdvertisedAddressSink,
        raft_log_index: u64,
    ) -> BridgeResult<()> {
        let (raft_address, http_address) = {
            let guard = self.inner.read().await;
            (guard.raft_address.clone(), guard.http_address.clone())
        };
        let collection = collector::collect(overlay, raft_address, http_address, self.node_type, raft_log_index).await;
        let (commit, candidate) = self.compute(collection).await;
        if let Some((new_raft, new_http)) = commit.self_address_update {
            sink.update_advertised_addresses(new_raft, new_http).await;
        }
        roster::write_roster(&self.roster_dir(), &candidate)?;
        let mut guard = self.inner.write().await;
        guard.last_update = Some(Instant::now());
        Ok(())
    }
}

struct CommitPlan {
    changed: bool,
    self_address_update: Option<(String, String)>,
    outcome: ReconcileOutcome,
}

fn merge_one(inner: &mut Inner, meta: PeerMetadata, added: &mut Vec<NodeId>, updated: &mut Vec<NodeId>) {
    let self_id = inner.self_id().to_string();
    let is_self = meta.node_id == self_id;

    let changed = match inner.known_peers.get(&meta.node_id) {
        Some(existing) => {
            existing.raft_log_index != meta.raft_log_index
                || existing.raft_address != meta.raft_address
                || existing.http_address != meta.http_address
        }
        None => false,
    };

    if inner.known_peers.contains_key(&meta.node_id) {
        if changed {
            updated.push(meta.node_id.clone());
        }
    } else {
        added.push(meta.node_id.clone());
    }

    let node_id = meta.node_id.clone();
    inner.known_peers.insert(node_id.clone(), meta);

    if !is_self {
        let now = Instant::now();
        inner
            .peer_health
            .entry(node_id)
            .and_modify(|health| health.observe(now))
            .or_insert_with(|| PeerHealth::new_observed(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::MockOverlayHost;
    use std::str::FromStr;

    const TEST_DATABASE_NAME: &str = "testdb";

    fn reconciler(min_cluster_size: u32, data_dir: &std::path::Path) -> Reconciler {
        Reconciler::new(
            "10.0.0.1:4002".into(),
            "10.0.0.1:4001".into(),
            NodeType::Bootstrap,
            min_cluster_size,
            std::time::Duration::from_secs(24 * 3600),
            data_dir.to_path_buf(),
            TEST_DATABASE_NAME.to_string(),
        )
    }

    fn read_test_roster(data_dir: &std::path::Path) -> Option<Vec<RosterEntry>> {
        roster::read_roster(&data_dir.join(TEST_DATABASE_NAME)).unwrap()
    }

    #[tokio::test]
    async fn bootstrap_alone_writes_self_only_roster() {
        let tmp = tempfile::tempdir().unwrap();
        let r = reconciler(1, tmp.path());
        let host = MockOverlayHost::new("self");
        let sink = NullAddressSink;

        let outcome = r.reconcile(&host, &sink, 0).await.unwrap();
        assert!(outcome.changed);

        let roster = read_test_roster(tmp.path()).unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].address, "10.0.0.1:4002");
    }

    #[tokio::test]
    async fn quorum_gating_withholds_first_write_until_min_cluster_size_met() {
        let tmp = tempfile::tempdir().unwrap();
        let r = reconciler(3, tmp.path());
        let host = MockOverlayHost::new("self");
        let sink = NullAddressSink;

        let addr = multiaddr::Multiaddr::from_str("/ip4/10.0.0.2/tcp/4002").unwrap();
        host.connect_peer("peer-a", vec![addr]).await;
        let peer_meta =
            PeerMetadata::for_self("10.0.0.2:4002".into(), "10.0.0.2:4001".into(), NodeType::Worker, 1);
        host.publish_for_peer("peer-a", "rqlite_metadata", serde_json::to_vec(&peer_meta).unwrap())
            .await;

        let first = r.reconcile(&host, &sink, 0).await.unwrap();
        assert!(!first.changed);
        assert!(read_test_roster(tmp.path()).is_none());

        let addr_b = multiaddr::Multiaddr::from_str("/ip4/10.0.0.3/tcp/4002").unwrap();
        host.connect_peer("peer-b", vec![addr_b]).await;
        let peer_meta_b =
            PeerMetadata::for_self("10.0.0.3:4002".into(), "10.0.0.3:4001".into(), NodeType::Worker, 1);
        host.publish_for_peer("peer-b", "rqlite_metadata", serde_json::to_vec(&peer_meta_b).unwrap())
            .await;

        let second = r.reconcile(&host, &sink, 0).await.unwrap();
        assert!(second.changed);
        let roster = read_test_roster(tmp.path()).unwrap();
        assert_eq!(roster.len(), 3);
    }

    #[tokio::test]
    async fn self_is_always_present_in_known_peers() {
        let tmp = tempfile::tempdir().unwrap();
        let r = reconciler(1, tmp.path());
        let all = r.get_all_peers().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].raft_address, "10.0.0.1:4002");
    }

    #[tokio::test]
    async fn find_join_targets_orders_by_log_index_descending() {
        let tmp = tempfile::tempdir().unwrap();
        let r = reconciler(1, tmp.path());
        let host = MockOverlayHost::new("self");
        let sink = NullAddressSink;

        let addr_a = multiaddr::Multiaddr::from_str("/ip4/10.0.0.2/tcp/4002").unwrap();
        host.connect_peer("peer-a", vec![addr_a]).await;
        let meta_a =
            PeerMetadata::for_self("10.0.0.2:4002".into(), "10.0.0.2:4001".into(), NodeType::Worker, 5);
        host.publish_for_peer("peer-a", "rqlite_metadata", serde_json::to_vec(&meta_a).unwrap())
            .await;

        let addr_b = multiaddr::Multiaddr::from_str("/ip4/10.0.0.3/tcp/4002").unwrap();
        host.connect_peer("peer-b", vec![addr_b]).await;
        let meta_b =
            PeerMetadata::for_self("10.0.0.3:4002".into(), "10.0.0.3:4001".into(), NodeType::Worker, 9);
        host.publish_for_peer("peer-b", "rqlite_metadata", serde_json::to_vec(&meta_b).unwrap())
            .await;

        r.reconcile(&host, &sink, 2).await.unwrap();

        let targets = r.find_join_targets().await;
        assert_eq!(targets[0], "10.0.0.3:4002");
    }

    #[tokio::test]
    async fn sweep_inactive_never_removes_self() {
        let tmp = tempfile::tempdir().unwrap();
        let r = reconciler(1, tmp.path());
        let removed = r.sweep_inactive().await.unwrap();
        assert!(!removed);
        assert_eq!(r.get_all_peers().await.len(), 1);
    }
}
