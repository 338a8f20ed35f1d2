//! Status poller: reads Raft log index and node membership off the
//! database's own HTTP API, with an on-disk snapshot fallback (§4.H).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// The subset of `GET /status` this crate cares about.
#[derive(Debug, Deserialize)]
struct StatusResponse {
    store: StoreSection,
}

#[derive(Debug, Deserialize)]
struct StoreSection {
    raft: RaftSection,
}

#[derive(Debug, Deserialize)]
struct RaftSection {
    #[serde(default)]
    applied_index: u64,
    #[serde(default)]
    commit_index: u64,
    #[serde(default)]
    last_log_index: u64,
    #[serde(default)]
    leader_addr: Option<String>,
}

/// One member returned by `GET /nodes?ver=2`.
#[derive(Debug, Clone, Deserialize)]
pub struct RqliteNode {
    /// Node identifier, equal to its Raft address by convention.
    pub id: String,
    /// The node's advertised address.
    pub address: String,
    /// Whether this node is the current leader.
    #[serde(default)]
    pub leader: bool,
    /// Whether this node is a voting member.
    #[serde(default)]
    pub voter: bool,
    /// Whether the poller could reach this node directly.
    #[serde(default)]
    pub reachable: bool,
}

#[derive(Debug, Deserialize)]
struct WrappedNodes {
    nodes: Vec<RqliteNode>,
}

/// Query `http://localhost:<http_port>/status` for the best available
/// Raft log index; on failure or an all-zero response, fall back to
/// scanning `<data_dir>/rqlite/rsnapshots/*/meta.json` for the maximum
/// snapshot `Index` (§4.H step 1–2). Returns `0` if neither source yields
/// a usable value.
pub async fn get_raft_log_index(client: &reqwest::Client, http_port: u16, data_dir: &Path) -> u64 {
    match fetch_status(client, http_port).await {
        Some(raft) => {
            let best = raft.applied_index.max(raft.commit_index).max(raft.last_log_index);
            if best > 0 {
                return best;
            }
        }
        None => debug!(http_port, "status endpoint unreachable, falling back to snapshot metadata"),
    }

    scan_snapshot_index(data_dir).unwrap_or(0)
}

async fn fetch_status(client: &reqwest::Client, http_port: u16) -> Option<RaftSection> {
    let url = format!("http://localhost:{http_port}/status");
    let response = client
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?;
    let status: StatusResponse = response.json().await.ok()?;
    Some(status.store.raft)
}

fn scan_snapshot_index(data_dir: &Path) -> Option<u64> {
    #[derive(Deserialize)]
    struct SnapshotMeta {
        #[serde(rename = "Index")]
        index: u64,
    }

    let snapshots_dir = data_dir.join("rqlite").join("rsnapshots");
    let entries = std::fs::read_dir(snapshots_dir).ok()?;

    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let meta_path = entry.path().join("meta.json");
            let bytes = std::fs::read(meta_path).ok()?;
            let meta: SnapshotMeta = serde_json::from_slice(&bytes).ok()?;
            Some(meta.index)
        })
        .max()
}

/// Query `GET /nodes?ver=2`, accepting either shape the database may
/// return: an object wrapping `nodes: [...]`, or a bare array (§4.H).
pub async fn get_rqlite_nodes(client: &reqwest::Client, http_port: u16) -> Option<Vec<RqliteNode>> {
    let url = format!("http://localhost:{http_port}/nodes?ver=2");
    let value: Value = client
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?
        .json()
        .await
        .ok()?;

    if let Ok(wrapped) = serde_json::from_value::<WrappedNodes>(value.clone()) {
        return Some(wrapped.nodes);
    }
    serde_json::from_value::<Vec<RqliteNode>>(value).ok()
}

/// Whether `http_address` answers `GET /status` with `200 OK` within 3 s.
pub async fn is_node_reachable(client: &reqwest::Client, http_address: &str) -> bool {
    let url = format!("http://{http_address}/status");
    client
        .get(&url)
        .timeout(Duration::from_secs(3))
        .send()
        .await
        .is_ok_and(|response| response.status().is_success())
}

/// Best-effort leader address as reported by `GET /status`, if reachable.
pub async fn get_leader_address(client: &reqwest::Client, http_port: u16) -> Option<String> {
    fetch_status(client, http_port).await.and_then(|raft| raft.leader_addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_nodes_shape_parses() {
        let json = serde_json::json!({
            "nodes": [
                { "id": "10.0.0.1:4002", "address": "10.0.0.1:4002", "leader": true, "voter": true, "reachable": true }
            ]
        });
        let wrapped: WrappedNodes = serde_json::from_value(json).unwrap();
        assert_eq!(wrapped.nodes.len(), 1);
        assert!(wrapped.nodes[0].leader);
    }

    #[test]
    fn bare_array_shape_parses() {
        let json = serde_json::json!([
            { "id": "10.0.0.1:4002", "address": "10.0.0.1:4002" }
        ]);
        let nodes: Vec<RqliteNode> = serde_json::from_value(json).unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(!nodes[0].leader);
    }

    #[test]
    fn snapshot_index_scan_picks_the_maximum_across_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshots = tmp.path().join("rqlite").join("rsnapshots");
        for (name, index) in [("snap-1", 5_u64), ("snap-2", 42)] {
            let dir = snapshots.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("meta.json"), format!("{{\"Index\": {index}}}")).unwrap();
        }

        assert_eq!(scan_snapshot_index(tmp.path()), Some(42));
    }

    #[test]
    fn snapshot_index_scan_returns_none_when_directory_is_absent() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(scan_snapshot_index(tmp.path()), None);
    }
}
