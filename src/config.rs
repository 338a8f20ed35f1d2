//! Bridge configuration: file + environment-variable loading, validation.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::metadata::NodeType;

/// Serializes a [`Duration`] as whole seconds, so `update_interval = 30`
/// reads naturally in a hand-edited TOML file rather than a nested table.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Text format for `tracing-subscriber`'s output layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, ANSI-colored when the terminal supports it.
    #[default]
    Pretty,
    /// Newline-delimited JSON, one event per line.
    Json,
    /// Single-line, no ANSI.
    Compact,
}

/// Every tunable read by the Reconciler, Sweeper, Supervisor, Status Poller,
/// and Service Lifecycle, plus the logging knobs (§4.K).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Minimum cluster size (including self) required before the first
    /// roster write is allowed past quorum gating.
    pub min_cluster_size: u32,
    /// Interval between periodic reconcile ticks.
    #[serde(with = "duration_secs")]
    pub update_interval: Duration,
    /// How long a peer may go unseen before the sweeper evicts it.
    #[serde(with = "duration_secs")]
    pub inactivity_limit: Duration,
    /// Root data directory; may contain `~` and `${VAR}` references.
    pub data_dir: PathBuf,
    /// Whether this node is the cluster's bootstrap node or an ordinary
    /// worker.
    pub node_type: NodeType,
    /// `host:port` this node binds its Raft transport to.
    pub raft_bind_address: String,
    /// `host:port` this node binds its HTTP API to.
    pub http_bind_address: String,
    /// Advertised Raft address, if different from the bind address.
    pub raft_advertise_address: Option<String>,
    /// Advertised HTTP address, if different from the bind address.
    pub http_advertise_address: Option<String>,
    /// Path to the database binary the supervisor spawns.
    pub database_binary: PathBuf,
    /// `RaftAddress` of an existing cluster member to join, for followers.
    pub join_target: Option<String>,
    /// Name of the database instance; scopes its data directory.
    pub database_name: String,
    /// HTTP readiness polling interval during boot.
    #[serde(with = "duration_secs")]
    pub http_readiness_interval: Duration,
    /// Maximum HTTP readiness poll attempts during boot.
    pub http_readiness_attempts: u32,
    /// Follower SQL-readiness overall timeout.
    #[serde(with = "duration_secs")]
    pub follower_readiness_timeout: Duration,
    /// Minimum level passed to `tracing_subscriber::EnvFilter`.
    pub log_level: String,
    /// Output format for the logging layer.
    pub log_format: LogFormat,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 1,
            update_interval: Duration::from_secs(30),
            inactivity_limit: Duration::from_secs(24 * 3600),
            data_dir: PathBuf::from("~/.raftmesh"),
            node_type: NodeType::Worker,
            raft_bind_address: "0.0.0.0:4002".to_string(),
            http_bind_address: "0.0.0.0:4001".to_string(),
            raft_advertise_address: None,
            http_advertise_address: None,
            database_binary: PathBuf::from("rqlited"),
            join_target: None,
            database_name: "raftmesh".to_string(),
            http_readiness_interval: Duration::from_secs(1),
            http_readiness_attempts: 60,
            follower_readiness_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl BridgeConfig {
    /// Load configuration the way `ApiConfig::load` does: an optional TOML
    /// file (path from `RAFTMESH_CONFIG`, default `config/bridge.toml`),
    /// falling back to [`BridgeConfig::default`] if absent, then applying
    /// `RAFTMESH_*` environment overrides on top.
    pub fn load() -> BridgeResult<Self> {
        let config_path =
            env::var("RAFTMESH_CONFIG").unwrap_or_else(|_| "config/bridge.toml".to_string());

        let mut config = match fs::read_to_string(&config_path) {
            Ok(content) => toml::from_str(&content)?,
            Err(_) => Self::default(),
        };

        if let Ok(value) = env::var("RAFTMESH_MIN_CLUSTER_SIZE") {
            config.min_cluster_size = value
                .parse()
                .map_err(|_| BridgeError::Config(format!("invalid RAFTMESH_MIN_CLUSTER_SIZE: {value}")))?;
        }
        if let Ok(value) = env::var("RAFTMESH_UPDATE_INTERVAL_SECS") {
            let secs: u64 = value
                .parse()
                .map_err(|_| BridgeError::Config(format!("invalid RAFTMESH_UPDATE_INTERVAL_SECS: {value}")))?;
            config.update_interval = Duration::from_secs(secs);
        }
        if let Ok(value) = env::var("RAFTMESH_INACTIVITY_LIMIT_SECS") {
            let secs: u64 = value
                .parse()
                .map_err(|_| BridgeError::Config(format!("invalid RAFTMESH_INACTIVITY_LIMIT_SECS: {value}")))?;
            config.inactivity_limit = Duration::from_secs(secs);
        }
        if let Ok(value) = env::var("RAFTMESH_DATA_DIR") {
            config.data_dir = PathBuf::from(value);
        }
        if let Ok(value) = env::var("RAFTMESH_NODE_TYPE") {
            config.node_type = match value.to_ascii_lowercase().as_str() {
                "bootstrap" => NodeType::Bootstrap,
                "worker" => NodeType::Worker,
                other => return Err(BridgeError::Config(format!("invalid RAFTMESH_NODE_TYPE: {other}"))),
            };
        }
        if let Ok(value) = env::var("RAFTMESH_RAFT_BIND_ADDRESS") {
            config.raft_bind_address = value;
        }
        if let Ok(value) = env::var("RAFTMESH_HTTP_BIND_ADDRESS") {
            config.http_bind_address = value;
        }
        if let Ok(value) = env::var("RAFTMESH_JOIN_TARGET") {
            config.join_target = Some(value);
        }
        if let Ok(value) = env::var("RAFTMESH_LOG_LEVEL") {
            config.log_level = value;
        }
        if let Ok(value) = env::var("RAFTMESH_LOG_FORMAT") {
            config.log_format = match value.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "compact" => LogFormat::Compact,
                _ => LogFormat::Pretty,
            };
        }

        Ok(config)
    }

    /// Reject configurations the rest of the crate cannot safely act on.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.min_cluster_size == 0 {
            return Err(BridgeError::Config("min_cluster_size must be greater than 0".into()));
        }
        if self.update_interval >= self.inactivity_limit {
            return Err(BridgeError::Config(
                "update_interval must be shorter than inactivity_limit".into(),
            ));
        }
        // A worker with no join_target is not rejected here: whether that's
        // fatal depends on has_existing_data(), which this layer cannot see.
        // The supervisor re-checks dynamically once disk state is visible.
        Ok(())
    }
}
