//! Bridge error types and result definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge-specific errors, named after the error categories the reconciler,
/// supervisor, and config loader distinguish between.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure while writing the roster file to disk. Never advances
    /// `last_update`; the next reconcile tick will retry.
    #[error("failed to write roster for {peer_count} peers under {data_dir}: {source}")]
    RosterWrite {
        /// Directory the roster was being written under.
        data_dir: PathBuf,
        /// Number of peers in the roster snapshot that failed to persist.
        peer_count: usize,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Fatal failure bringing up the database subprocess.
    #[error("database supervisor failed to boot: {0}")]
    SupervisorBoot(String),

    /// The database process could not be spawned at all.
    #[error("failed to spawn database process: {0}")]
    ProcessSpawn(#[source] std::io::Error),

    /// An operation was attempted on the service lifecycle out of order
    /// (`start` called twice, or anything called before `start`).
    #[error("lifecycle misuse: {0}")]
    LifecycleMisuse(String),

    /// A peer metadata blob could not be parsed; the caller should skip the
    /// peer for this tick rather than treat it as fatal.
    #[error("malformed peer metadata from {peer}: {source}")]
    MalformedMetadata {
        /// Identifier of the peer whose metadata failed to parse.
        peer: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// An address could not be parsed as `host:port`.
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    /// The overlay host returned an error while being queried.
    #[error("overlay host error: {0}")]
    Overlay(String),

    /// An HTTP call to the database's status/query API failed.
    #[error("database HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Underlying I/O failure outside the roster-write path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("serialization error: {err}"))
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid TOML: {err}"))
    }
}
