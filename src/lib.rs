//! # raftmesh-bridge
//!
//! Bridges a peer-to-peer overlay network to a Raft-based SQLite cluster's
//! membership roster.
//!
//! ## Architecture overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       raftmesh-bridge                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │   Overlay Host  ──►  Metadata Collector  ──►  Membership        │
//! │  (peers, conns,         (normalizes via          Reconciler     │
//! │   kv store)              Address Normalizer)      (merge, gate) │
//! │                                                        │         │
//! │                                                        ▼         │
//! │                                                  Roster Store    │
//! │                                                 (atomic write)   │
//! │                                                                  │
//! │   Database Supervisor  ◄── Status Poller ──►  local database     │
//! │   (boot/shutdown)           (log index,          HTTP API        │
//! │                              leader, nodes)                     │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core components
//!
//! - **Address Normalizer** ([`normalizer`]): rewrites unroutable advertised
//!   hosts using overlay connection evidence.
//! - **Metadata Collector** ([`collector`]): one overlay scan per reconcile
//!   tick, normalizing every observed peer.
//! - **Membership Reconciler** ([`reconciler`]): merges collected metadata,
//!   gates on quorum, and persists the roster.
//! - **Database Supervisor** ([`supervisor`]): owns the local database
//!   subprocess's boot/shutdown lifecycle.
//! - **Status Poller** ([`status`]): reads Raft log index and node
//!   membership off the database's HTTP API.
//! - **Service Lifecycle** ([`service`]): runs the reconciler and sweeper as
//!   cooperative background tasks.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use raftmesh_bridge::config::BridgeConfig;
//! use raftmesh_bridge::overlay::MockOverlayHost;
//! use raftmesh_bridge::reconciler::{NullAddressSink, Reconciler};
//! use raftmesh_bridge::service::{LogIndexSource, Service};
//!
//! struct ZeroLogIndex;
//!
//! #[async_trait::async_trait]
//! impl LogIndexSource for ZeroLogIndex {
//!     async fn raft_log_index(&self) -> u64 {
//!         0
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::default();
//!     config.validate()?;
//!
//!     let reconciler = Arc::new(Reconciler::new(
//!         config.raft_bind_address.clone(),
//!         config.http_bind_address.clone(),
//!         config.node_type,
//!         config.min_cluster_size,
//!         config.inactivity_limit,
//!         config.data_dir.clone(),
//!         config.database_name.clone(),
//!     ));
//!     let overlay = Arc::new(MockOverlayHost::new("self"));
//!
//!     let service = Service::new(
//!         reconciler,
//!         overlay,
//!         Arc::new(NullAddressSink),
//!         Arc::new(ZeroLogIndex),
//!         config.update_interval,
//!     );
//!     service.start().await?;
//!     service.stop().await;
//!
//!     Ok(())
//! }
//! ```

pub mod collector;
pub mod config;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod normalizer;
pub mod overlay;
pub mod reconciler;
pub mod roster;
pub mod service;
pub mod status;
pub mod supervisor;

pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use metadata::{NodeId, NodeType, PeerMetadata};
pub use reconciler::Reconciler;
pub use service::Service;
pub use supervisor::DatabaseSupervisor;
