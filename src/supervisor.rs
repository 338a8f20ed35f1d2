//! Database supervisor: boot/shutdown lifecycle for the local database
//! subprocess (§4.G).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use backon::{ConstantBuilder, Retryable};
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::metadata::NodeType;

/// Lifecycle phase of the supervised database process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseStatus {
    /// Process has been spawned but has not yet passed readiness checks.
    Initializing,
    /// Process passed readiness and is serving traffic.
    Active,
    /// Process has been shut down.
    Hibernating,
}

/// Manages the lifecycle of one local database subprocess instance.
pub struct DatabaseSupervisor {
    database_name: String,
    http_port: u16,
    raft_port: u16,
    root_dir: PathBuf,
    database_binary: PathBuf,
    raft_advertise_address: Option<String>,
    http_advertise_address: Option<String>,
    join_target: Option<String>,
    node_type: NodeType,
    http_client: reqwest::Client,
    child: Option<Child>,
    status: DatabaseStatus,
    last_query: Option<Instant>,
}

impl DatabaseSupervisor {
    /// Build a supervisor for the instance named `database_name`, reading
    /// ports, binary path, advertise addresses, and join target from
    /// `config`.
    #[must_use]
    pub fn new(config: &BridgeConfig, http_port: u16, raft_port: u16) -> Self {
        Self {
            database_name: config.database_name.clone(),
            http_port,
            raft_port,
            root_dir: config.data_dir.clone(),
            database_binary: config.database_binary.clone(),
            raft_advertise_address: config.raft_advertise_address.clone(),
            http_advertise_address: config.http_advertise_address.clone(),
            join_target: config.join_target.clone(),
            node_type: config.node_type,
            http_client: reqwest::Client::new(),
            child: None,
            status: DatabaseStatus::Initializing,
            last_query: None,
        }
    }

    /// `<root>/<database_name>/rqlite`, the directory passed as the
    /// database binary's positional data-directory argument.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        crate::roster::expand_data_dir(&self.root_dir)
            .join(&self.database_name)
            .join("rqlite")
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn status(&self) -> DatabaseStatus {
        self.status
    }

    /// `exists(data_dir/raft.db)` (§4.G pre-start inspection).
    #[must_use]
    pub fn has_existing_data(&self) -> bool {
        self.data_dir().join("raft.db").exists()
    }

    /// `has_existing_data() ∧ (exists(data_dir/raft/peers.json) ∨
    /// size(raft.db) > 0)` (§4.G pre-start inspection).
    #[must_use]
    pub fn was_in_cluster(&self) -> bool {
        if !self.has_existing_data() {
            return false;
        }
        let peers_json = self.data_dir().join("raft").join("peers.json");
        if peers_json.exists() {
            return true;
        }
        std::fs::metadata(self.data_dir().join("raft.db"))
            .map(|meta| meta.len() > 0)
            .unwrap_or(false)
    }

    fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-http-addr".to_string(),
            format!("0.0.0.0:{}", self.http_port),
            "-raft-addr".to_string(),
            format!("0.0.0.0:{}", self.raft_port),
        ];

        if let Some(http_adv) = &self.http_advertise_address {
            if !http_adv.is_empty() {
                args.push("-http-adv-addr".to_string());
                args.push(http_adv.clone());
            }
        }
        if let Some(raft_adv) = &self.raft_advertise_address {
            if !raft_adv.is_empty() {
                args.push("-raft-adv-addr".to_string());
                args.push(raft_adv.clone());
            }
        }

        let is_leader = self.node_type == NodeType::Bootstrap;
        if !is_leader {
            if let Some(target) = &self.join_target {
                if !target.is_empty() {
                    args.push("-join".to_string());
                    args.push(target.clone());
                    args.push("-join-as".to_string());
                    args.push("voter".to_string());
                }
            }
        }

        args.push(self.data_dir().to_string_lossy().into_owned());
        args
    }

    /// Run the full boot sequence: pre-start safety checks, spawn, HTTP
    /// readiness, SQL readiness (§4.G). Updates `caller` via the sink's
    /// `update_advertised_addresses` is out of scope here — that happens
    /// in the reconciler's normalizer path; this method only manages the
    /// subprocess itself.
    pub async fn boot(&mut self) -> BridgeResult<()> {
        let is_leader = self.node_type == NodeType::Bootstrap;
        let has_existing_data = self.has_existing_data();

        if is_leader && self.join_target.is_none() && has_existing_data {
            warn!(database = %self.database_name, "existing data present, skipping bootstrap request");
        }
        if !is_leader && self.join_target.is_none() && has_existing_data {
            return Err(BridgeError::SupervisorBoot(
                "existing Raft state but no join address provided".to_string(),
            ));
        }

        std::fs::create_dir_all(self.data_dir())?;

        let args = self.build_args();
        info!(database = %self.database_name, ?args, "spawning database process");

        let child = Command::new(&self.database_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(BridgeError::ProcessSpawn)?;
        self.child = Some(child);

        if let Err(err) = self.wait_http_ready().await {
            self.terminate_partial_boot().await;
            return Err(err);
        }

        if is_leader {
            if let Err(err) = self.wait_leader_sql_ready().await {
                self.terminate_partial_boot().await;
                return Err(err);
            }
        } else if let Err(err) = self.wait_follower_ready().await {
            // Soft failure: log and continue, rely on a background watcher.
            warn!(database = %self.database_name, error = %err, "follower join confirmation timed out, continuing boot");
        }

        self.status = DatabaseStatus::Active;
        self.last_query = Some(Instant::now());
        Ok(())
    }

    async fn terminate_partial_boot(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }

    async fn wait_http_ready(&self) -> BridgeResult<()> {
        let client = self.http_client.clone();
        let url = format!("http://localhost:{}/status", self.http_port);
        let backoff = ConstantBuilder::default()
            .with_delay(Duration::from_secs(1))
            .with_max_times(60);

        (|| {
            let client = client.clone();
            let url = url.clone();
            async move {
                client
                    .get(&url)
                    .timeout(Duration::from_secs(2))
                    .send()
                    .await?
                    .error_for_status()
            }
        })
        .retry(backoff)
        .await
        .map_err(|_| BridgeError::SupervisorBoot("database HTTP API never became ready".to_string()))?;

        Ok(())
    }

    async fn run_sql(&self, statement: &str) -> BridgeResult<()> {
        let url = format!("http://localhost:{}/db/query", self.http_port);
        self.http_client
            .post(&url)
            .json(&[statement])
            .timeout(Duration::from_secs(2))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn wait_leader_sql_ready(&self) -> BridgeResult<()> {
        let backoff = ConstantBuilder::default()
            .with_delay(Duration::from_secs(1))
            .with_max_times(60);

        (|| async { self.run_sql("SELECT 1").await })
            .retry(backoff)
            .await
            .map_err(|_| BridgeError::SupervisorBoot("leader never became SQL-ready".to_string()))?;

        Ok(())
    }

    async fn wait_follower_ready(&self) -> BridgeResult<()> {
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut status_ok_streak = 0u32;

        while Instant::now() < deadline {
            let status_url = format!("http://localhost:{}/status", self.http_port);
            let status_ok = self
                .http_client
                .get(&status_url)
                .timeout(Duration::from_secs(2))
                .send()
                .await
                .is_ok_and(|response| response.status().is_success());

            if status_ok {
                status_ok_streak += 1;
                if self.run_sql("SELECT 1").await.is_ok() {
                    return Ok(());
                }
                if status_ok_streak >= 5 {
                    info!(database = %self.database_name, "accepting follower as joined on status evidence alone");
                    return Ok(());
                }
            }

            sleep(Duration::from_secs(2)).await;
        }

        Err(BridgeError::SupervisorBoot("follower readiness timed out".to_string()))
    }

    /// Close the SQL connection (a no-op for an HTTP-backed client), send a
    /// graceful-terminate signal, wait up to 5 s, then force kill
    /// (§4.G shutdown).
    pub async fn shutdown(&mut self) -> BridgeResult<()> {
        self.status = DatabaseStatus::Hibernating;

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        send_terminate_signal(&child, &self.database_name);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match child.try_wait() {
                Ok(Some(_exit_status)) => break,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill().await;
                        let _ = child.wait().await;
                        break;
                    }
                    sleep(Duration::from_millis(200)).await;
                }
                Err(_) => break,
            }
        }

        info!(database = %self.database_name, "database process shut down");
        Ok(())
    }
}

/// Send the platform graceful-terminate signal (`SIGTERM` on Unix) to
/// `child`, giving it the chance to flush and exit cleanly inside the
/// caller's 5 s grace window before a force kill (§4.G/§6). A signal send
/// failure is logged and otherwise ignored — the grace-window loop in
/// `shutdown` still force-kills once the deadline passes.
#[cfg(unix)]
fn send_terminate_signal(child: &Child, database_name: &str) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = i32::try_from(pid) else {
        warn!(database = %database_name, pid, "child pid out of range for signalling, relying on force kill");
        return;
    };

    if let Err(err) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(database = %database_name, error = %err, "failed to send SIGTERM, relying on force kill after the grace window");
    }
}

#[cfg(not(unix))]
fn send_terminate_signal(_child: &Child, _database_name: &str) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.database_name = "testdb".to_string();
        config
    }

    #[test]
    fn data_dir_is_scoped_under_root_and_database_name() {
        let config = config();
        let supervisor = DatabaseSupervisor::new(&config, 4001, 4002);
        assert!(supervisor.data_dir().ends_with("testdb/rqlite"));
    }

    #[test]
    fn has_existing_data_is_false_for_a_fresh_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config();
        config.data_dir = tmp.path().to_path_buf();
        let supervisor = DatabaseSupervisor::new(&config, 4001, 4002);
        assert!(!supervisor.has_existing_data());
        assert!(!supervisor.was_in_cluster());
    }

    #[test]
    fn was_in_cluster_requires_peers_json_or_nonempty_raft_db() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config();
        config.data_dir = tmp.path().to_path_buf();
        let supervisor = DatabaseSupervisor::new(&config, 4001, 4002);

        std::fs::create_dir_all(supervisor.data_dir()).unwrap();
        std::fs::write(supervisor.data_dir().join("raft.db"), []).unwrap();
        assert!(supervisor.has_existing_data());
        assert!(!supervisor.was_in_cluster());

        std::fs::write(supervisor.data_dir().join("raft.db"), [0u8; 16]).unwrap();
        assert!(supervisor.was_in_cluster());
    }

    #[test]
    fn build_args_includes_join_flags_only_for_followers_with_a_target() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config();
        config.data_dir = tmp.path().to_path_buf();
        config.node_type = NodeType::Worker;
        config.join_target = Some("10.0.0.1:4002".to_string());
        let supervisor = DatabaseSupervisor::new(&config, 4001, 4002);

        let args = supervisor.build_args();
        assert!(args.windows(2).any(|w| w == ["-join".to_string(), "10.0.0.1:4002".to_string()]));
        assert!(args.contains(&"voter".to_string()));
    }

    #[test]
    fn build_args_omits_join_flags_for_bootstrap() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config();
        config.data_dir = tmp.path().to_path_buf();
        config.node_type = NodeType::Bootstrap;
        config.join_target = Some("10.0.0.1:4002".to_string());
        let supervisor = DatabaseSupervisor::new(&config, 4001, 4002);

        let args = supervisor.build_args();
        assert!(!args.contains(&"-join".to_string()));
    }
}
