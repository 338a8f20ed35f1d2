//! Service lifecycle: starts the periodic reconciler and sweeper as
//! cooperative background tasks, with clean cancellation on shutdown
//! (§4.I).

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::overlay::OverlayHost;
use crate::reconciler::{AdvertisedAddressSink, Reconciler};

/// Supplies the self Raft log index the reconciler stamps into its own
/// metadata entry on every tick. Implemented by whatever owns the
/// [`crate::supervisor::DatabaseSupervisor`] in the embedding application.
#[async_trait::async_trait]
pub trait LogIndexSource: Send + Sync {
    /// The current Raft log index for self, best-effort (§4.H).
    async fn raft_log_index(&self) -> u64;
}

struct Handles {
    sync_task: JoinHandle<()>,
    cleanup_task: JoinHandle<()>,
    token: CancellationToken,
}

/// Owns the two long-lived background activities (`periodic_sync`,
/// `periodic_cleanup`) and their shared cancellation token. `start`/`stop`
/// are idempotent per §4.I; misuse (double start, stop-before-start) is
/// reported through [`BridgeError::LifecycleMisuse`].
pub struct Service {
    reconciler: Arc<Reconciler>,
    overlay: Arc<dyn OverlayHost>,
    sink: Arc<dyn AdvertisedAddressSink>,
    log_index_source: Arc<dyn LogIndexSource>,
    update_interval: std::time::Duration,
    handles: Mutex<Option<Handles>>,
}

impl Service {
    /// Build a service around an already-constructed reconciler and its
    /// collaborators. Does not itself start any background work.
    #[must_use]
    pub fn new(
        reconciler: Arc<Reconciler>,
        overlay: Arc<dyn OverlayHost>,
        sink: Arc<dyn AdvertisedAddressSink>,
        log_index_source: Arc<dyn LogIndexSource>,
        update_interval: std::time::Duration,
    ) -> Self {
        Self {
            reconciler,
            overlay,
            sink,
            log_index_source,
            update_interval,
            handles: Mutex::new(None),
        }
    }

    /// Idempotent under `started`: spawns `periodic_sync` (first tick at
    /// `now + update_interval`, then every `update_interval`) and
    /// `periodic_cleanup` (every 5 minutes) as cooperative Tokio tasks.
    pub async fn start(&self) -> BridgeResult<()> {
        let mut guard = self.handles.lock().await;
        if guard.is_some() {
            return Err(BridgeError::LifecycleMisuse("start called while already started".to_string()));
        }

        let token = CancellationToken::new();

        let sync_task = tokio::spawn(periodic_sync(
            self.reconciler.clone(),
            self.overlay.clone(),
            self.sink.clone(),
            self.log_index_source.clone(),
            self.update_interval,
            token.child_token(),
        ));

        let cleanup_task = tokio::spawn(periodic_cleanup(self.reconciler.clone(), token.child_token()));

        *guard = Some(Handles {
            sync_task,
            cleanup_task,
            token,
        });

        info!("bridge service started");
        Ok(())
    }

    /// Cancels the child token; background activities observe cancellation
    /// at their next suspension point. Does not wait for them to drain —
    /// callers needing that should `.await` [`Service::join`]. A `stop`
    /// before `start` is a no-op, not an error, per §7 `LifecycleMisuse`
    /// policy ("Stop is a no-op").
    pub async fn stop(&self) {
        let mut guard = self.handles.lock().await;
        if let Some(handles) = guard.take() {
            handles.token.cancel();
            info!("bridge service stop requested");
        }
    }

    /// Await both background tasks to completion. Only meaningful after
    /// `stop` has been called; otherwise blocks until the tasks finish on
    /// their own (they do not, by design, except on cancellation).
    pub async fn join(self) {
        let handles = self.handles.lock().await.take();
        if let Some(handles) = handles {
            let _ = handles.sync_task.await;
            let _ = handles.cleanup_task.await;
        }
    }
}

async fn periodic_sync(
    reconciler: Arc<Reconciler>,
    overlay: Arc<dyn OverlayHost>,
    sink: Arc<dyn AdvertisedAddressSink>,
    log_index_source: Arc<dyn LogIndexSource>,
    update_interval: std::time::Duration,
    token: CancellationToken,
) {
    // First tick fires after update_interval has elapsed, not immediately —
    // gives the database subprocess time to come up.
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + update_interval,
        update_interval,
    );

    loop {
        tokio::select! {
            () = token.cancelled() => {
                info!("periodic sync cancelled");
                return;
            }
            _ = ticker.tick() => {
                let raft_log_index = log_index_source.raft_log_index().await;
                if let Err(err) = reconciler.reconcile(overlay.as_ref(), sink.as_ref(), raft_log_index).await {
                    warn!(error = %err, "reconcile tick failed");
                }
            }
        }
    }
}

async fn periodic_cleanup(reconciler: Arc<Reconciler>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5 * 60));

    loop {
        tokio::select! {
            () = token.cancelled() => {
                info!("periodic cleanup cancelled");
                return;
            }
            _ = ticker.tick() => {
                match reconciler.sweep_inactive().await {
                    Ok(removed_any) => {
                        if removed_any {
                            info!("inactivity sweep removed stale peers");
                        }
                    }
                    Err(err) => warn!(error = %err, "inactivity sweep failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::NodeType;
    use crate::overlay::MockOverlayHost;
    use crate::reconciler::NullAddressSink;

    struct ZeroLogIndex;

    #[async_trait::async_trait]
    impl LogIndexSource for ZeroLogIndex {
        async fn raft_log_index(&self) -> u64 {
            0
        }
    }

    fn service(data_dir: &std::path::Path) -> Service {
        let reconciler = Arc::new(Reconciler::new(
            "10.0.0.1:4002".into(),
            "10.0.0.1:4001".into(),
            NodeType::Bootstrap,
            1,
            std::time::Duration::from_secs(3600),
            data_dir.to_path_buf(),
            "testdb".to_string(),
        ));
        let overlay = Arc::new(MockOverlayHost::new("self"));
        Service::new(
            reconciler,
            overlay,
            Arc::new(NullAddressSink),
            Arc::new(ZeroLogIndex),
            std::time::Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn start_is_idempotent_and_rejects_double_start() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service(tmp.path());
        service.start().await.unwrap();
        let second = service.start().await;
        assert!(second.is_err());
        service.stop().await;
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service(tmp.path());
        service.stop().await;
    }

    #[tokio::test]
    async fn stop_then_start_again_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service(tmp.path());
        service.start().await.unwrap();
        service.stop().await;
        service.start().await.unwrap();
        service.stop().await;
    }
}
