//! Sync root pool
//!
//! Keeps at most one running session per [`SyncRootId`]. Each session runs
//! in its own task with its own cancellation token; when the task ends for
//! any reason it unregisters itself, guarded by a generation number so that
//! a stale worker never removes its replacement.
//!
//! `start`/`stop` calls are serialized: restarting a root fully stops the
//! old worker before the new one is spawned.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use futures_util::FutureExt;
use tetherdrive_core::config::SyncConfig;
use tetherdrive_core::domain::{SyncRoot, SyncRootId};
use tetherdrive_core::ports::{IPlaceholderHost, IRemoteStore};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::session::SyncSession;

/// Runs the session of one sync root until cancelled
#[async_trait::async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn run(&self, root: SyncRoot, cancel: CancellationToken) -> Result<()>;
}

/// Builds the remote store of a sync root
pub type RemoteFactory = Arc<dyn Fn(&SyncRoot) -> Result<Arc<dyn IRemoteStore>> + Send + Sync>;

/// Builds the placeholder host of a sync root
pub type HostFactory = Arc<dyn Fn(&SyncRoot) -> Result<Arc<dyn IPlaceholderHost>> + Send + Sync>;

/// Launches real [`SyncSession`]s
pub struct EngineLauncher {
    config: SyncConfig,
    remote_factory: RemoteFactory,
    host_factory: HostFactory,
}

impl EngineLauncher {
    pub fn new(config: SyncConfig, remote_factory: RemoteFactory, host_factory: HostFactory) -> Self {
        Self {
            config,
            remote_factory,
            host_factory,
        }
    }
}

#[async_trait::async_trait]
impl SessionLauncher for EngineLauncher {
    async fn run(&self, root: SyncRoot, cancel: CancellationToken) -> Result<()> {
        let remote = (self.remote_factory)(&root)?;
        let host = (self.host_factory)(&root)?;
        SyncSession::new(root, self.config.clone(), host, remote)
            .run(cancel)
            .await
    }
}

struct Worker {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of running sync root sessions
pub struct SyncRootPool {
    launcher: Arc<dyn SessionLauncher>,
    workers: Arc<DashMap<SyncRootId, Worker>>,
    next_generation: AtomicU64,
    ops: Mutex<()>,
}

impl SyncRootPool {
    pub fn new(launcher: Arc<dyn SessionLauncher>) -> Self {
        Self {
            launcher,
            workers: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            ops: Mutex::new(()),
        }
    }

    /// Starts (or restarts) the session of `root`
    ///
    /// # Errors
    /// Returns an error if the root definition is invalid; nothing is
    /// stopped in that case
    #[tracing::instrument(skip(self, root), fields(root = %root.id))]
    pub async fn start(&self, root: SyncRoot) -> Result<()> {
        root.validate()?;
        let _ops = self.ops.lock().await;

        self.stop_locked(&root.id).await;

        let id = root.id.clone();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let launcher = Arc::clone(&self.launcher);
        let workers = Arc::clone(&self.workers);
        let token = cancel.clone();
        let task_id = id.clone();

        let handle = tokio::spawn(async move {
            // The worker must be in the map before it can remove itself.
            if registered_rx.await.is_err() {
                return;
            }
            info!(root = %task_id, generation, "Sync root worker started");

            match AssertUnwindSafe(launcher.run(root, token)).catch_unwind().await {
                Ok(Ok(())) => info!(root = %task_id, generation, "Sync root worker finished"),
                Ok(Err(e)) => {
                    error!(root = %task_id, generation, error = %format!("{e:#}"), "Sync root worker failed")
                }
                Err(_) => error!(root = %task_id, generation, "Sync root worker panicked"),
            }

            workers.remove_if(&task_id, |_, worker| worker.generation == generation);
        });

        self.workers.insert(
            id,
            Worker {
                generation,
                cancel,
                handle,
            },
        );
        let _ = registered_tx.send(());
        Ok(())
    }

    /// Stops the session of `id` and waits for it to finish
    ///
    /// Returns whether a worker was running.
    pub async fn stop(&self, id: &SyncRootId) -> bool {
        let _ops = self.ops.lock().await;
        self.stop_locked(id).await
    }

    pub async fn stop_sync_root(&self, root: &SyncRoot) -> bool {
        self.stop(&root.id).await
    }

    /// Stops every session
    pub async fn stop_all(&self) {
        let _ops = self.ops.lock().await;
        let ids: Vec<SyncRootId> = self.workers.iter().map(|w| w.key().clone()).collect();
        for id in &ids {
            self.stop_locked(id).await;
        }
        info!(count = ids.len(), "All sync root workers stopped");
    }

    pub fn has(&self, id: &SyncRootId) -> bool {
        self.workers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    async fn stop_locked(&self, id: &SyncRootId) -> bool {
        let Some((_, worker)) = self.workers.remove(id) else {
            return false;
        };

        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            warn!(root = %id, error = %e, "Sync root worker task failed");
        }
        info!(root = %id, generation = worker.generation, "Sync root worker stopped");
        true
    }
}
