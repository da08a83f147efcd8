//! Sync session
//!
//! One [`SyncSession`] drives one sync root from connect to disconnect:
//!
//! 1. start the completion and mutation queue consumers
//! 2. connect to the placeholder host
//! 3. populate the root (the whole tree under `AlwaysFull`, the first level
//!    otherwise); cancellation during population ends the session cleanly
//! 4. start the local watcher, then the remote watcher
//! 5. route settled local changes until cancelled
//!
//! Shutdown stops the watchers in reverse order, drains both queues and
//! disconnects. Once connected, the session always disconnects, whatever
//! the outcome.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tetherdrive_core::config::SyncConfig;
use tetherdrive_core::domain::{PopulationPolicy, RelativePath, SyncRoot};
use tetherdrive_core::ports::{IHostCallbacks, IPlaceholderHost, IRemoteStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::completion_queue::{CompletionQueue, CompletionQueueHandle};
use crate::connector::{ConnectorCallbacks, ConnectorOptions, VirtualizationConnector};
use crate::filter::ReservedNames;
use crate::mutation_queue::{MutationQueue, MutationQueueHandle};
use crate::path_lock::PathLockManager;
use crate::placeholders::{PlaceholderManager, PlaceholderOptions};
use crate::remote_watcher::RemoteWatcher;
use crate::watcher::{ChangeEvent, DebouncedChangeQueue, FileWatcher};

/// How long shutdown waits for a queue consumer to exit after draining
const CONSUMER_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Orchestration of one sync root
pub struct SyncSession {
    root: SyncRoot,
    config: SyncConfig,
    host: Arc<dyn IPlaceholderHost>,
    remote: Arc<dyn IRemoteStore>,
}

/// Everything that lives for the duration of a connection
struct Engine {
    placeholders: Arc<PlaceholderManager>,
    callbacks: Arc<ConnectorCallbacks>,
    connector: VirtualizationConnector,
    mutations: MutationQueueHandle,
    completions: CompletionQueueHandle,
    mutation_task: JoinHandle<()>,
    completion_task: JoinHandle<()>,
}

impl SyncSession {
    pub fn new(
        root: SyncRoot,
        config: SyncConfig,
        host: Arc<dyn IPlaceholderHost>,
        remote: Arc<dyn IRemoteStore>,
    ) -> Self {
        Self {
            root,
            config,
            host,
            remote,
        }
    }

    /// Runs the session until `cancel` fires or a fatal error occurs
    ///
    /// # Errors
    /// Returns an error if the mount directory cannot be prepared, the
    /// connection cannot be established, the remote root cannot be listed
    /// for population, the local watcher cannot start, or the disconnect
    /// fails
    #[tracing::instrument(skip(self, cancel), fields(root = %self.root.id))]
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mount_dir = self.root.mount_dir().to_path_buf();
        tokio::fs::create_dir_all(&mount_dir)
            .await
            .with_context(|| format!("Failed to create mount directory {}", mount_dir.display()))?;

        let engine = self.assemble(&cancel)?;

        if let Err(e) = engine.connector.connect().await {
            if let Err(teardown) = self.teardown(engine).await {
                debug!(error = %format!("{teardown:#}"), "Teardown after failed connect");
            }
            return Err(e);
        }

        let outcome = self.serve(&engine, &cancel).await;
        if let Err(e) = &outcome {
            warn!(root = %self.root.id, error = %format!("{e:#}"), "Sync session failed");
        }

        let disconnected = self.teardown(engine).await;
        outcome.and(disconnected)
    }

    fn assemble(&self, cancel: &CancellationToken) -> Result<Engine> {
        let reserved = ReservedNames::new(&self.config.reserved_names)?;
        let placeholders = Arc::new(PlaceholderManager::new(
            self.root.mount_dir(),
            Arc::clone(&self.host),
            Arc::clone(&self.remote),
            PathLockManager::new(),
            reserved,
            PlaceholderOptions::from_config(&self.config),
        ));

        let (completion_queue, completions) = CompletionQueue::new();
        let completion_task = tokio::spawn(completion_queue.run());

        let (mutation_queue, mutations) = MutationQueue::new(
            self.config.mutation_queue_capacity,
            Arc::clone(&placeholders),
            Arc::clone(&self.host),
            Arc::clone(&self.remote),
        );
        let mutation_task = tokio::spawn(mutation_queue.run());

        let callbacks = Arc::new(
            ConnectorCallbacks::new(
                Arc::clone(&placeholders),
                Arc::clone(&self.host),
                Arc::clone(&self.remote),
                completions.clone(),
                cancel.clone(),
                ConnectorOptions::from_config(&self.config),
            )
            .with_mutations(mutations.clone()),
        );
        let connector = VirtualizationConnector::new(
            self.root.clone(),
            Arc::clone(&self.host),
            Arc::clone(&callbacks),
        );

        Ok(Engine {
            placeholders,
            callbacks,
            connector,
            mutations,
            completions,
            mutation_task,
            completion_task,
        })
    }

    async fn serve(&self, engine: &Engine, cancel: &CancellationToken) -> Result<()> {
        let root = RelativePath::root();
        match self.root.policy {
            PopulationPolicy::AlwaysFull => {
                if let Err(e) = engine.placeholders.create_bulk(&root, cancel).await {
                    if cancel.is_cancelled() {
                        info!(root = %self.root.id, "Sync session cancelled during population");
                        return Ok(());
                    }
                    return Err(e.context("Initial population failed"));
                }
            }
            PopulationPolicy::OnDemand => {
                engine.connector.fetch_placeholders(&root, None).await;
            }
        }

        let (mut watcher, mut changes) =
            FileWatcher::new(self.config.mutation_queue_capacity)?;
        watcher.watch(self.root.mount_dir())?;

        let remote_cancel = cancel.child_token();
        let remote_watcher = RemoteWatcher::new(
            Arc::clone(&engine.callbacks),
            Arc::clone(&engine.placeholders),
            Arc::clone(&self.host),
            self.config.remote_poll_interval(),
        )
        .with_mutations(engine.mutations.clone());
        let remote_task = tokio::spawn(remote_watcher.run(remote_cancel.clone()));

        info!(root = %self.root.id, policy = ?self.root.policy, "Sync session running");

        let mut debounced = DebouncedChangeQueue::new(self.config.debounce_delay());

        loop {
            let due = debounced.next_due();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(root = %self.root.id, "Sync session cancelled");
                    break;
                }
                change = changes.recv() => match change {
                    Some(change) => debounced.push(change),
                    None => {
                        warn!(root = %self.root.id, "Local watcher channel closed");
                        break;
                    }
                },
                _ = settled(due) => {
                    for change in debounced.poll() {
                        self.route(engine, change).await;
                    }
                }
            }
        }

        // Reverse start order: remote watcher first, then the local one.
        remote_cancel.cancel();
        if let Err(e) = remote_task.await {
            warn!(root = %self.root.id, error = %e, "Remote watcher task failed");
        }
        if let Err(e) = watcher.unwatch(self.root.mount_dir()) {
            debug!(root = %self.root.id, error = %format!("{e:#}"), "Unwatch failed");
        }
        drop(watcher);

        let unrouted = debounced.drain().len();
        if unrouted > 0 {
            debug!(root = %self.root.id, count = unrouted, "Discarded unsettled local changes");
        }
        Ok(())
    }

    async fn route(&self, engine: &Engine, change: ChangeEvent) {
        let mount_dir = self.root.mount_dir();
        let notified_by_host = self.host.raises_namespace_notifications();

        match change {
            ChangeEvent::Created(path) | ChangeEvent::Modified(path) => {
                if let Err(e) = engine.mutations.push(path).await {
                    warn!(error = %e, "Failed to queue local change");
                }
            }
            ChangeEvent::Deleted(_) | ChangeEvent::Renamed { .. } if notified_by_host => {
                trace!(change = ?change, "Host reports namespace changes itself");
            }
            ChangeEvent::Deleted(path) => {
                if let Some(rel) = relative(mount_dir, &path) {
                    engine.callbacks.on_delete_completion(&rel).await;
                }
            }
            ChangeEvent::Renamed { old, new } => {
                match (relative(mount_dir, &old), relative(mount_dir, &new)) {
                    (Some(from), Some(to)) => engine.callbacks.on_rename_completion(&from, &to).await,
                    (None, Some(_)) => {
                        if let Err(e) = engine.mutations.push(new).await {
                            warn!(error = %e, "Failed to queue moved-in entry");
                        }
                    }
                    (Some(from), None) => engine.callbacks.on_delete_completion(&from).await,
                    (None, None) => {}
                }
            }
        }
    }

    /// Drains the queues, disconnects and waits for the consumers to exit
    async fn teardown(&self, engine: Engine) -> Result<()> {
        let Engine {
            placeholders,
            callbacks,
            connector,
            mutations,
            completions,
            mutation_task,
            completion_task,
        } = engine;

        // Completions may push to the mutation queue, so they drain first.
        if let Err(e) = completions.flush().await {
            warn!(root = %self.root.id, error = %e, "Failed to drain completion queue");
        }
        if let Err(e) = mutations.flush().await {
            warn!(root = %self.root.id, error = %e, "Failed to drain mutation queue");
        }

        let disconnected = connector.disconnect().await;

        drop(connector);
        drop(callbacks);
        drop(mutations);
        drop(completions);
        drop(placeholders);

        for (name, task) in [("mutation queue", mutation_task), ("completion queue", completion_task)] {
            match tokio::time::timeout(CONSUMER_EXIT_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(root = %self.root.id, consumer = name, error = %e, "Consumer task failed"),
                Err(_) => warn!(root = %self.root.id, consumer = name, "Consumer did not exit, handles still alive"),
            }
        }

        info!(root = %self.root.id, "Sync session stopped");
        disconnected
    }
}

/// Sleeps until the oldest pending change settles, forever when none is pending
async fn settled(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due.into()).await,
        None => std::future::pending().await,
    }
}

fn relative(mount_dir: &Path, path: &Path) -> Option<RelativePath> {
    RelativePath::from_local(mount_dir, path)
        .ok()
        .filter(|rel| !rel.is_root())
}
