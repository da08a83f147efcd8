//! Virtualization connector
//!
//! Bridges the engine to the placeholder host. [`VirtualizationConnector`]
//! owns the connection lifecycle; [`ConnectorCallbacks`] is the callback
//! table the host invokes while connected.
//!
//! ## Callback rules
//!
//! - Callbacks never return errors to the host. Failures are logged.
//! - Rename, delete and close completions are deferred to the
//!   [`CompletionQueue`](crate::completion_queue::CompletionQueue) so they
//!   run one at a time in arrival order.
//! - A deleted path stays registered as a pending local deletion from the
//!   delete callback until its completion has finished, so placeholders are
//!   not recreated under it meanwhile.
//! - Data requests stream the remote file in bounded chunks and report the
//!   unfulfilled remainder of the range on any failure, cancellation included.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tetherdrive_core::config::SyncConfig;
use tetherdrive_core::domain::{RelativePath, RemoteEntry, SyncRoot};
use tetherdrive_core::ports::{
    ConnectionKey, DataRequest, IHostCallbacks, IPlaceholderHost, IRemoteStore, ITransferSink,
};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::completion_queue::CompletionQueueHandle;
use crate::mutation_queue::MutationQueueHandle;
use crate::placeholders::PlaceholderManager;
use crate::retry::with_retry;
use crate::SyncError;

// ============================================================================
// Options
// ============================================================================

/// Tuning of the callback table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorOptions {
    /// Bytes read from the remote and handed to the host per chunk
    pub chunk_size: usize,
    /// Polls for local absence before a deletion is propagated
    pub delete_confirm_attempts: u32,
    /// Pause between absence polls
    pub delete_confirm_interval: Duration,
}

impl ConnectorOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            chunk_size: config.chunk_size_bytes().max(1),
            delete_confirm_attempts: config.delete_confirm_attempts.max(1),
            delete_confirm_interval: config.delete_confirm_interval(),
        }
    }
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

// ============================================================================
// ConnectorCallbacks
// ============================================================================

/// Callback table registered with the host
pub struct ConnectorCallbacks {
    placeholders: Arc<PlaceholderManager>,
    host: Arc<dyn IPlaceholderHost>,
    remote: Arc<dyn IRemoteStore>,
    completions: CompletionQueueHandle,
    mutations: Option<MutationQueueHandle>,
    cancel: CancellationToken,
    options: ConnectorOptions,
}

impl ConnectorCallbacks {
    pub fn new(
        placeholders: Arc<PlaceholderManager>,
        host: Arc<dyn IPlaceholderHost>,
        remote: Arc<dyn IRemoteStore>,
        completions: CompletionQueueHandle,
        cancel: CancellationToken,
        options: ConnectorOptions,
    ) -> Self {
        Self {
            placeholders,
            host,
            remote,
            completions,
            mutations: None,
            cancel,
            options,
        }
    }

    /// Routes renames of never-synced entries to the local mutation queue
    pub fn with_mutations(mut self, mutations: MutationQueueHandle) -> Self {
        self.mutations = Some(mutations);
        self
    }

    fn mount_dir(&self) -> &Path {
        self.placeholders.mount_dir()
    }

    fn is_reserved(&self, path: &RelativePath) -> bool {
        self.placeholders.reserved().is_reserved(path)
    }

    async fn list_matching(
        &self,
        directory: &RelativePath,
        pattern: Option<&str>,
    ) -> Result<Vec<RemoteEntry>> {
        let remote = &self.remote;
        let policy = self.placeholders.retry_policy();
        let files = with_retry(policy, "list_files", move || {
            remote.list_files(directory, pattern)
        })
        .await?;
        let directories = with_retry(policy, "list_directories", move || {
            remote.list_directories(directory, pattern)
        })
        .await?;

        Ok(files
            .into_iter()
            .chain(directories)
            .filter(|e| !self.is_reserved(&e.relative_path))
            .collect())
    }

    async fn transfer(
        &self,
        request: &DataRequest,
        sink: &dyn ITransferSink,
        transferred: &mut u64,
    ) -> Result<()> {
        if request.length == 0 {
            return Ok(());
        }

        let remote = &self.remote;
        let path = &request.path;
        let offset = request.offset;
        let mut reader = with_retry(self.placeholders.retry_policy(), "open_read", move || {
            remote.open_read(path, offset)
        })
        .await
        .with_context(|| format!("Failed to open {path} for reading"))?;

        let mut buf = vec![0u8; self.options.chunk_size];
        while *transferred < request.length {
            if self.cancel.is_cancelled() || sink.is_cancelled() {
                return Err(SyncError::Cancelled.into());
            }

            let want = (request.length - *transferred).min(buf.len() as u64) as usize;
            let n = read_full(&mut reader, &mut buf[..want]).await?;
            if n == 0 {
                return Err(SyncError::ShortRead {
                    path: path.clone(),
                    offset: request.offset + *transferred,
                }
                .into());
            }

            let chunk_offset = request.offset + *transferred;
            sink.report_progress(request.length, *transferred + n as u64)
                .await?;
            sink.write_chunk(chunk_offset, &buf[..n]).await?;
            *transferred += n as u64;
            trace!(path = %path, offset = chunk_offset, len = n, "Transferred chunk");
        }
        Ok(())
    }

    /// Deletes local entries below `directory` that no longer exist remotely
    ///
    /// Only managed placeholders are removed; local-only entries are pending
    /// upload and left alone. Descends only into populated directories.
    pub async fn update_placeholders(&self, directory: &RelativePath) -> Result<()> {
        let mut pending = VecDeque::from([directory.clone()]);

        while let Some(dir) = pending.pop_front() {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled.into());
            }

            let remote_names: HashSet<String> = match self.list_matching(&dir, None).await {
                Ok(entries) => entries.iter().map(|e| e.name().to_string()).collect(),
                Err(e) => {
                    warn!(dir = %dir, error = %format!("{e:#}"), "Failed to list remote directory, skipping");
                    continue;
                }
            };

            let local_dir = dir.to_local(self.mount_dir());
            let mut children = match tokio::fs::read_dir(&local_dir).await {
                Ok(children) => children,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(dir = %dir, error = %e, "Failed to read local directory");
                    continue;
                }
            };

            while let Some(child) = children.next_entry().await? {
                let Some(name) = child.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                let child_path = dir.join(&name)?;
                if self.is_reserved(&child_path) {
                    continue;
                }
                let Some(info) = self.host.placeholder_info(&child_path).await? else {
                    continue;
                };

                if !remote_names.contains(&name) {
                    if !info.is_placeholder {
                        trace!(path = %child_path, "Local-only entry, keeping");
                        continue;
                    }
                    let result = if info.is_directory {
                        self.placeholders.delete_bulk(&child_path).await
                    } else {
                        self.placeholders.delete(&child_path).await
                    };
                    match result {
                        Ok(()) => info!(path = %child_path, "Removed entry deleted remotely"),
                        Err(e) => {
                            warn!(path = %child_path, error = %format!("{e:#}"), "Failed to remove entry deleted remotely")
                        }
                    }
                    continue;
                }

                if info.is_directory && !info.offline {
                    pending.push_back(child_path);
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl IHostCallbacks for ConnectorCallbacks {
    async fn fetch_placeholders(&self, directory: &RelativePath, pattern: Option<&str>) {
        if self.is_reserved(directory) {
            return;
        }

        let result = async {
            let batch = self.list_matching(directory, pattern).await?;
            self.host.create_placeholders(directory, &batch).await?;
            Ok::<_, anyhow::Error>(batch.len())
        }
        .await;

        match result {
            Ok(count) => debug!(dir = %directory, count, "Placeholders fetched"),
            Err(e) => {
                warn!(dir = %directory, error = %format!("{e:#}"), "Failed to fetch placeholders")
            }
        }
    }

    async fn fetch_data(&self, request: DataRequest, sink: &dyn ITransferSink) {
        let mut transferred = 0u64;
        let result = self.transfer(&request, sink, &mut transferred).await;

        match result {
            Ok(()) => {
                debug!(path = %request.path, offset = request.offset, length = request.length, "Data request served");
            }
            Err(e) => {
                let offset = request.offset + transferred;
                let remaining = request.length - transferred;
                warn!(
                    path = %request.path,
                    offset,
                    remaining,
                    error = %format!("{e:#}"),
                    "Data request failed"
                );
                if let Err(e) = sink.fail_range(offset, remaining).await {
                    warn!(path = %request.path, error = %format!("{e:#}"), "Failed to report failed range");
                }
            }
        }
    }

    async fn on_close_completion(&self, path: &RelativePath) {
        if self.is_reserved(path) {
            return;
        }
        let placeholders = Arc::clone(&self.placeholders);
        let path = path.clone();
        let label = format!("close {path}");
        let result = self.completions.enqueue(label, async move {
            placeholders.update_file(&path, false).await
        });
        if let Err(e) = result {
            warn!(error = %e, "Dropped close completion");
        }
    }

    async fn on_rename_completion(&self, from: &RelativePath, to: &RelativePath) {
        if self.is_reserved(from) || self.is_reserved(to) {
            debug!(from = %from, to = %to, "Rename involves a reserved name, ignoring");
            return;
        }

        let placeholders = Arc::clone(&self.placeholders);
        let remote = Arc::clone(&self.remote);
        let mutations = self.mutations.clone();
        let (from, to) = (from.clone(), to.clone());
        let label = format!("rename {from} -> {to}");

        let result = self.completions.enqueue(label, async move {
            let policy = *placeholders.retry_policy();
            let store = &remote;
            let source = &from;
            let target = &to;

            let known = with_retry(&policy, "exists", move || store.exists(source)).await?;
            if !known {
                // Never synced: upload the entry under its new name instead.
                debug!(from = %from, to = %to, "Rename source unknown remotely");
                if let Some(mutations) = mutations {
                    mutations.push(to.to_local(placeholders.mount_dir())).await?;
                }
                return Ok(());
            }

            with_retry(&policy, "rename", move || store.rename(source, target))
                .await
                .with_context(|| format!("Failed to rename {from} to {to} remotely"))?;
            info!(from = %from, to = %to, "Propagated rename");

            let is_dir = tokio::fs::metadata(to.to_local(placeholders.mount_dir()))
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if is_dir {
                placeholders.rename_directory(&from, &to).await
            } else {
                placeholders.rename_file(&from, &to).await
            }
        });
        if let Err(e) = result {
            warn!(error = %e, "Dropped rename completion");
        }
    }

    async fn on_delete_completion(&self, path: &RelativePath) {
        if self.is_reserved(path) || path.is_root() {
            return;
        }

        let placeholders = Arc::clone(&self.placeholders);
        let remote = Arc::clone(&self.remote);
        let cancel = self.cancel.clone();
        let options = self.options.clone();
        let path = path.clone();
        let label = format!("delete {path}");
        let pending = PendingDelete::begin(Arc::clone(&placeholders), path.clone());

        let result = self.completions.enqueue(label, async move {
            let _pending = pending;
            let local = path.to_local(placeholders.mount_dir());
            let mut absent = false;
            for attempt in 0..options.delete_confirm_attempts {
                if tokio::fs::symlink_metadata(&local).await.is_err() {
                    absent = true;
                    break;
                }
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled.into());
                }
                trace!(path = %path, attempt, "Waiting for local deletion to settle");
                tokio::time::sleep(options.delete_confirm_interval).await;
            }

            if !absent {
                warn!(path = %path, "Entry still present locally, not deleting remotely");
                return Ok(());
            }

            let policy = *placeholders.retry_policy();
            let store = &remote;
            let target = &path;
            let Some(entry) = with_retry(&policy, "metadata", move || store.metadata(target)).await?
            else {
                trace!(path = %path, "Already absent remotely");
                return Ok(());
            };

            if entry.is_directory {
                with_retry(&policy, "delete_directory", move || store.delete_directory(target))
                    .await?;
            } else {
                with_retry(&policy, "delete_file", move || store.delete_file(target)).await?;
            }
            info!(path = %path, directory = entry.is_directory, "Propagated deletion");
            Ok(())
        });
        if let Err(e) = result {
            warn!(error = %e, "Dropped delete completion");
        }
    }
}

/// Keeps a local deletion registered until its completion has run or been dropped
struct PendingDelete {
    placeholders: Arc<PlaceholderManager>,
    path: RelativePath,
}

impl PendingDelete {
    fn begin(placeholders: Arc<PlaceholderManager>, path: RelativePath) -> Self {
        placeholders.begin_local_delete(&path);
        Self { placeholders, path }
    }
}

impl Drop for PendingDelete {
    fn drop(&mut self) {
        self.placeholders.end_local_delete(&self.path);
    }
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: tokio::io::AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// ============================================================================
// VirtualizationConnector
// ============================================================================

struct Connection {
    key: ConnectionKey,
    // Owned for exactly as long as the host may call into it.
    _callbacks: Arc<dyn IHostCallbacks>,
}

/// Connection lifecycle between one sync root and the host
pub struct VirtualizationConnector {
    root: SyncRoot,
    host: Arc<dyn IPlaceholderHost>,
    callbacks: Arc<ConnectorCallbacks>,
    connection: Mutex<Option<Connection>>,
}

impl VirtualizationConnector {
    pub fn new(
        root: SyncRoot,
        host: Arc<dyn IPlaceholderHost>,
        callbacks: Arc<ConnectorCallbacks>,
    ) -> Self {
        Self {
            root,
            host,
            callbacks,
            connection: Mutex::new(None),
        }
    }

    /// The callback table handed to the host on connect
    pub fn callbacks(&self) -> &Arc<ConnectorCallbacks> {
        &self.callbacks
    }

    /// Registers the callback table with the host
    ///
    /// # Errors
    /// Returns `SyncError::AlreadyConnected` if a connection is active, or the
    /// host's error if registration fails
    #[tracing::instrument(skip(self), fields(root = %self.root.id))]
    pub async fn connect(&self) -> Result<ConnectionKey> {
        let mut slot = self.connection.lock().await;
        if slot.is_some() {
            return Err(SyncError::AlreadyConnected.into());
        }

        let callbacks: Arc<dyn IHostCallbacks> = self.callbacks.clone();
        let key = self
            .host
            .connect(&self.root, Arc::clone(&callbacks))
            .await
            .with_context(|| format!("Failed to connect sync root {}", self.root.id))?;

        *slot = Some(Connection {
            key,
            _callbacks: callbacks,
        });
        info!(root = %self.root.id, key = %key, "Connected to placeholder host");
        Ok(key)
    }

    /// Unregisters from the host
    ///
    /// A call without an active connection is a no-op. The callback table
    /// stays owned until the host has confirmed the disconnect.
    #[tracing::instrument(skip(self), fields(root = %self.root.id))]
    pub async fn disconnect(&self) -> Result<()> {
        let mut slot = self.connection.lock().await;
        let Some(connection) = slot.as_ref() else {
            debug!(root = %self.root.id, "Not connected, nothing to disconnect");
            return Ok(());
        };

        self.host
            .disconnect(connection.key)
            .await
            .with_context(|| format!("Failed to disconnect sync root {}", self.root.id))?;

        let key = connection.key;
        *slot = None;
        info!(root = %self.root.id, key = %key, "Disconnected from placeholder host");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    pub async fn fetch_placeholders(&self, directory: &RelativePath, pattern: Option<&str>) {
        self.callbacks.fetch_placeholders(directory, pattern).await;
    }

    pub async fn fetch_data(&self, request: DataRequest, sink: &dyn ITransferSink) {
        self.callbacks.fetch_data(request, sink).await;
    }

    pub async fn update_placeholders(&self, directory: &RelativePath) -> Result<()> {
        self.callbacks.update_placeholders(directory).await
    }
}
