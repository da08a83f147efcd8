//! Local mutation queue
//!
//! Debounced local filesystem changes are pushed here as absolute paths and
//! reconciled one at a time by a single consumer:
//!
//! - paths outside the sync root, reserved names and vanished entries are
//!   discarded
//! - partially hydrated files get a non-destructive refresh
//! - anything else is processed under its path lock: local-only content is
//!   uploaded, local edits of synced files are pushed (offline stubs the user
//!   wrote to included), and unchanged entries are refreshed from the remote
//!   metadata
//!
//! A failure is logged and never stops the consumer.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::FutureExt;
use tetherdrive_core::domain::{LocalPlaceholderInfo, PlaceholderState, RelativePath};
use tetherdrive_core::ports::{IPlaceholderHost, IRemoteStore};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::placeholders::PlaceholderManager;
use crate::retry::with_retry;
use crate::SyncError;

enum MutationMessage {
    Changed(PathBuf),
    Flush(oneshot::Sender<()>),
}

/// Producer side of the mutation queue
#[derive(Clone)]
pub struct MutationQueueHandle {
    tx: mpsc::Sender<MutationMessage>,
}

impl MutationQueueHandle {
    /// Queues a changed local path, waiting for room when the queue is full
    pub async fn push(&self, path: PathBuf) -> Result<(), SyncError> {
        self.tx
            .send(MutationMessage::Changed(path))
            .await
            .map_err(|_| SyncError::QueueClosed("mutation queue"))
    }

    /// Waits until every path pushed before this call has been processed
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(MutationMessage::Flush(tx))
            .await
            .map_err(|_| SyncError::QueueClosed("mutation queue"))?;
        rx.await.map_err(|_| SyncError::QueueClosed("mutation queue"))
    }
}

/// Single consumer of local mutations
pub struct MutationQueue {
    rx: mpsc::Receiver<MutationMessage>,
    placeholders: Arc<PlaceholderManager>,
    host: Arc<dyn IPlaceholderHost>,
    remote: Arc<dyn IRemoteStore>,
}

impl MutationQueue {
    /// Creates the queue and its producer handle
    ///
    /// The caller must spawn [`run`](MutationQueue::run).
    pub fn new(
        capacity: usize,
        placeholders: Arc<PlaceholderManager>,
        host: Arc<dyn IPlaceholderHost>,
        remote: Arc<dyn IRemoteStore>,
    ) -> (Self, MutationQueueHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                rx,
                placeholders,
                host,
                remote,
            },
            MutationQueueHandle { tx },
        )
    }

    /// Processes paths until every handle has been dropped
    pub async fn run(mut self) {
        info!(root = %self.placeholders.mount_dir().display(), "Mutation queue started");

        let mut processed: u64 = 0;
        while let Some(message) = self.rx.recv().await {
            match message {
                MutationMessage::Changed(path) => {
                    if AssertUnwindSafe(self.process(&path))
                        .catch_unwind()
                        .await
                        .is_err()
                    {
                        tracing::error!(path = %path.display(), "Mutation handling panicked");
                    }
                    processed += 1;
                }
                MutationMessage::Flush(reply) => {
                    let _ = reply.send(());
                }
            }
        }

        info!(processed, "Mutation queue stopped (all handles dropped)");
    }

    /// Reconciles a single local path; errors are logged
    pub async fn process(&self, local: &Path) {
        let path = match RelativePath::from_local(self.placeholders.mount_dir(), local) {
            Ok(path) => path,
            Err(_) => {
                trace!(path = %local.display(), "Outside sync root, discarded");
                return;
            }
        };
        if path.is_root() || self.placeholders.reserved().is_reserved(&path) {
            trace!(path = %path, "Reserved or root path, discarded");
            return;
        }

        let info = match self.host.placeholder_info(&path).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                trace!(path = %path, "Vanished before processing, discarded");
                return;
            }
            Err(e) => {
                warn!(path = %path, error = %format!("{e:#}"), "Failed to read placeholder state");
                return;
            }
        };

        let result = match info.state {
            PlaceholderState::PartiallyOnDisk => self.placeholders.reconcile_partial(&path).await,
            PlaceholderState::NoState | PlaceholderState::Placeholder | PlaceholderState::InSync => {
                let _guard = self.placeholders.locks().acquire(&path).await;
                self.sync_locked(&path).await
            }
        };

        if let Err(e) = result {
            warn!(path = %path, error = %format!("{e:#}"), "Failed to reconcile local change");
        }
    }

    async fn sync_locked(&self, path: &RelativePath) -> Result<()> {
        // Re-read under the lock: the entry may have changed while queued.
        let Some(info) = self.host.placeholder_info(path).await? else {
            return Ok(());
        };

        if info.is_directory {
            return if self.exists_remotely(path).await? {
                self.placeholders.update_directory_locked(path).await
            } else {
                self.push_directory(path).await
            };
        }

        if info.state == PlaceholderState::PartiallyOnDisk {
            return self.placeholders.reconcile_partial(path).await;
        }

        let edited = self.placeholders.has_local_edits(path, &info).await?;
        match self.placeholders.fetch_metadata(path).await? {
            None if info.offline && !edited => {
                debug!(path = %path, "Remote counterpart gone and no local content, skipping");
                Ok(())
            }
            None => self.push_file(path, &info).await,
            Some(entry) if entry.is_directory => {
                bail!("{path} is a file locally but a directory remotely")
            }
            Some(_) if edited => self.push_file(path, &info).await,
            Some(_) => self.placeholders.update_file_locked(path, false).await,
        }
    }

    async fn exists_remotely(&self, path: &RelativePath) -> Result<bool> {
        let remote = &self.remote;
        with_retry(self.placeholders.retry_policy(), "exists", move || {
            remote.exists(path)
        })
        .await
    }

    /// Uploads a local file and records the resulting remote identity
    async fn push_file(&self, path: &RelativePath, info: &LocalPlaceholderInfo) -> Result<()> {
        let local = path.to_local(self.placeholders.mount_dir());
        let remote = &self.remote;
        let source = local.as_path();

        with_retry(self.placeholders.retry_policy(), "upload_file", move || {
            remote.upload_file(path, source)
        })
        .await
        .with_context(|| format!("Failed to upload {path}"))?;

        let Some(entry) = self.placeholders.fetch_metadata(path).await? else {
            bail!("{path} missing remotely right after upload");
        };

        // The uploaded bytes are on disk now, even in a stub that was offline.
        if !info.is_placeholder || info.offline {
            self.host.convert_to_placeholder(path).await?;
        }
        self.host.update_placeholder(path, &entry, false).await?;
        self.host.set_in_sync(path).await?;

        info!(path = %path, bytes = entry.length, "Uploaded local file");
        Ok(())
    }

    /// Creates a local-only directory remotely and uploads everything below it
    async fn push_directory(&self, path: &RelativePath) -> Result<()> {
        self.create_remote_directory(path).await?;

        let mut pending = VecDeque::from([path.clone()]);
        let mut uploaded = 0u32;
        while let Some(dir) = pending.pop_front() {
            let mut children = match tokio::fs::read_dir(dir.to_local(self.placeholders.mount_dir())).await {
                Ok(children) => children,
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
                if self.placeholders.reserved().is_reserved(&child_path) {
                    continue;
                }

                let is_dir = child.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                let result = if is_dir {
                    let created = self.create_remote_directory(&child_path).await;
                    if created.is_ok() {
                        pending.push_back(child_path.clone());
                    }
                    created
                } else {
                    match self.host.placeholder_info(&child_path).await? {
                        Some(info) => {
                            let pushed = self.push_file(&child_path, &info).await;
                            if pushed.is_ok() {
                                uploaded += 1;
                            }
                            pushed
                        }
                        None => Ok(()),
                    }
                };
                if let Err(e) = result {
                    warn!(path = %child_path, error = %format!("{e:#}"), "Failed to upload entry");
                }
            }
        }

        info!(path = %path, files = uploaded, "Uploaded local directory");
        Ok(())
    }

    async fn create_remote_directory(&self, path: &RelativePath) -> Result<()> {
        let remote = &self.remote;
        with_retry(self.placeholders.retry_policy(), "create_directory", move || {
            remote.create_directory(path)
        })
        .await
        .with_context(|| format!("Failed to create remote directory {path}"))?;

        if let Some(info) = self.host.placeholder_info(path).await? {
            if !info.is_placeholder {
                self.host.convert_to_placeholder(path).await?;
            }
        }
        self.host.set_in_sync(path).await
    }
}
