//! Remote change watcher
//!
//! Periodically reconciles the local projection against the remote store:
//! entries deleted remotely are removed locally, then every populated
//! directory is walked breadth-first and its entries created or refreshed.
//! Directories the host has not expanded yet are left alone, except the root
//! which is always kept current.
//!
//! The walk also carries out pin requests. A pin set on an entry (for
//! `XattrPlaceholderHost`, `setfattr -n user.tetherdrive.pin -v pinned`)
//! applies to everything below it that stays `Inherit`:
//!
//! - an offline file under a pin is hydrated
//! - an unexpanded directory under a pin is expanded and walked
//!
//! Files whose local content diverged from the last sync are handed to the
//! mutation queue instead of being refreshed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tetherdrive_core::domain::{LocalPlaceholderInfo, PinState, RelativePath, RemoteEntry};
use tetherdrive_core::ports::{IHostCallbacks, IPlaceholderHost};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::ConnectorCallbacks;
use crate::mutation_queue::MutationQueueHandle;
use crate::placeholders::PlaceholderManager;
use crate::SyncError;

/// Outcome of one [`RemoteWatcher::poll_once`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub directories: u32,
    pub entries: u32,
    /// Pinned directories expanded during the pass
    pub expanded: u32,
    /// Pinned files hydrated during the pass
    pub hydrated: u32,
    /// Locally edited files handed to the mutation queue
    pub queued_uploads: u32,
    pub failed: u32,
}

pub struct RemoteWatcher {
    callbacks: Arc<ConnectorCallbacks>,
    placeholders: Arc<PlaceholderManager>,
    host: Arc<dyn IPlaceholderHost>,
    mutations: Option<MutationQueueHandle>,
    interval: Duration,
}

impl RemoteWatcher {
    pub fn new(
        callbacks: Arc<ConnectorCallbacks>,
        placeholders: Arc<PlaceholderManager>,
        host: Arc<dyn IPlaceholderHost>,
        interval: Duration,
    ) -> Self {
        Self {
            callbacks,
            placeholders,
            host,
            mutations: None,
            interval,
        }
    }

    /// Queues locally edited files for upload when a poll comes across them
    pub fn with_mutations(mut self, mutations: MutationQueueHandle) -> Self {
        self.mutations = Some(mutations);
        self
    }

    /// Polls every `interval` until cancelled
    ///
    /// The first pass runs one interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Remote watcher started");

        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    match self.poll_once(&cancel).await {
                        Ok(summary) => debug!(
                            directories = summary.directories,
                            entries = summary.entries,
                            expanded = summary.expanded,
                            hydrated = summary.hydrated,
                            queued_uploads = summary.queued_uploads,
                            failed = summary.failed,
                            "Remote poll finished"
                        ),
                        Err(e) => warn!(error = %format!("{e:#}"), "Remote poll aborted"),
                    }
                }
            }
        }

        info!("Remote watcher stopped");
    }

    /// One reconciliation pass over the populated part of the tree
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<PollSummary> {
        let root = RelativePath::root();
        self.callbacks.update_placeholders(&root).await?;

        let mut summary = PollSummary::default();
        // (directory, whether content below it is pinned)
        let mut pending = VecDeque::from([(root, false)]);

        while let Some((dir, pinned)) = pending.pop_front() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled.into());
            }
            summary.directories += 1;

            let files = match self.placeholders.list_files(&dir).await {
                Ok(files) => files,
                Err(e) => {
                    warn!(dir = %dir, error = %format!("{e:#}"), "Remote poll could not list files");
                    summary.failed += 1;
                    continue;
                }
            };
            let directories = match self.placeholders.list_directories(&dir).await {
                Ok(dirs) => dirs,
                Err(e) => {
                    warn!(dir = %dir, error = %format!("{e:#}"), "Remote poll could not list directories");
                    summary.failed += 1;
                    continue;
                }
            };

            for entry in files.iter().chain(directories.iter()) {
                let path = &entry.relative_path;
                if self.placeholders.reserved().is_reserved(path) {
                    continue;
                }
                if let Err(e) = self.placeholders.create_or_update_entry(entry).await {
                    warn!(path = %path, error = %format!("{e:#}"), "Remote poll could not refresh entry");
                    summary.failed += 1;
                    continue;
                }
                summary.entries += 1;

                let info = match self.host.placeholder_info(path).await {
                    Ok(Some(info)) => info,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(path = %path, error = %format!("{e:#}"), "Could not read entry state");
                        continue;
                    }
                };
                let keep_local = match info.pin {
                    PinState::Pinned => true,
                    PinState::Unpinned => false,
                    PinState::Inherit => pinned,
                };

                if entry.is_directory {
                    if self.visit_directory(entry, &info, keep_local, &mut summary).await {
                        pending.push_back((path.clone(), keep_local));
                    }
                } else {
                    self.visit_file(path, &info, keep_local, &mut summary).await;
                }
            }
        }

        Ok(summary)
    }

    /// Expands a pinned directory if needed; returns whether to descend
    async fn visit_directory(
        &self,
        entry: &RemoteEntry,
        info: &LocalPlaceholderInfo,
        keep_local: bool,
        summary: &mut PollSummary,
    ) -> bool {
        let path = &entry.relative_path;
        if !info.offline {
            return true;
        }
        if !keep_local {
            return false;
        }

        self.callbacks.fetch_placeholders(path, None).await;
        match self.host.placeholder_info(path).await {
            Ok(Some(info)) if !info.offline => {
                info!(path = %path, "Expanded pinned directory");
                summary.expanded += 1;
                true
            }
            Ok(_) => {
                summary.failed += 1;
                false
            }
            Err(e) => {
                warn!(path = %path, error = %format!("{e:#}"), "Could not read directory state");
                summary.failed += 1;
                false
            }
        }
    }

    async fn visit_file(
        &self,
        path: &RelativePath,
        info: &LocalPlaceholderInfo,
        keep_local: bool,
        summary: &mut PollSummary,
    ) {
        match self.placeholders.has_local_edits(path, info).await {
            Ok(true) => {
                if let Some(mutations) = &self.mutations {
                    match mutations.push(path.to_local(self.placeholders.mount_dir())).await {
                        Ok(()) => summary.queued_uploads += 1,
                        Err(e) => warn!(path = %path, error = %e, "Failed to queue edited file"),
                    }
                }
                return;
            }
            Ok(false) => {}
            Err(e) => {
                debug!(path = %path, error = %format!("{e:#}"), "Could not compare local content");
                return;
            }
        }

        if info.offline && keep_local {
            match self.placeholders.hydrate_file(path).await {
                Ok(true) => summary.hydrated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(path = %path, error = %format!("{e:#}"), "Failed to hydrate pinned file");
                    summary.failed += 1;
                }
            }
        }
    }
}
