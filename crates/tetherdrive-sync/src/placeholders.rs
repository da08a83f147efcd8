//! Placeholder lifecycle
//!
//! The [`PlaceholderManager`] drives the per-entry state machine of a sync
//! root: creation of placeholders from remote metadata, identity-based change
//! detection, dehydration and rehydration of changed files, local renames and
//! removals mirroring remote ones.
//!
//! ## Locking
//!
//! Every public operation acquires the path lock of the entry it touches
//! (both entries for renames). The `*_locked` variants are for callers that
//! already hold the lock. [`PlaceholderManager::reconcile_partial`] takes no
//! lock and never changes content.
//!
//! ## Change detection
//!
//! The remote identity hash (`length:mtime`) is compared with the identity
//! the host recorded when the placeholder was last synced. Entries the host
//! has no identity for fall back to the local length and modification time.
//!
//! The host keeps the local modification time equal to the recorded one, so
//! a local `length:mtime` that differs from the recorded identity means the
//! user wrote to the file. Such a file is local content waiting for upload:
//! remote refreshes leave it alone and never mark it in sync.
//!
//! ## Pending local deletions
//!
//! Between a local deletion and the moment its completion has run, the path
//! is registered with [`PlaceholderManager::begin_local_delete`]. Placeholder
//! creation below a registered path is skipped so a remote poll cannot bring
//! the entry back.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fs2::FileExt;
use tetherdrive_core::config::SyncConfig;
use tetherdrive_core::domain::{
    IdentityHash, LocalPlaceholderInfo, PinState, PlaceholderState, RelativePath, RemoteEntry,
};
use tetherdrive_core::ports::{IPlaceholderHost, IRemoteStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::filter::ReservedNames;
use crate::path_lock::PathLockManager;
use crate::retry::{with_retry, RetryPolicy};
use crate::SyncError;

// ============================================================================
// Options
// ============================================================================

/// Tuning of the placeholder manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderOptions {
    /// How many times an exclusive open of a hydrated file is attempted
    pub oplock_retry_attempts: u32,
    /// Pause between exclusive-open attempts
    pub oplock_retry_interval: Duration,
    /// Backoff for remote-store calls
    pub retry: RetryPolicy,
}

impl PlaceholderOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            oplock_retry_attempts: config.oplock_retry_attempts.max(1),
            oplock_retry_interval: config.oplock_retry_interval(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for PlaceholderOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Outcome of [`PlaceholderManager::create_bulk`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub files: u32,
    pub directories: u32,
    pub failed: u32,
}

// ============================================================================
// PlaceholderManager
// ============================================================================

/// Per-entry state machine of one sync root
pub struct PlaceholderManager {
    mount_dir: PathBuf,
    host: Arc<dyn IPlaceholderHost>,
    remote: Arc<dyn IRemoteStore>,
    locks: PathLockManager,
    reserved: ReservedNames,
    options: PlaceholderOptions,
    /// Paths deleted locally whose delete completion has not finished yet
    pending_deletes: DashMap<RelativePath, u32>,
}

impl PlaceholderManager {
    pub fn new(
        mount_dir: impl Into<PathBuf>,
        host: Arc<dyn IPlaceholderHost>,
        remote: Arc<dyn IRemoteStore>,
        locks: PathLockManager,
        reserved: ReservedNames,
        options: PlaceholderOptions,
    ) -> Self {
        Self {
            mount_dir: mount_dir.into(),
            host,
            remote,
            locks,
            reserved,
            options,
            pending_deletes: DashMap::new(),
        }
    }

    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    pub fn locks(&self) -> &PathLockManager {
        &self.locks
    }

    pub fn reserved(&self) -> &ReservedNames {
        &self.reserved
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.options.retry
    }

    // ------------------------------------------------------------------
    // Bulk population
    // ------------------------------------------------------------------

    /// Materializes the remote tree below `subpath` as placeholders
    ///
    /// Directories are processed breadth-first: files of a directory first,
    /// then its subdirectories, each created individually so that a failing
    /// entry does not block its siblings. A directory is queued for descent
    /// only once its own placeholder exists.
    ///
    /// `cancel` is checked before every directory and every entry.
    ///
    /// # Errors
    /// Returns `SyncError::Cancelled` when `cancel` fires, or the listing
    /// error when `subpath` itself cannot be listed
    #[tracing::instrument(skip(self, subpath, cancel), fields(subpath = %subpath))]
    pub async fn create_bulk(
        &self,
        subpath: &RelativePath,
        cancel: &CancellationToken,
    ) -> Result<BulkSummary> {
        let mut summary = BulkSummary::default();
        let mut pending = VecDeque::from([subpath.clone()]);

        while let Some(dir) = pending.pop_front() {
            if cancel.is_cancelled() {
                info!(files = summary.files, directories = summary.directories, "Bulk placeholder creation cancelled");
                return Err(SyncError::Cancelled.into());
            }

            let files = match self.list_files(&dir).await {
                Ok(files) => files,
                Err(e) if &dir == subpath => return Err(e),
                Err(e) => {
                    warn!(dir = %dir, error = %format!("{e:#}"), "Failed to list remote files");
                    summary.failed += 1;
                    continue;
                }
            };
            for entry in files
                .iter()
                .filter(|e| !self.reserved.is_reserved(&e.relative_path))
            {
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled.into());
                }
                match self.create_or_update_entry(entry).await {
                    Ok(()) => summary.files += 1,
                    Err(e) => {
                        warn!(path = %entry.relative_path, error = %format!("{e:#}"), "Failed to create file placeholder");
                        summary.failed += 1;
                    }
                }
            }

            let directories = match self.list_directories(&dir).await {
                Ok(dirs) => dirs,
                Err(e) if &dir == subpath => return Err(e),
                Err(e) => {
                    warn!(dir = %dir, error = %format!("{e:#}"), "Failed to list remote directories");
                    summary.failed += 1;
                    continue;
                }
            };
            for entry in directories
                .iter()
                .filter(|e| !self.reserved.is_reserved(&e.relative_path))
            {
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled.into());
                }
                match self.create_or_update_entry(entry).await {
                    Ok(()) => {
                        summary.directories += 1;
                        pending.push_back(entry.relative_path.clone());
                    }
                    Err(e) => {
                        warn!(path = %entry.relative_path, error = %format!("{e:#}"), "Failed to create directory placeholder");
                        summary.failed += 1;
                    }
                }
            }

            // Empty batch: marks `dir` populated even when it has no children.
            if let Err(e) = self.host.create_placeholders(&dir, &[]).await {
                debug!(dir = %dir, error = %format!("{e:#}"), "Could not mark directory populated");
            }
        }

        info!(
            files = summary.files,
            directories = summary.directories,
            failed = summary.failed,
            "Bulk placeholder creation finished"
        );
        Ok(summary)
    }

    /// Creates or refreshes the placeholder for an already-fetched remote entry
    pub async fn create_or_update_entry(&self, entry: &RemoteEntry) -> Result<()> {
        let path = &entry.relative_path;
        let _guard = self.locks.acquire(path).await;

        match self.host.placeholder_info(path).await? {
            None => self.create_from_entry(entry).await,
            Some(info) if info.is_directory != entry.is_directory => bail!(
                "{path} is a {} locally but a {} remotely",
                kind(info.is_directory),
                kind(entry.is_directory)
            ),
            Some(info) if info.is_directory => self.update_directory_with(path, info).await,
            Some(info) => self.update_file_with(path, info, entry, false).await,
        }
    }

    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Creates the placeholder of `path` if absent, refreshes it otherwise
    #[tracing::instrument(skip(self, path), fields(path = %path))]
    pub async fn create_or_update_file(&self, path: &RelativePath) -> Result<()> {
        let _guard = self.locks.acquire(path).await;
        if self.exists_locally(path).await {
            self.update_file_locked(path, false).await
        } else {
            self.create_file_locked(path).await
        }
    }

    /// Directory counterpart of [`create_or_update_file`](Self::create_or_update_file)
    #[tracing::instrument(skip(self, path), fields(path = %path))]
    pub async fn create_or_update_directory(&self, path: &RelativePath) -> Result<()> {
        let _guard = self.locks.acquire(path).await;
        if self.exists_locally(path).await {
            self.update_directory_locked(path).await
        } else {
            self.create_directory_locked(path).await
        }
    }

    /// Creates a file placeholder from the remote metadata of `path`
    pub async fn create_file(&self, path: &RelativePath) -> Result<()> {
        let _guard = self.locks.acquire(path).await;
        self.create_file_locked(path).await
    }

    pub(crate) async fn create_file_locked(&self, path: &RelativePath) -> Result<()> {
        if self.exists_locally(path).await {
            return self.update_file_locked(path, false).await;
        }

        let Some(entry) = self.fetch_metadata(path).await? else {
            debug!(path = %path, "Remote file vanished before placeholder creation");
            return Ok(());
        };
        if entry.is_directory {
            bail!("{path} is a directory remotely");
        }
        self.create_from_entry(&entry).await
    }

    /// Creates a directory placeholder, or refreshes it if one is already there
    pub async fn create_directory(&self, path: &RelativePath) -> Result<()> {
        let _guard = self.locks.acquire(path).await;
        self.create_directory_locked(path).await
    }

    pub(crate) async fn create_directory_locked(&self, path: &RelativePath) -> Result<()> {
        if let Some(info) = self.host.placeholder_info(path).await? {
            return self.update_directory_with(path, info).await;
        }

        let Some(entry) = self.fetch_metadata(path).await? else {
            debug!(path = %path, "Remote directory vanished before placeholder creation");
            return Ok(());
        };
        if !entry.is_directory {
            bail!("{path} is a file remotely");
        }
        self.create_from_entry(&entry).await
    }

    /// Refreshes a file placeholder from the remote store
    ///
    /// No-op when the file is absent locally. With `force` the content is
    /// cycled even when the identities match.
    #[tracing::instrument(skip(self, path), fields(path = %path))]
    pub async fn update_file(&self, path: &RelativePath, force: bool) -> Result<()> {
        let _guard = self.locks.acquire(path).await;
        self.update_file_locked(path, force).await
    }

    pub(crate) async fn update_file_locked(&self, path: &RelativePath, force: bool) -> Result<()> {
        let Some(info) = self.host.placeholder_info(path).await? else {
            trace!(path = %path, "Absent locally, nothing to update");
            return Ok(());
        };
        if info.is_directory {
            return self.update_directory_with(path, info).await;
        }

        let Some(entry) = self.fetch_metadata(path).await? else {
            debug!(path = %path, "No remote counterpart, leaving local file untouched");
            return Ok(());
        };
        if entry.is_directory {
            bail!("{path} is a file locally but a directory remotely");
        }
        self.update_file_with(path, info, &entry, force).await
    }

    async fn update_file_with(
        &self,
        path: &RelativePath,
        info: LocalPlaceholderInfo,
        entry: &RemoteEntry,
        force: bool,
    ) -> Result<()> {
        let local = path.to_local(&self.mount_dir);
        let hydrated = info.is_hydrated();

        if self.has_local_edits(path, &info).await? {
            debug!(path = %path, "Local content changed since last sync, leaving it for upload");
            return Ok(());
        }

        clear_readonly(&local).await?;
        let handle = if hydrated {
            self.open_exclusive(&local).await?
        } else {
            open_direct(&local).await?
        };

        if !info.is_placeholder {
            self.host
                .convert_to_placeholder(path)
                .await
                .with_context(|| format!("Failed to convert {path} to a placeholder"))?;
        }

        let current = match info.identity {
            Some(identity) => identity,
            None => local_identity(&local).await?,
        };
        let remote = entry.identity();

        if current == remote && !force {
            drop(handle);
            self.host.set_in_sync(path).await?;
            trace!(path = %path, identity = %remote, "Unchanged, marked in sync");
            return Ok(());
        }

        debug!(
            path = %path,
            old = %current,
            new = %remote,
            hydrated,
            pin = %info.pin,
            "Remote entry changed, updating placeholder"
        );

        let pin = info.pin;
        if pin != PinState::Inherit {
            self.host.set_pin_state(path, PinState::Inherit).await?;
        }

        let result = self.apply_change(path, entry, hydrated, pin, handle).await;

        if pin != PinState::Inherit {
            if let Err(e) = self.host.set_pin_state(path, pin).await {
                if result.is_ok() {
                    return Err(e.context(format!("Failed to restore pin state of {path}")));
                }
                warn!(path = %path, error = %format!("{e:#}"), "Failed to restore pin state");
            }
        }
        result
    }

    async fn apply_change(
        &self,
        path: &RelativePath,
        entry: &RemoteEntry,
        hydrated: bool,
        pin: PinState,
        handle: std::fs::File,
    ) -> Result<()> {
        // A hydrated file is always dropped to a placeholder before new content arrives.
        self.host
            .update_placeholder(path, entry, hydrated)
            .await
            .with_context(|| format!("Failed to update placeholder {path}"))?;
        drop(handle);

        if hydrated && pin != PinState::Unpinned {
            self.host
                .hydrate(path)
                .await
                .with_context(|| format!("Failed to rehydrate {path}"))?;
        }

        self.host.set_in_sync(path).await
    }

    /// Refreshes a directory placeholder
    ///
    /// No-op when absent or not yet populated.
    pub async fn update_directory(&self, path: &RelativePath) -> Result<()> {
        let _guard = self.locks.acquire(path).await;
        self.update_directory_locked(path).await
    }

    pub(crate) async fn update_directory_locked(&self, path: &RelativePath) -> Result<()> {
        match self.host.placeholder_info(path).await? {
            Some(info) => self.update_directory_with(path, info).await,
            None => Ok(()),
        }
    }

    async fn update_directory_with(
        &self,
        path: &RelativePath,
        info: LocalPlaceholderInfo,
    ) -> Result<()> {
        if !info.is_directory {
            bail!("{path} is a file locally but a directory remotely");
        }
        if info.offline {
            trace!(path = %path, "Directory not populated, skipping");
            return Ok(());
        }
        if !info.is_placeholder {
            self.host
                .convert_to_placeholder(path)
                .await
                .with_context(|| format!("Failed to convert directory {path}"))?;
        }
        self.host.set_in_sync(path).await
    }

    /// Non-destructive refresh of a partially hydrated file
    ///
    /// Marks the entry in sync only when the recorded identity already matches
    /// the remote one. Takes no path lock and never dehydrates.
    pub async fn reconcile_partial(&self, path: &RelativePath) -> Result<()> {
        let Some(info) = self.host.placeholder_info(path).await? else {
            return Ok(());
        };
        if info.state != PlaceholderState::PartiallyOnDisk {
            return Ok(());
        }
        let Some(entry) = self.fetch_metadata(path).await? else {
            return Ok(());
        };
        if info.identity == Some(entry.identity()) {
            self.host.set_in_sync(path).await?;
            trace!(path = %path, "Partial file matches remote, marked in sync");
        }
        Ok(())
    }

    /// Fetches the content of an offline file placeholder
    ///
    /// Returns `false` without touching the entry when it is absent, a
    /// directory, already hydrated, or carries local edits.
    #[tracing::instrument(skip(self, path), fields(path = %path))]
    pub async fn hydrate_file(&self, path: &RelativePath) -> Result<bool> {
        let _guard = self.locks.acquire(path).await;

        let Some(info) = self.host.placeholder_info(path).await? else {
            return Ok(false);
        };
        if info.is_directory || !info.is_placeholder || !info.offline {
            return Ok(false);
        }
        if self.has_local_edits(path, &info).await? {
            debug!(path = %path, "Offline file was written locally, not hydrating");
            return Ok(false);
        }

        self.host
            .hydrate(path)
            .await
            .with_context(|| format!("Failed to hydrate {path}"))?;
        self.host.set_in_sync(path).await?;
        info!(path = %path, "Hydrated pinned file");
        Ok(true)
    }

    /// Whether the local file differs from the content last synced
    ///
    /// Compares the local `length:mtime` with the recorded identity, whether
    /// or not the file is offline. Directories, entries without a recorded
    /// identity and partially hydrated files never count as edited.
    pub async fn has_local_edits(
        &self,
        path: &RelativePath,
        info: &LocalPlaceholderInfo,
    ) -> Result<bool> {
        if info.is_directory || info.state == PlaceholderState::PartiallyOnDisk {
            return Ok(false);
        }
        let Some(recorded) = info.identity else {
            return Ok(false);
        };
        let current = local_identity(&path.to_local(&self.mount_dir)).await?;
        if current != recorded {
            trace!(path = %path, recorded = %recorded, current = %current, "Local content diverged");
        }
        Ok(current != recorded)
    }

    // ------------------------------------------------------------------
    // Rename
    // ------------------------------------------------------------------

    /// Mirrors a rename of a file
    ///
    /// When `old` is already gone locally, `new` is created or refreshed.
    #[tracing::instrument(skip(self, old, new), fields(old = %old, new = %new))]
    pub async fn rename_file(&self, old: &RelativePath, new: &RelativePath) -> Result<()> {
        let _guards = self.locks.acquire_pair(old, new).await;

        if !self.exists_locally(old).await {
            return if self.exists_locally(new).await {
                self.update_file_locked(new, false).await
            } else {
                self.create_file_locked(new).await
            };
        }

        self.rename_local(old, new).await?;
        self.host.set_in_sync(new).await
    }

    /// Directory counterpart of [`rename_file`](Self::rename_file)
    #[tracing::instrument(skip(self, old, new), fields(old = %old, new = %new))]
    pub async fn rename_directory(&self, old: &RelativePath, new: &RelativePath) -> Result<()> {
        let _guards = self.locks.acquire_pair(old, new).await;

        if !self.exists_locally(old).await {
            return if self.exists_locally(new).await {
                self.update_directory_locked(new).await
            } else {
                self.create_directory_locked(new).await
            };
        }

        self.rename_local(old, new).await?;
        self.host.set_in_sync(new).await
    }

    async fn rename_local(&self, old: &RelativePath, new: &RelativePath) -> Result<()> {
        let from = old.to_local(&self.mount_dir);
        let to = new.to_local(&self.mount_dir);
        tokio::fs::rename(&from, &to)
            .await
            .with_context(|| format!("Failed to rename {old} to {new}"))?;
        debug!(old = %old, new = %new, "Renamed local entry");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Removes a local entry (recursively for directories)
    #[tracing::instrument(skip(self, path), fields(path = %path))]
    pub async fn delete(&self, path: &RelativePath) -> Result<()> {
        let _guard = self.locks.acquire(path).await;
        let local = path.to_local(&self.mount_dir);

        let result = match tokio::fs::symlink_metadata(&local).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&local).await,
            Ok(_) => tokio::fs::remove_file(&local).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!(path = %path, "Deleted local entry");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {path}")),
        }
    }

    /// Removes a local directory tree entry by entry
    ///
    /// Entries that fail to be removed are logged and skipped; the call fails
    /// at the end if anything was left behind.
    #[tracing::instrument(skip(self, path), fields(path = %path))]
    pub async fn delete_bulk(&self, path: &RelativePath) -> Result<()> {
        let _guard = self.locks.acquire(path).await;
        let local = path.to_local(&self.mount_dir);

        let meta = match tokio::fs::symlink_metadata(&local).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("Failed to stat {path}")),
        };
        if !meta.is_dir() {
            return remove_ignoring_missing(&local, false)
                .await
                .with_context(|| format!("Failed to delete {path}"));
        }

        let mut failed = 0u32;
        // (directory, children already queued)
        let mut stack = vec![(local, false)];
        while let Some((dir, expanded)) = stack.pop() {
            if expanded {
                if let Err(e) = remove_ignoring_missing(&dir, true).await {
                    warn!(dir = %dir.display(), error = %e, "Failed to remove directory");
                    failed += 1;
                }
                continue;
            }

            stack.push((dir.clone(), true));
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Failed to read directory");
                    failed += 1;
                    continue;
                }
            };
            while let Some(child) = entries.next_entry().await? {
                let child_path = child.path();
                let is_dir = child.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if is_dir {
                    stack.push((child_path, false));
                } else if let Err(e) = remove_ignoring_missing(&child_path, false).await {
                    warn!(path = %child_path.display(), error = %e, "Failed to remove file");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            bail!("{failed} entries below {path} could not be removed");
        }
        debug!(path = %path, "Deleted local directory tree");
        Ok(())
    }

    /// Registers a local deletion of `path` that has not been propagated yet
    ///
    /// Each call must be paired with [`end_local_delete`](Self::end_local_delete).
    pub fn begin_local_delete(&self, path: &RelativePath) {
        *self.pending_deletes.entry(path.clone()).or_insert(0) += 1;
        trace!(path = %path, "Local deletion pending");
    }

    pub fn end_local_delete(&self, path: &RelativePath) {
        self.pending_deletes
            .remove_if_mut(path, |_, count| {
                *count -= 1;
                *count == 0
            });
    }

    /// Whether `path` or one of its ancestors has a pending local deletion
    pub fn is_pending_delete(&self, path: &RelativePath) -> bool {
        if self.pending_deletes.is_empty() {
            return false;
        }
        let mut current = Some(path.clone());
        while let Some(p) = current {
            if self.pending_deletes.contains_key(&p) {
                return true;
            }
            current = p.parent();
        }
        false
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn create_from_entry(&self, entry: &RemoteEntry) -> Result<()> {
        let path = &entry.relative_path;
        if self.is_pending_delete(path) {
            debug!(path = %path, "Deleted locally, not recreating placeholder");
            return Ok(());
        }
        let parent = path.parent().unwrap_or_else(RelativePath::root);
        self.host
            .create_placeholders(&parent, std::slice::from_ref(entry))
            .await
            .with_context(|| format!("Failed to create placeholder {path}"))?;
        debug!(path = %path, directory = entry.is_directory, "Created placeholder");
        Ok(())
    }

    pub(crate) async fn exists_locally(&self, path: &RelativePath) -> bool {
        tokio::fs::symlink_metadata(path.to_local(&self.mount_dir))
            .await
            .is_ok()
    }

    pub(crate) async fn fetch_metadata(&self, path: &RelativePath) -> Result<Option<RemoteEntry>> {
        let remote = &self.remote;
        with_retry(&self.options.retry, "metadata", move || remote.metadata(path))
            .await
            .with_context(|| format!("Failed to fetch remote metadata of {path}"))
    }

    pub(crate) async fn list_files(&self, dir: &RelativePath) -> Result<Vec<RemoteEntry>> {
        let remote = &self.remote;
        with_retry(&self.options.retry, "list_files", move || {
            remote.list_files(dir, None)
        })
        .await
        .with_context(|| format!("Failed to list remote files of {dir}"))
    }

    pub(crate) async fn list_directories(&self, dir: &RelativePath) -> Result<Vec<RemoteEntry>> {
        let remote = &self.remote;
        with_retry(&self.options.retry, "list_directories", move || {
            remote.list_directories(dir, None)
        })
        .await
        .with_context(|| format!("Failed to list remote directories of {dir}"))
    }

    /// Opens a hydrated file once no other process holds an exclusive lock on it
    async fn open_exclusive(&self, local: &Path) -> Result<std::fs::File> {
        let attempts = self.options.oplock_retry_attempts.max(1);
        for attempt in 0..attempts {
            let path = local.to_path_buf();
            let opened = tokio::task::spawn_blocking(move || -> std::io::Result<Option<std::fs::File>> {
                let file = std::fs::File::open(&path)?;
                match file.try_lock_exclusive() {
                    Ok(()) => Ok(Some(file)),
                    Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
            .await
            .context("Exclusive open task failed")??;

            if let Some(file) = opened {
                return Ok(file);
            }
            trace!(path = %local.display(), attempt, "File in use, waiting");
            tokio::time::sleep(self.options.oplock_retry_interval).await;
        }
        Err(SyncError::FileLocked(local.to_path_buf()).into())
    }
}

fn kind(is_directory: bool) -> &'static str {
    if is_directory {
        "directory"
    } else {
        "file"
    }
}

async fn open_direct(local: &Path) -> Result<std::fs::File> {
    let file = tokio::fs::File::open(local)
        .await
        .with_context(|| format!("Failed to open {}", local.display()))?;
    Ok(file.into_std().await)
}

async fn remove_ignoring_missing(path: &Path, is_dir: bool) -> std::io::Result<()> {
    let result = if is_dir {
        tokio::fs::remove_dir(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Identity of the local file content: length plus modification time
pub(crate) async fn local_identity(local: &Path) -> Result<IdentityHash> {
    let meta = tokio::fs::metadata(local)
        .await
        .with_context(|| format!("Failed to stat {}", local.display()))?;
    let modified: DateTime<Utc> = meta.modified()?.into();
    Ok(IdentityHash::new(meta.len(), modified))
}

async fn clear_readonly(local: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(local)
        .await
        .with_context(|| format!("Failed to stat {}", local.display()))?;
    let mut perms = meta.permissions();
    if !perms.readonly() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() | 0o200);
    }
    #[cfg(not(unix))]
    perms.set_readonly(false);

    tokio::fs::set_permissions(local, perms)
        .await
        .with_context(|| format!("Failed to clear read-only flag on {}", local.display()))?;
    trace!(path = %local.display(), "Cleared read-only flag");
    Ok(())
}
