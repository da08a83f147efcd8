//! Extended-attribute placeholder host
//!
//! [`XattrPlaceholderHost`] realises the placeholder primitives for one sync
//! root on an ordinary directory tree:
//!
//! - a placeholder file is a sparse stub of the remote length whose
//!   modification time is the remote one
//! - state, pin flag, offline flag and remote identity are kept in
//!   `user.tetherdrive.*` attributes, so they follow the entry across renames
//! - hydration asks the registered callback table for the whole file and
//!   writes the chunks into the stub
//!
//! The host never observes the namespace itself; local renames and deletions
//! reach the engine through its filesystem watcher. Nothing here intercepts
//! opens either: a user asks for content by pinning an entry
//! (`setfattr -n user.tetherdrive.pin -v pinned <path>`), and the engine's
//! remote poll expands and hydrates what is pinned.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tetherdrive_core::domain::{
    LocalPlaceholderInfo, PinState, PlaceholderState, RelativePath, RemoteEntry, SyncRoot,
};
use tetherdrive_core::ports::{
    ConnectionKey, DataRequest, IHostCallbacks, IPlaceholderHost, ITransferSink,
};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use crate::error::HostError;
use crate::xattr::{self, StoredAttrs};

struct Registration {
    key: ConnectionKey,
    callbacks: Arc<dyn IHostCallbacks>,
}

/// Placeholder host for one sync root directory
pub struct XattrPlaceholderHost {
    mount_dir: PathBuf,
    registration: Mutex<Option<Registration>>,
    next_key: AtomicU64,
}

impl XattrPlaceholderHost {
    pub fn new(mount_dir: impl Into<PathBuf>) -> Self {
        Self {
            mount_dir: mount_dir.into(),
            registration: Mutex::new(None),
            next_key: AtomicU64::new(1),
        }
    }

    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    fn local(&self, path: &RelativePath) -> PathBuf {
        path.to_local(&self.mount_dir)
    }

    fn callbacks(&self) -> Result<Arc<dyn IHostCallbacks>, HostError> {
        let registration = self
            .registration
            .lock()
            .map_err(|_| HostError::IoError("registration lock poisoned".to_string()))?;
        registration
            .as_ref()
            .map(|r| Arc::clone(&r.callbacks))
            .ok_or(HostError::NotConnected)
    }

    fn managed(&self, path: &RelativePath) -> Result<(PathBuf, StoredAttrs), HostError> {
        let local = self.local(path);
        match StoredAttrs::read(&local)? {
            Some(attrs) => Ok((local, attrs)),
            None => Err(HostError::NotPlaceholder(path.to_string())),
        }
    }

    fn create_one(&self, entry: &RemoteEntry) -> Result<bool, HostError> {
        let local = self.local(&entry.relative_path);
        if local.symlink_metadata().is_ok() {
            return Ok(false);
        }

        if entry.is_directory {
            std::fs::create_dir(&local).map_err(|e| HostError::from_io(&local, e))?;
        } else {
            let file = std::fs::File::create(&local).map_err(|e| HostError::from_io(&local, e))?;
            file.set_len(entry.length)
                .map_err(|e| HostError::from_io(&local, e))?;
            drop(file);
            set_mtime(&local, entry.last_modified)?;
        }

        StoredAttrs::placeholder(true, Some(entry.identity())).write(&local)?;
        Ok(true)
    }
}

/// Sets the modification time of `local`, keeping the access time
fn set_mtime(local: &Path, modified: DateTime<Utc>) -> Result<(), HostError> {
    let file = std::fs::File::open(local).map_err(|e| HostError::from_io(local, e))?;
    file.set_modified(SystemTime::from(modified))
        .map_err(|e| HostError::from_io(local, e))
}

/// Drops the content of a file while keeping its length
fn punch_content(local: &Path, length: u64) -> Result<(), HostError> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(local)
        .map_err(|e| HostError::from_io(local, e))?;
    file.set_len(0).map_err(|e| HostError::from_io(local, e))?;
    file.set_len(length).map_err(|e| HostError::from_io(local, e))
}

// ============================================================================
// StubSink
// ============================================================================

/// Writes hydration chunks into the stub file
struct StubSink {
    local: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    failed: Mutex<Vec<(u64, u64)>>,
    written: AtomicU64,
}

impl StubSink {
    fn failed_ranges(&self) -> Vec<(u64, u64)> {
        self.failed.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ITransferSink for StubSink {
    async fn report_progress(&self, total: u64, completed: u64) -> Result<()> {
        trace!(path = %self.local.display(), total, completed, "Hydration progress");
        Ok(())
    }

    async fn write_chunk(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        self.written.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn fail_range(&self, offset: u64, length: u64) -> Result<()> {
        if let Ok(mut failed) = self.failed.lock() {
            failed.push((offset, length));
        }
        Ok(())
    }
}

// ============================================================================
// IPlaceholderHost
// ============================================================================

#[async_trait::async_trait]
impl IPlaceholderHost for XattrPlaceholderHost {
    async fn connect(
        &self,
        root: &SyncRoot,
        callbacks: Arc<dyn IHostCallbacks>,
    ) -> Result<ConnectionKey> {
        if !self.mount_dir.is_dir() {
            return Err(HostError::NotFound(self.mount_dir.display().to_string()).into());
        }
        if !xattr::is_supported(&self.mount_dir) {
            return Err(HostError::XattrUnsupported(self.mount_dir.display().to_string()).into());
        }

        let mut registration = self
            .registration
            .lock()
            .map_err(|_| HostError::IoError("registration lock poisoned".to_string()))?;
        if registration.is_some() {
            return Err(HostError::AlreadyConnected(root.id.to_string()).into());
        }

        let key = ConnectionKey::new(self.next_key.fetch_add(1, Ordering::Relaxed));
        *registration = Some(Registration { key, callbacks });
        info!(root = %root.id, key = %key, mount_dir = %self.mount_dir.display(), "Sync root registered");
        Ok(key)
    }

    async fn disconnect(&self, key: ConnectionKey) -> Result<()> {
        let mut registration = self
            .registration
            .lock()
            .map_err(|_| HostError::IoError("registration lock poisoned".to_string()))?;
        match registration.as_ref() {
            Some(r) if r.key == key => {
                *registration = None;
                info!(key = %key, "Sync root unregistered");
                Ok(())
            }
            _ => Err(HostError::NotConnected.into()),
        }
    }

    async fn create_placeholders(
        &self,
        parent: &RelativePath,
        entries: &[RemoteEntry],
    ) -> Result<()> {
        let mut created = 0u32;
        let mut failed = 0u32;
        for entry in entries {
            match self.create_one(entry) {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(path = %entry.relative_path, error = %e, "Failed to create placeholder");
                    failed += 1;
                }
            }
        }

        let parent_local = self.local(parent);
        if let Some(mut attrs) = StoredAttrs::read(&parent_local)? {
            if attrs.offline {
                attrs.offline = false;
                attrs.write(&parent_local)?;
            }
        }

        debug!(parent = %parent, created, failed, "Placeholders created");
        if failed > 0 {
            anyhow::bail!("{failed} of {} placeholders in {parent} could not be created", entries.len());
        }
        Ok(())
    }

    async fn placeholder_info(&self, path: &RelativePath) -> Result<Option<LocalPlaceholderInfo>> {
        let local = self.local(path);
        let meta = match local.symlink_metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HostError::from_io(&local, e).into()),
        };
        let is_directory = meta.is_dir();

        Ok(Some(match StoredAttrs::read(&local)? {
            Some(attrs) => LocalPlaceholderInfo {
                state: attrs.state,
                pin: attrs.pin,
                offline: attrs.offline,
                is_placeholder: true,
                is_directory,
                identity: attrs.identity,
            },
            None => LocalPlaceholderInfo::unmanaged(is_directory),
        }))
    }

    async fn convert_to_placeholder(&self, path: &RelativePath) -> Result<()> {
        let local = self.local(path);
        if let Err(e) = local.symlink_metadata() {
            return Err(HostError::from_io(&local, e).into());
        }
        match StoredAttrs::read(&local)? {
            Some(mut attrs) if attrs.offline => {
                attrs.offline = false;
                attrs.write(&local)?;
                debug!(path = %path, "Local content now authoritative");
            }
            Some(_) => {}
            None => {
                StoredAttrs::placeholder(false, None).write(&local)?;
                debug!(path = %path, "Converted to placeholder");
            }
        }
        Ok(())
    }

    async fn update_placeholder(
        &self,
        path: &RelativePath,
        entry: &RemoteEntry,
        dehydrate: bool,
    ) -> Result<()> {
        let (local, mut attrs) = self.managed(path)?;

        if !entry.is_directory && (dehydrate || attrs.offline) {
            punch_content(&local, entry.length)?;
        }
        set_mtime(&local, entry.last_modified)?;

        attrs.identity = Some(entry.identity());
        attrs.state = PlaceholderState::Placeholder;
        if dehydrate {
            attrs.offline = true;
        }
        attrs.write(&local)?;
        debug!(path = %path, identity = %entry.identity(), dehydrate, "Placeholder updated");
        Ok(())
    }

    async fn hydrate(&self, path: &RelativePath) -> Result<()> {
        let (local, mut attrs) = self.managed(path)?;
        if local.is_dir() {
            return Err(HostError::IsADirectory(path.to_string()).into());
        }
        if !attrs.offline {
            trace!(path = %path, "Already hydrated");
            return Ok(());
        }
        let identity = attrs.identity.ok_or_else(|| {
            HostError::InvalidArgument(format!("{path} has no recorded remote identity"))
        })?;
        let callbacks = self.callbacks()?;

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&local)
            .await
            .map_err(|e| HostError::from_io(&local, e))?;
        let sink = StubSink {
            local: local.clone(),
            file: tokio::sync::Mutex::new(file),
            failed: Mutex::new(Vec::new()),
            written: AtomicU64::new(0),
        };

        callbacks
            .fetch_data(DataRequest::new(path.clone(), 0, identity.length()), &sink)
            .await;

        let failed = sink.failed_ranges();
        if !failed.is_empty() {
            if sink.written.load(Ordering::Relaxed) > 0 {
                attrs.state = PlaceholderState::PartiallyOnDisk;
                attrs.write(&local)?;
            }
            return Err(HostError::HydrationFailed(format!("{path}: ranges {failed:?} not delivered")).into());
        }

        let modified = DateTime::from_timestamp_millis(identity.modified_millis()).ok_or_else(|| {
            HostError::InvalidArgument(format!("{path} has an out of range modification time"))
        })?;
        set_mtime(&local, modified)?;
        attrs.offline = false;
        attrs.write(&local)?;
        debug!(path = %path, bytes = identity.length(), "Hydrated");
        Ok(())
    }

    async fn dehydrate(&self, path: &RelativePath) -> Result<()> {
        let (local, mut attrs) = self.managed(path)?;
        let meta = std::fs::metadata(&local).map_err(|e| HostError::from_io(&local, e))?;
        if meta.is_dir() {
            return Err(HostError::IsADirectory(path.to_string()).into());
        }

        let modified = meta.modified().map_err(|e| HostError::from_io(&local, e))?;
        punch_content(&local, meta.len())?;
        set_mtime(&local, DateTime::<Utc>::from(modified))?;

        attrs.offline = true;
        attrs.write(&local)?;
        debug!(path = %path, "Dehydrated");
        Ok(())
    }

    async fn set_in_sync(&self, path: &RelativePath) -> Result<()> {
        let (local, mut attrs) = self.managed(path)?;
        attrs.state = PlaceholderState::InSync;
        attrs.write(&local)?;
        Ok(())
    }

    async fn set_pin_state(&self, path: &RelativePath, pin: PinState) -> Result<()> {
        let (local, mut attrs) = self.managed(path)?;
        attrs.pin = pin;
        attrs.write(&local)?;
        Ok(())
    }

    fn raises_namespace_notifications(&self) -> bool {
        false
    }
}
