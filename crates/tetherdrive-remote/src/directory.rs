//! Directory remote store
//!
//! Serves a remote tree that is already mounted into the local VFS
//! (sshfs, gvfs, an MTP FUSE mount). Every operation maps onto plain
//! filesystem calls beneath the mount point.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use glob::Pattern;
use tetherdrive_core::domain::{RelativePath, RemoteEntry};
use tetherdrive_core::ports::{IRemoteStore, RemoteReader};
use tokio::io::AsyncSeekExt;
use tracing::{debug, trace, warn};

use crate::RemoteError;

/// Suffix of the staging file an upload is written to before the final rename
const UPLOAD_SUFFIX: &str = ".tetherdrive-upload";

/// Remote store backed by a mounted directory
#[derive(Debug, Clone)]
pub struct DirectoryRemoteStore {
    root: PathBuf,
}

impl DirectoryRemoteStore {
    /// Creates a store rooted at `root`
    ///
    /// # Errors
    /// Returns `RemoteError::InvalidConfig` if `root` is not absolute
    pub fn new(root: &Path) -> Result<Self, RemoteError> {
        if !root.is_absolute() {
            return Err(RemoteError::InvalidConfig(format!(
                "remote directory must be absolute: {}",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Mount point of the remote tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn list(
        &self,
        dir: &RelativePath,
        directories: bool,
        pattern: Option<&str>,
    ) -> Result<Vec<RemoteEntry>> {
        let pattern = pattern
            .map(Pattern::new)
            .transpose()
            .with_context(|| format!("Invalid listing pattern {pattern:?}"))?;

        let local_dir = dir.to_local(&self.root);
        let mut reader = tokio::fs::read_dir(&local_dir)
            .await
            .with_context(|| format!("Failed to list remote directory {dir}"))?;

        let mut entries = Vec::new();
        while let Some(item) = reader.next_entry().await? {
            let file_name = item.file_name();
            let Some(name) = file_name.to_str() else {
                warn!(dir = %dir, name = ?file_name, "Skipping entry with non UTF-8 name");
                continue;
            };
            if name.ends_with(UPLOAD_SUFFIX) {
                continue;
            }
            if pattern.as_ref().is_some_and(|p| !p.matches(name)) {
                continue;
            }

            // Follow symlinks so a linked directory lists as a directory.
            let metadata = match tokio::fs::metadata(item.path()).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(dir = %dir, name, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if metadata.is_dir() != directories {
                continue;
            }

            let path = dir.join(name)?;
            let modified: DateTime<Utc> = metadata.modified()?.into();
            entries.push(if directories {
                RemoteEntry::directory(path, modified)
            } else {
                RemoteEntry::file(path, metadata.len(), modified)
            });
        }

        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        trace!(dir = %dir, directories, count = entries.len(), "Listed mounted directory");
        Ok(entries)
    }
}

#[async_trait::async_trait]
impl IRemoteStore for DirectoryRemoteStore {
    async fn list_files(
        &self,
        dir: &RelativePath,
        pattern: Option<&str>,
    ) -> Result<Vec<RemoteEntry>> {
        self.list(dir, false, pattern).await
    }

    async fn list_directories(
        &self,
        dir: &RelativePath,
        pattern: Option<&str>,
    ) -> Result<Vec<RemoteEntry>> {
        self.list(dir, true, pattern).await
    }

    async fn metadata(&self, path: &RelativePath) -> Result<Option<RemoteEntry>> {
        let metadata = match tokio::fs::metadata(path.to_local(&self.root)).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to stat remote {path}")),
        };

        let modified: DateTime<Utc> = metadata.modified()?.into();
        Ok(Some(if metadata.is_dir() {
            RemoteEntry::directory(path.clone(), modified)
        } else {
            RemoteEntry::file(path.clone(), metadata.len(), modified)
        }))
    }

    async fn open_read(&self, path: &RelativePath, offset: u64) -> Result<RemoteReader> {
        let mut file = tokio::fs::File::open(path.to_local(&self.root))
            .await
            .with_context(|| format!("Failed to open remote {path}"))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }

    async fn upload_file(&self, path: &RelativePath, local: &Path) -> Result<()> {
        let target = path.to_local(&self.root);
        let name = path
            .file_name()
            .ok_or_else(|| RemoteError::InvalidConfig("cannot upload to the root".into()))?;
        let staging = target.with_file_name(format!(".{name}{UPLOAD_SUFFIX}"));

        let bytes = tokio::fs::copy(local, &staging)
            .await
            .with_context(|| format!("Failed to copy {} to remote {path}", local.display()))?;
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e).with_context(|| format!("Failed to replace remote {path}"));
        }

        debug!(path = %path, bytes, "Uploaded file");
        Ok(())
    }

    async fn create_directory(&self, path: &RelativePath) -> Result<()> {
        tokio::fs::create_dir_all(path.to_local(&self.root))
            .await
            .with_context(|| format!("Failed to create remote directory {path}"))?;
        debug!(path = %path, "Created remote directory");
        Ok(())
    }

    async fn rename(&self, from: &RelativePath, to: &RelativePath) -> Result<()> {
        tokio::fs::rename(from.to_local(&self.root), to.to_local(&self.root))
            .await
            .with_context(|| format!("Failed to move remote {from} to {to}"))?;
        debug!(from = %from, to = %to, "Moved remote entry");
        Ok(())
    }

    async fn delete_file(&self, path: &RelativePath) -> Result<()> {
        match tokio::fs::remove_file(path.to_local(&self.root)).await {
            Ok(()) => debug!(path = %path, "Deleted remote file"),
            Err(e) if e.kind() == ErrorKind::NotFound => trace!(path = %path, "Remote file already gone"),
            Err(e) => return Err(e).with_context(|| format!("Failed to delete remote {path}")),
        }
        Ok(())
    }

    async fn delete_directory(&self, path: &RelativePath) -> Result<()> {
        if path.is_root() {
            anyhow::bail!("Refusing to delete the remote root");
        }
        match tokio::fs::remove_dir_all(path.to_local(&self.root)).await {
            Ok(()) => debug!(path = %path, "Deleted remote directory"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!(path = %path, "Remote directory already gone")
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to delete remote {path}")),
        }
        Ok(())
    }
}
