//! Remote store port (driven/secondary port)
//!
//! This module defines the interface to the authoritative remote file store
//! of one sync root. All paths are relative to the root of the remote tree.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because transport errors are adapter-specific;
//!   adapters attach context and the engine decides whether to retry.
//! - Listing never recurses. Recursive population is driven by the engine.
//! - `pattern` is a shell glob matched against the entry name only.

use std::path::Path;

use tokio::io::AsyncRead;

use crate::domain::{RelativePath, RemoteEntry};

/// Byte stream returned by [`IRemoteStore::open_read`]
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Port trait for remote store operations
///
/// One instance serves one sync root. Implementations must be safe to call
/// concurrently from the completion queue, the mutation queue and
/// hydration callbacks.
#[async_trait::async_trait]
pub trait IRemoteStore: Send + Sync {
    /// Lists the files directly inside `dir`
    ///
    /// # Arguments
    /// * `dir` - Directory to list (root for the top level)
    /// * `pattern` - Optional glob the entry name must match
    async fn list_files(
        &self,
        dir: &RelativePath,
        pattern: Option<&str>,
    ) -> anyhow::Result<Vec<RemoteEntry>>;

    /// Lists the directories directly inside `dir`
    async fn list_directories(
        &self,
        dir: &RelativePath,
        pattern: Option<&str>,
    ) -> anyhow::Result<Vec<RemoteEntry>>;

    /// Gets the metadata of one entry
    ///
    /// Returns `Ok(None)` when the entry does not exist remotely.
    async fn metadata(&self, path: &RelativePath) -> anyhow::Result<Option<RemoteEntry>>;

    /// Returns true if the entry exists remotely
    async fn exists(&self, path: &RelativePath) -> anyhow::Result<bool> {
        Ok(self.metadata(path).await?.is_some())
    }

    /// Opens the file for reading, starting at `offset`
    async fn open_read(&self, path: &RelativePath, offset: u64) -> anyhow::Result<RemoteReader>;

    /// Uploads the content of the local file `local` to `path`, replacing it
    async fn upload_file(&self, path: &RelativePath, local: &Path) -> anyhow::Result<()>;

    /// Creates a directory (parents are expected to exist)
    async fn create_directory(&self, path: &RelativePath) -> anyhow::Result<()>;

    /// Moves an entry
    async fn rename(&self, from: &RelativePath, to: &RelativePath) -> anyhow::Result<()>;

    /// Deletes a file; deleting a missing file is not an error
    async fn delete_file(&self, path: &RelativePath) -> anyhow::Result<()>;

    /// Deletes a directory recursively; deleting a missing directory is not an error
    async fn delete_directory(&self, path: &RelativePath) -> anyhow::Result<()>;
}
