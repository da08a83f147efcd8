//! Placeholder host port (driven/secondary port)
//!
//! This module defines the interface to the hierarchical-storage
//! virtualization layer that keeps placeholders on disk, and the callback
//! table through which that layer asks the engine for data.
//!
//! ## States
//!
//! The host persists, per entry, a [`PlaceholderState`], a [`PinState`], an
//! "offline" flag and the identity of the remote entry it was last synced
//! from. `offline` is true when the file content is not fully on disk, or,
//! for a directory, when its children have not been populated yet. The state
//! tells whether the entry is managed and whether it is marked in sync.
//!
//! ## Callbacks
//!
//! Callbacks never return errors to the host. The engine logs failures and,
//! for data requests, reports the unfulfilled range through
//! [`ITransferSink::fail_range`].
//!
//! [`PlaceholderState`]: crate::domain::PlaceholderState

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use crate::domain::{LocalPlaceholderInfo, PinState, RelativePath, RemoteEntry, SyncRoot};

// ============================================================================
// ConnectionKey
// ============================================================================

/// Handle returned by [`IPlaceholderHost::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey(u64);

impl ConnectionKey {
    /// Wraps a raw key issued by a host implementation
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw key
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl Display for ConnectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// DataRequest / ITransferSink
// ============================================================================

/// A request from the host for a byte range of a placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    /// File being hydrated
    pub path: RelativePath,
    /// First byte requested
    pub offset: u64,
    /// Number of bytes requested
    pub length: u64,
}

impl DataRequest {
    /// Request for `length` bytes of `path` starting at `offset`
    pub fn new(path: RelativePath, offset: u64, length: u64) -> Self {
        Self {
            path,
            offset,
            length,
        }
    }

    /// One past the last requested byte
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// Destination of the bytes for one [`DataRequest`]
#[async_trait::async_trait]
pub trait ITransferSink: Send + Sync {
    /// Reports progress of the request in bytes
    async fn report_progress(&self, total: u64, completed: u64) -> anyhow::Result<()>;

    /// Writes `data` at absolute file offset `offset`
    async fn write_chunk(&self, offset: u64, data: &[u8]) -> anyhow::Result<()>;

    /// Signals that `length` bytes starting at `offset` will not be delivered
    async fn fail_range(&self, offset: u64, length: u64) -> anyhow::Result<()>;

    /// Returns true once the host has abandoned the request
    fn is_cancelled(&self) -> bool {
        false
    }
}

// ============================================================================
// IHostCallbacks
// ============================================================================

/// Callback table registered with the host on connect
///
/// The host holds the table only while connected; the connector owns the
/// `Arc` for the whole lifetime of the connection.
#[async_trait::async_trait]
pub trait IHostCallbacks: Send + Sync {
    /// The host wants the children of `directory` materialized
    async fn fetch_placeholders(&self, directory: &RelativePath, pattern: Option<&str>);

    /// The host wants bytes for a placeholder
    async fn fetch_data(&self, request: DataRequest, sink: &dyn ITransferSink);

    /// A handle to `path` was closed
    async fn on_close_completion(&self, path: &RelativePath);

    /// A local entry was renamed
    async fn on_rename_completion(&self, from: &RelativePath, to: &RelativePath);

    /// A local entry was deleted
    async fn on_delete_completion(&self, path: &RelativePath);
}

// ============================================================================
// IPlaceholderHost
// ============================================================================

/// Port trait for the virtualization host of one sync root
///
/// ## Implementation Notes
///
/// - `create_placeholders` skips entries that already exist on disk and marks
///   `parent` as populated, also for an empty batch.
/// - `update_placeholder` records the identity of `entry` and, when
///   `dehydrate` is set, drops the local content first. Without `dehydrate`
///   the content of a hydrated file is left untouched.
/// - After `create_placeholders`, `update_placeholder` and `hydrate`, the
///   local modification time equals the recorded identity's, so an unedited
///   file always has a local identity equal to its recorded one.
/// - `hydrate` drives the registered [`IHostCallbacks::fetch_data`] for the
///   whole file and fails if any range was reported failed.
#[async_trait::async_trait]
pub trait IPlaceholderHost: Send + Sync {
    /// Registers the callback table for `root`
    async fn connect(
        &self,
        root: &SyncRoot,
        callbacks: Arc<dyn IHostCallbacks>,
    ) -> anyhow::Result<ConnectionKey>;

    /// Unregisters the connection identified by `key`
    async fn disconnect(&self, key: ConnectionKey) -> anyhow::Result<()>;

    /// Creates placeholders for `entries` inside `parent`
    async fn create_placeholders(
        &self,
        parent: &RelativePath,
        entries: &[RemoteEntry],
    ) -> anyhow::Result<()>;

    /// Reads the persisted state of `path`, `Ok(None)` if it does not exist
    async fn placeholder_info(
        &self,
        path: &RelativePath,
    ) -> anyhow::Result<Option<LocalPlaceholderInfo>>;

    /// Turns a regular local entry into a managed placeholder, keeping its content
    ///
    /// On an existing placeholder the local bytes become authoritative: the
    /// offline flag is cleared and the rest of its state is kept.
    async fn convert_to_placeholder(&self, path: &RelativePath) -> anyhow::Result<()>;

    /// Applies new remote metadata to a placeholder
    async fn update_placeholder(
        &self,
        path: &RelativePath,
        entry: &RemoteEntry,
        dehydrate: bool,
    ) -> anyhow::Result<()>;

    /// Brings the full content of `path` on disk
    async fn hydrate(&self, path: &RelativePath) -> anyhow::Result<()>;

    /// Drops the local content of `path`, keeping the placeholder
    async fn dehydrate(&self, path: &RelativePath) -> anyhow::Result<()>;

    /// Marks `path` as in sync with the remote entry
    async fn set_in_sync(&self, path: &RelativePath) -> anyhow::Result<()>;

    /// Sets the pin flag of `path`
    async fn set_pin_state(&self, path: &RelativePath, pin: PinState) -> anyhow::Result<()>;

    /// Whether the host itself reports local renames and deletions through
    /// the callback table
    fn raises_namespace_notifications(&self) -> bool;
}
