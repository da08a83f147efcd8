//! TetherDrive Sync - Placeholder synchronization engine
//!
//! Projects a remote file store into a local directory as placeholders,
//! hydrates content on demand and pushes local mutations back.
//!
//! ## Modules
//!
//! - [`path_lock`] - Per-path exclusive async locks
//! - [`completion_queue`] - Single-consumer FIFO for deferred host callbacks
//! - [`placeholders`] - Per-entry placeholder lifecycle
//! - [`mutation_queue`] - Reconciliation of local filesystem mutations
//! - [`connector`] - Bridge between the engine and the virtualization host
//! - [`session`] - Orchestration of one sync root
//! - [`pool`] - Lifecycle of all sync root sessions
//! - [`watcher`] - Local filesystem watcher and debounced change queue
//! - [`remote_watcher`] - Periodic reconciliation against the remote store

pub mod completion_queue;
pub mod connector;
pub mod filter;
pub mod mutation_queue;
pub mod path_lock;
pub mod placeholders;
pub mod pool;
pub mod remote_watcher;
pub mod retry;
pub mod session;
pub mod watcher;

use std::path::PathBuf;

use tetherdrive_core::domain::RelativePath;
use thiserror::Error;

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred during local file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A file stayed locked by another process for the whole retry window
    #[error("File locked: {0}")]
    FileLocked(PathBuf),

    /// A local path does not belong to the sync root
    #[error("Path outside sync root: {0}")]
    OutsideRoot(PathBuf),

    /// A reserved-name pattern could not be compiled
    #[error("Invalid reserved name pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The connector is already connected to the host
    #[error("Already connected")]
    AlreadyConnected,

    /// A queue consumer has stopped and no longer accepts work
    #[error("Queue closed: {0}")]
    QueueClosed(&'static str),

    /// The operation observed cancellation
    #[error("Cancelled")]
    Cancelled,

    /// The remote stream ended before the requested range was delivered
    #[error("Remote stream ended early for {path} at offset {offset}")]
    ShortRead { path: RelativePath, offset: u64 },

    /// A domain-level error propagated from tetherdrive-core
    #[error("Domain error: {0}")]
    DomainError(#[from] tetherdrive_core::domain::errors::DomainError),
}
