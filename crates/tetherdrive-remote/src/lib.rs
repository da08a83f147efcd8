//! TetherDrive Remote - remote file store adapters
//!
//! Implementations of [`IRemoteStore`] for the two kinds of remote a sync
//! root can point at:
//!
//! - [`http`] - JSON-over-HTTP file service exposed by the paired device
//! - [`directory`] - a remote tree already mounted into the local VFS
//!
//! [`open_store`] picks the adapter from a root's [`RemoteConnection`].

pub mod directory;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tetherdrive_core::domain::RemoteConnection;
use tetherdrive_core::ports::IRemoteStore;
use thiserror::Error;
use tracing::warn;

use crate::directory::DirectoryRemoteStore;
use crate::http::HttpRemoteStore;

/// Errors that can occur when talking to a remote store
///
/// The display strings of the throttling, server and network variants are
/// recognised as transient by the engine's retry helper.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Credentials missing or rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Insufficient permissions for the requested operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The requested entry does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation conflicts with the current remote state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Rate limit exceeded; retry after the specified duration
    #[error("Too many requests, retry after {retry_after:?}")]
    TooManyRequests {
        /// Duration to wait before retrying
        retry_after: Duration,
    },

    /// A server-side error occurred (5xx)
    #[error("Server error: {0}")]
    ServerError(String),

    /// A network-level error occurred
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// The response could not be parsed or was malformed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The remote root is misconfigured
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Default retry-after duration when the header is missing or unreadable
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

impl RemoteError {
    /// Classifies a non-success HTTP status
    pub fn from_status(status: StatusCode, detail: String, retry_after: Option<Duration>) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => RemoteError::Unauthorized(detail),
            StatusCode::FORBIDDEN => RemoteError::Forbidden(detail),
            StatusCode::NOT_FOUND => RemoteError::NotFound(detail),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => RemoteError::Conflict(detail),
            StatusCode::TOO_MANY_REQUESTS => RemoteError::TooManyRequests {
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            },
            s if s.is_server_error() => RemoteError::ServerError(format!("HTTP {s}: {detail}")),
            s => RemoteError::InvalidResponse(format!("unexpected HTTP {s}: {detail}")),
        }
    }
}

/// Parses a `Retry-After` header value (delta-seconds or HTTP-date)
pub fn parse_retry_after(value: &str, default: Duration) -> Duration {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Duration::from_secs(seconds);
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value.trim()) {
        let wait = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
        if let Some(secs) = u64::try_from(wait.num_seconds())
            .ok()
            .filter(|&s| s <= 3600)
        {
            return Duration::from_secs(secs);
        }
    }

    warn!(value, "Could not parse Retry-After header, using default");
    default
}

/// Builds the remote store described by `connection`
///
/// # Errors
/// Returns `RemoteError::InvalidConfig` if the connection cannot be used
pub fn open_store(connection: &RemoteConnection) -> Result<Arc<dyn IRemoteStore>, RemoteError> {
    match connection {
        RemoteConnection::Http {
            base_url,
            auth_token,
        } => Ok(Arc::new(HttpRemoteStore::new(base_url, auth_token.clone())?)),
        RemoteConnection::Directory { path } => Ok(Arc::new(DirectoryRemoteStore::new(path)?)),
    }
}
