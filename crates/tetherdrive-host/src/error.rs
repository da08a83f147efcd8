//! Error types for the placeholder host.
//!
//! Defines `HostError` and conversions to and from libc errno values.

use std::path::Path;

use thiserror::Error;

/// Errors that can occur in the placeholder host.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not a placeholder: {0}")]
    NotPlaceholder(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("disk full: {0}")]
    DiskFull(String),

    #[error("extended attributes not supported: {0}")]
    XattrUnsupported(String),

    #[error("invalid value {value:?} for attribute {name}")]
    InvalidAttribute { name: String, value: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("sync root already connected: {0}")]
    AlreadyConnected(String),

    #[error("no callback table registered")]
    NotConnected,

    #[error("hydration failed: {0}")]
    HydrationFailed(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl HostError {
    /// Classifies an I/O error raised while operating on `path`
    pub fn from_io(path: &Path, err: std::io::Error) -> Self {
        let subject = format!("{}: {err}", path.display());
        match err.raw_os_error() {
            Some(libc::ENOENT) => HostError::NotFound(subject),
            Some(libc::EACCES) | Some(libc::EPERM) => HostError::PermissionDenied(subject),
            Some(libc::EISDIR) => HostError::IsADirectory(subject),
            Some(libc::ENOSPC) | Some(libc::EDQUOT) => HostError::DiskFull(subject),
            Some(libc::ENOTSUP) => HostError::XattrUnsupported(subject),
            _ if err.kind() == std::io::ErrorKind::NotFound => HostError::NotFound(subject),
            _ => HostError::IoError(subject),
        }
    }
}

impl From<HostError> for libc::c_int {
    fn from(err: HostError) -> libc::c_int {
        match err {
            HostError::NotFound(_) => libc::ENOENT,
            HostError::PermissionDenied(_) => libc::EACCES,
            HostError::NotPlaceholder(_) => libc::EINVAL,
            HostError::IsADirectory(_) => libc::EISDIR,
            HostError::DiskFull(_) => libc::ENOSPC,
            HostError::XattrUnsupported(_) => libc::ENOTSUP,
            HostError::InvalidAttribute { .. } => libc::EINVAL,
            HostError::InvalidArgument(_) => libc::EINVAL,
            HostError::AlreadyConnected(_) => libc::EBUSY,
            HostError::NotConnected => libc::ENOTCONN,
            HostError::HydrationFailed(_) => libc::EIO,
            HostError::IoError(_) => libc::EIO,
        }
    }
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        HostError::IoError(err.to_string())
    }
}
