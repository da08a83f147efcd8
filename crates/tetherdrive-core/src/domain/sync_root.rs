//! Sync root definitions
//!
//! A sync root is one remote store projected into one local directory. Roots
//! are declared in the configuration file and handed to the sync root pool,
//! which is the only component that starts and stops work for them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::SyncRootId;

/// How eagerly the local projection is populated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulationPolicy {
    /// The whole remote tree is created as placeholders when the session starts
    AlwaysFull,
    /// Directory children are only fetched when the host asks for them
    #[default]
    OnDemand,
}

/// Opaque connection context for the remote store of a root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteConnection {
    /// JSON-over-HTTP file service exposed by the paired device
    Http {
        /// Base URL of the file service, e.g. `http://192.168.1.20:8080`
        base_url: String,
        /// Optional bearer token sent with every request
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
    },
    /// Remote already mounted into the local VFS (sshfs, gvfs, ...)
    Directory {
        /// Mount point of the remote tree
        path: PathBuf,
    },
}

/// A registered remote root and its local projection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRoot {
    /// Identity of the root, unique within the pool
    pub id: SyncRootId,
    /// Local directory the remote tree is projected into
    pub mount_dir: PathBuf,
    /// Population policy
    #[serde(default)]
    pub policy: PopulationPolicy,
    /// How to reach the remote store
    pub connection: RemoteConnection,
}

impl SyncRoot {
    /// Create a new sync root definition
    pub fn new(
        id: SyncRootId,
        mount_dir: impl Into<PathBuf>,
        policy: PopulationPolicy,
        connection: RemoteConnection,
    ) -> Self {
        Self {
            id,
            mount_dir: mount_dir.into(),
            policy,
            connection,
        }
    }

    /// Local mount directory
    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    /// Checks the invariants that cannot be expressed in the types
    ///
    /// # Errors
    /// Returns `DomainError::ValidationFailed` describing the first violation
    pub fn validate(&self) -> Result<(), DomainError> {
        if !self.mount_dir.is_absolute() {
            return Err(DomainError::ValidationFailed(format!(
                "mount_dir of root {} must be absolute: {}",
                self.id,
                self.mount_dir.display()
            )));
        }

        match &self.connection {
            RemoteConnection::Http { base_url, .. } => {
                if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                    return Err(DomainError::ValidationFailed(format!(
                        "base_url of root {} must be an http(s) URL: {base_url}",
                        self.id
                    )));
                }
            }
            RemoteConnection::Directory { path } => {
                if !path.is_absolute() {
                    return Err(DomainError::ValidationFailed(format!(
                        "remote directory of root {} must be absolute: {}",
                        self.id,
                        path.display()
                    )));
                }
                if path.starts_with(&self.mount_dir) || self.mount_dir.starts_with(path) {
                    return Err(DomainError::ValidationFailed(format!(
                        "remote directory and mount_dir of root {} overlap",
                        self.id
                    )));
                }
            }
        }

        Ok(())
    }
}
