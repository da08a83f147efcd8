//! Remote store entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{IdentityHash, RelativePath};

/// A file or directory as reported by the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Path relative to the sync root
    pub relative_path: RelativePath,
    /// Whether the entry is a directory
    pub is_directory: bool,
    /// Size in bytes (0 for directories)
    pub length: u64,
    /// Last modification time on the remote side
    pub last_modified: DateTime<Utc>,
}

impl RemoteEntry {
    /// A remote file
    pub fn file(relative_path: RelativePath, length: u64, last_modified: DateTime<Utc>) -> Self {
        Self {
            relative_path,
            is_directory: false,
            length,
            last_modified,
        }
    }

    /// A remote directory
    pub fn directory(relative_path: RelativePath, last_modified: DateTime<Utc>) -> Self {
        Self {
            relative_path,
            is_directory: true,
            length: 0,
            last_modified,
        }
    }

    /// Final path component
    pub fn name(&self) -> &str {
        self.relative_path.file_name().unwrap_or_default()
    }

    /// The "did this change" signal
    pub fn identity(&self) -> IdentityHash {
        IdentityHash::new(self.length, self.last_modified)
    }
}
