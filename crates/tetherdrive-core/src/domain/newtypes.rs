//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for domain identifiers and values.
//! Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// SyncRootId
// ============================================================================

/// Identity of a registered sync root
///
/// Usually the identifier of the paired device plus a storage suffix,
/// e.g. `pixel-7a-internal`. Must be non-empty and must not contain path
/// separators since it is used to name per-root state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyncRootId(String);

impl SyncRootId {
    /// Create a new SyncRootId
    ///
    /// # Errors
    /// Returns `DomainError::InvalidSyncRootId` if the id is empty or contains
    /// a path separator
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DomainError::InvalidSyncRootId(
                "Sync root id cannot be empty".to_string(),
            ));
        }
        if id.contains('/') || id.contains('\\') {
            return Err(DomainError::InvalidSyncRootId(format!(
                "Sync root id must not contain path separators: {id}"
            )));
        }
        Ok(Self(id))
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SyncRootId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SyncRootId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SyncRootId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SyncRootId> for String {
    fn from(id: SyncRootId) -> Self {
        id.0
    }
}

// ============================================================================
// RelativePath
// ============================================================================

/// A normalized path relative to a sync root
///
/// RelativePath ensures the path is:
/// - Separated by `/` (backslashes are converted)
/// - Free of leading/trailing separators and empty components
/// - Free of `.` and `..` components
///
/// The empty path denotes the sync root itself. This is the key used by the
/// path lock manager, so two spellings of the same entry always compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelativePath(String);

impl RelativePath {
    /// Create a new RelativePath, normalizing separators
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path contains `..` or NUL bytes
    pub fn new(path: impl AsRef<str>) -> Result<Self, DomainError> {
        let raw = path.as_ref();
        if raw.contains('\0') {
            return Err(DomainError::InvalidPath(format!(
                "Path contains NUL byte: {raw:?}"
            )));
        }

        let mut parts = Vec::new();
        for component in raw.split(['/', '\\']) {
            match component {
                "" | "." => {}
                ".." => {
                    return Err(DomainError::InvalidPath(format!(
                        "Path escapes root via ..: {raw}"
                    )));
                }
                other => parts.push(other),
            }
        }

        Ok(Self(parts.join("/")))
    }

    /// The sync root itself
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Returns true if this path denotes the sync root
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the path as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Join a single name component to this path
    ///
    /// # Errors
    /// Returns error if the component is empty, contains a separator or is `..`
    pub fn join(&self, name: &str) -> Result<Self, DomainError> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(DomainError::InvalidPath(format!(
                "Invalid path component: {name:?}"
            )));
        }

        if self.is_root() {
            Ok(Self(name.to_string()))
        } else {
            Ok(Self(format!("{}/{}", self.0, name)))
        }
    }

    /// Returns the parent path, or `None` for the root
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Returns the final component, or `None` for the root
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Number of components (0 for the root)
    #[must_use]
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.split('/').count()
        }
    }

    /// Returns true if `self` equals `ancestor` or lies beneath it
    #[must_use]
    pub fn starts_with(&self, ancestor: &RelativePath) -> bool {
        if ancestor.is_root() || self == ancestor {
            return true;
        }
        self.0.starts_with(&ancestor.0) && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/')
    }

    /// Resolve this path against a local mount directory
    #[must_use]
    pub fn to_local(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for part in self.0.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }

    /// Derive the relative path of `path` beneath `root`
    ///
    /// # Errors
    /// Returns `DomainError::PathNotInSyncRoot` if `path` is not under `root`,
    /// or `DomainError::InvalidPath` if a component is not valid UTF-8
    pub fn from_local(root: &Path, path: &Path) -> Result<Self, DomainError> {
        let stripped = path.strip_prefix(root).map_err(|_| {
            DomainError::PathNotInSyncRoot(format!(
                "{} is not within {}",
                path.display(),
                root.display()
            ))
        })?;

        let mut parts = Vec::new();
        for component in stripped.components() {
            match component {
                Component::Normal(c) => {
                    let s = c.to_str().ok_or_else(|| {
                        DomainError::InvalidPath(format!(
                            "Non UTF-8 component in {}",
                            path.display()
                        ))
                    })?;
                    parts.push(s);
                }
                Component::CurDir => {}
                _ => {
                    return Err(DomainError::InvalidPath(format!(
                        "Unexpected component in {}",
                        path.display()
                    )));
                }
            }
        }

        Ok(Self(parts.join("/")))
    }
}

impl Display for RelativePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for RelativePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RelativePath {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RelativePath> for String {
    fn from(path: RelativePath) -> Self {
        path.0
    }
}

// ============================================================================
// IdentityHash
// ============================================================================

/// Cheap change-detection identity of a file: length plus modification time
///
/// Two entries with the same identity are considered unchanged. The
/// modification time is truncated to milliseconds because that is the
/// precision most remote stores report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityHash {
    length: u64,
    modified_millis: i64,
}

impl IdentityHash {
    /// Build an identity from a length and modification time
    #[must_use]
    pub fn new(length: u64, modified: DateTime<Utc>) -> Self {
        Self {
            length,
            modified_millis: modified.timestamp_millis(),
        }
    }

    /// Length component
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Modification time component in milliseconds since the Unix epoch
    #[must_use]
    pub const fn modified_millis(&self) -> i64 {
        self.modified_millis
    }
}

impl Display for IdentityHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.length, self.modified_millis)
    }
}

impl FromStr for IdentityHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (length, millis) = s
            .split_once(':')
            .ok_or_else(|| DomainError::InvalidIdentity(s.to_string()))?;
        let length = length
            .parse::<u64>()
            .map_err(|_| DomainError::InvalidIdentity(s.to_string()))?;
        let modified_millis = millis
            .parse::<i64>()
            .map_err(|_| DomainError::InvalidIdentity(s.to_string()))?;
        Ok(Self {
            length,
            modified_millis,
        })
    }
}
