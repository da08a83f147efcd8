//! Placeholder and pin state of local entries
//!
//! These values are persisted by the virtualization host per entry. The
//! on-disk state is the only source of truth; the engine re-reads it before
//! every decision instead of caching it.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::IdentityHash;

// ============================================================================
// PlaceholderState
// ============================================================================

/// Virtualization state of a local entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderState {
    /// A regular local entry, not known to the virtualization host
    #[default]
    NoState,
    /// A placeholder whose content is not on disk
    Placeholder,
    /// A placeholder with some content ranges on disk
    PartiallyOnDisk,
    /// A placeholder whose metadata and content match the remote entry
    InSync,
}

impl PlaceholderState {
    /// Stable name used in logs and persisted attributes
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoState => "no_state",
            Self::Placeholder => "placeholder",
            Self::PartiallyOnDisk => "partially_on_disk",
            Self::InSync => "in_sync",
        }
    }

    /// Whether moving from `self` to `target` is a legal transition
    ///
    /// A regular entry must become a placeholder before it can carry
    /// partial content; every other move is allowed.
    pub fn can_transition_to(&self, target: PlaceholderState) -> bool {
        !matches!(
            (self, target),
            (Self::NoState, Self::PartiallyOnDisk)
        )
    }

    /// Validate a transition
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` if the transition is not allowed
    pub fn transition_to(&self, target: PlaceholderState) -> Result<PlaceholderState, DomainError> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(DomainError::InvalidState {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }
}

impl Display for PlaceholderState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoState => "NoState",
            Self::Placeholder => "Placeholder",
            Self::PartiallyOnDisk => "PartiallyOnDisk",
            Self::InSync => "InSync",
        };
        write!(f, "{name}")
    }
}

impl FromStr for PlaceholderState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_state" => Ok(Self::NoState),
            "placeholder" => Ok(Self::Placeholder),
            "partially_on_disk" => Ok(Self::PartiallyOnDisk),
            "in_sync" => Ok(Self::InSync),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown placeholder state: {other}"
            ))),
        }
    }
}

// ============================================================================
// PinState
// ============================================================================

/// User intent for keeping content local, independent of `PlaceholderState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinState {
    /// Follow the parent directory
    #[default]
    Inherit,
    /// Always keep content on disk
    Pinned,
    /// Content may be (and is expected to be) dropped
    Unpinned,
}

impl PinState {
    /// Stable name used in logs and persisted attributes
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inherit => "inherit",
            Self::Pinned => "pinned",
            Self::Unpinned => "unpinned",
        }
    }
}

impl Display for PinState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PinState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inherit" => Ok(Self::Inherit),
            "pinned" => Ok(Self::Pinned),
            "unpinned" => Ok(Self::Unpinned),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown pin state: {other}"
            ))),
        }
    }
}

// ============================================================================
// LocalPlaceholderInfo
// ============================================================================

/// Snapshot of what the host knows about one local entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalPlaceholderInfo {
    /// Virtualization state
    pub state: PlaceholderState,
    /// Pin flag
    pub pin: PinState,
    /// True when the content is not (fully) on disk, or a directory is unpopulated
    pub offline: bool,
    /// True when the host manages this entry as a placeholder
    pub is_placeholder: bool,
    /// True for directories
    pub is_directory: bool,
    /// Identity of the remote entry the placeholder was last synced from
    pub identity: Option<IdentityHash>,
}

impl LocalPlaceholderInfo {
    /// Info for a regular entry the host does not manage
    pub fn unmanaged(is_directory: bool) -> Self {
        Self {
            is_directory,
            ..Self::default()
        }
    }

    /// Whether the file content is fully present locally
    pub fn is_hydrated(&self) -> bool {
        !self.offline
    }
}
