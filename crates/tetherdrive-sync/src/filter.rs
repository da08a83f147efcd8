//! Reserved entry names
//!
//! Entries whose name matches one of the configured patterns are never
//! synchronized in either direction. Patterns are shell globs matched against
//! a single path component.

use glob::Pattern;
use tetherdrive_core::domain::RelativePath;
use tracing::trace;

use crate::SyncError;

/// Compiled set of reserved-name patterns
#[derive(Debug, Clone, Default)]
pub struct ReservedNames {
    patterns: Vec<Pattern>,
}

impl ReservedNames {
    /// Compiles `names` into patterns
    ///
    /// # Errors
    /// Returns `SyncError::InvalidPattern` for the first pattern that fails to compile
    pub fn new<S: AsRef<str>>(names: &[S]) -> Result<Self, SyncError> {
        let patterns = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                Pattern::new(name).map_err(|e| SyncError::InvalidPattern {
                    pattern: name.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Returns true if a single entry name is reserved (case-insensitive)
    pub fn is_reserved_name(&self, name: &str) -> bool {
        let options = glob::MatchOptions {
            case_sensitive: false,
            ..glob::MatchOptions::new()
        };
        self.patterns
            .iter()
            .any(|p| p.matches_with(name, options))
    }

    /// Returns true if any component of `path` is reserved
    pub fn is_reserved(&self, path: &RelativePath) -> bool {
        let reserved = path
            .as_str()
            .split('/')
            .filter(|c| !c.is_empty())
            .any(|c| self.is_reserved_name(c));
        if reserved {
            trace!(path = %path, "Skipping reserved path");
        }
        reserved
    }
}
