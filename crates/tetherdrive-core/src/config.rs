//! Configuration module for TetherDrive.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::SyncRoot;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for TetherDrive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
    /// Remote roots started by the daemon.
    pub roots: Vec<SyncRoot>,
}

/// Sync engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Size of one hydration chunk (in KiB).
    pub chunk_size_kb: u32,
    /// How many times a delete completion polls for local absence.
    pub delete_confirm_attempts: u32,
    /// Milliseconds between delete-confirmation polls.
    pub delete_confirm_interval_ms: u64,
    /// How many times an exclusive open of a hydrated file is retried.
    pub oplock_retry_attempts: u32,
    /// Milliseconds between exclusive-open retries.
    pub oplock_retry_interval_ms: u64,
    /// Seconds between remote change polls.
    pub remote_poll_interval: u64,
    /// Milliseconds a local change must be quiet before it is processed.
    pub debounce_delay_ms: u64,
    /// Capacity of the per-root local mutation channel.
    pub mutation_queue_capacity: usize,
    /// Entry names (globs allowed) that are never synchronized.
    pub reserved_names: Vec<String>,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `text` or `json`.
    pub format: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/tetherdrive/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("tetherdrive")
            .join("config.yaml")
    }
}

impl SyncConfig {
    /// Hydration chunk size in bytes.
    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_size_kb as usize * 1024
    }

    pub fn delete_confirm_interval(&self) -> Duration {
        Duration::from_millis(self.delete_confirm_interval_ms)
    }

    pub fn oplock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.oplock_retry_interval_ms)
    }

    pub fn remote_poll_interval(&self) -> Duration {
        Duration::from_secs(self.remote_poll_interval)
    }

    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Config::default()
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size_kb: 16,
            delete_confirm_attempts: 60,
            delete_confirm_interval_ms: 500,
            oplock_retry_attempts: 20,
            oplock_retry_interval_ms: 250,
            remote_poll_interval: 30,
            debounce_delay_ms: 500,
            mutation_queue_capacity: 1024,
            reserved_names: vec![
                ".tetherdrive".to_string(),
                "desktop.ini".to_string(),
                "thumbs.db".to_string(),
                ".DS_Store".to_string(),
                ".trashed-*".to_string(),
            ],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.chunk_size_kb"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

/// Upper bound for `sync.chunk_size_kb`.
const MAX_CHUNK_SIZE_KB: u32 = 4096;

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        let positive: [(&str, u64); 7] = [
            ("sync.chunk_size_kb", u64::from(self.sync.chunk_size_kb)),
            (
                "sync.delete_confirm_attempts",
                u64::from(self.sync.delete_confirm_attempts),
            ),
            (
                "sync.oplock_retry_attempts",
                u64::from(self.sync.oplock_retry_attempts),
            ),
            ("sync.remote_poll_interval", self.sync.remote_poll_interval),
            ("sync.debounce_delay_ms", self.sync.debounce_delay_ms),
            (
                "sync.mutation_queue_capacity",
                self.sync.mutation_queue_capacity as u64,
            ),
            (
                "sync.delete_confirm_interval_ms",
                self.sync.delete_confirm_interval_ms,
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                errors.push(ValidationError {
                    field: field.into(),
                    message: "must be greater than 0".into(),
                });
            }
        }
        if self.sync.chunk_size_kb > MAX_CHUNK_SIZE_KB {
            errors.push(ValidationError {
                field: "sync.chunk_size_kb".into(),
                message: format!("must not exceed {MAX_CHUNK_SIZE_KB}"),
            });
        }
        for (i, name) in self.sync.reserved_names.iter().enumerate() {
            if name.trim().is_empty() || name.contains('/') {
                errors.push(ValidationError {
                    field: format!("sync.reserved_names[{i}]"),
                    message: format!("must be a non-empty entry name: {name:?}"),
                });
            }
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}'; valid options: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        // --- roots ---
        let mut seen = HashSet::new();
        for (i, root) in self.roots.iter().enumerate() {
            if !seen.insert(root.id.as_str()) {
                errors.push(ValidationError {
                    field: format!("roots[{i}].id"),
                    message: format!("duplicate sync root id '{}'", root.id),
                });
            }
            if let Err(e) = root.validate() {
                errors.push(ValidationError {
                    field: format!("roots[{i}]"),
                    message: e.to_string(),
                });
            }
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use tetherdrive_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .chunk_size_kb(64)
///     .remote_poll_interval(60)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn chunk_size_kb(mut self, kb: u32) -> Self {
        self.config.sync.chunk_size_kb = kb;
        self
    }

    pub fn delete_confirm(mut self, attempts: u32, interval_ms: u64) -> Self {
        self.config.sync.delete_confirm_attempts = attempts;
        self.config.sync.delete_confirm_interval_ms = interval_ms;
        self
    }

    pub fn oplock_retry(mut self, attempts: u32, interval_ms: u64) -> Self {
        self.config.sync.oplock_retry_attempts = attempts;
        self.config.sync.oplock_retry_interval_ms = interval_ms;
        self
    }

    pub fn remote_poll_interval(mut self, seconds: u64) -> Self {
        self.config.sync.remote_poll_interval = seconds;
        self
    }

    pub fn debounce_delay_ms(mut self, ms: u64) -> Self {
        self.config.sync.debounce_delay_ms = ms;
        self
    }

    pub fn mutation_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.sync.mutation_queue_capacity = capacity;
        self
    }

    pub fn reserved_names(mut self, names: Vec<String>) -> Self {
        self.config.sync.reserved_names = names;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    // --- roots ---

    pub fn root(mut self, root: SyncRoot) -> Self {
        self.config.roots.push(root);
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
