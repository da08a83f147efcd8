//! Local file watching and debounced change queue
//!
//! [`FileWatcher`] wraps the `notify` crate and turns raw OS events below a
//! sync root into [`ChangeEvent`] values. [`DebouncedChangeQueue`] coalesces
//! bursts of events per path so that the session only reacts once a path has
//! been quiet for the debounce window.
//!
//! ```text
//! inotify / kqueue
//!       │
//!       ▼
//!  FileWatcher ──→ mpsc ──→ DebouncedChangeQueue ──→ SyncSession routing
//! ```
//!
//! Metadata-only events are dropped: the engine itself rewrites extended
//! attributes and modification times while syncing, and reacting to those
//! would feed every sync back into the mutation queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// A local filesystem change, decoupled from `notify`'s event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    /// Content changed
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed { old: PathBuf, new: PathBuf },
}

impl ChangeEvent {
    /// The path the event is keyed by; the destination for renames
    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::Created(p) | ChangeEvent::Modified(p) | ChangeEvent::Deleted(p) => p,
            ChangeEvent::Renamed { new, .. } => new,
        }
    }
}

/// Recursive watcher over one sync root
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Creates the watcher and the channel its events are delivered on
    ///
    /// # Errors
    /// Returns an error if the OS watcher cannot be created
    pub fn new(capacity: usize) -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::channel::<ChangeEvent>(capacity.max(1));

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = map_notify_event(&event) {
                        if let Err(e) = tx.blocking_send(change) {
                            warn!(error = %e, "Dropped change event (receiver closed)");
                        }
                    }
                }
                Err(err) => error!(error = %err, "File watcher error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((Self { watcher }, rx))
    }

    /// Starts watching `path` recursively
    ///
    /// # Errors
    /// Returns an error if the path cannot be watched (missing, permissions,
    /// inotify watch limit)
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", path.display()))?;
        info!(path = %path.display(), "Watching local changes");
        Ok(())
    }

    pub fn unwatch(&mut self, path: &Path) -> Result<()> {
        self.watcher
            .unwatch(path)
            .with_context(|| format!("Failed to unwatch {}", path.display()))?;
        info!(path = %path.display(), "Stopped watching local changes");
        Ok(())
    }
}

/// Maps a raw `notify` event, or `None` for events the engine ignores
///
/// - `Create(*)` → `Created`
/// - `Modify(Name(Both))` with two paths → `Renamed`
/// - `Modify(Name(To))` → `Created` (moved in from outside)
/// - `Modify(Name(From))` → ignored, a `Remove` or `Name(To)` follows
/// - `Modify(Metadata(*))` → ignored
/// - other `Modify(*)` → `Modified`
/// - `Remove(*)` → `Deleted`
fn map_notify_event(event: &notify::Event) -> Option<ChangeEvent> {
    let paths = &event.paths;

    let mapped = match &event.kind {
        EventKind::Create(_) => ChangeEvent::Created(paths.first()?.clone()),
        EventKind::Remove(_) => ChangeEvent::Deleted(paths.first()?.clone()),
        EventKind::Modify(ModifyKind::Metadata(_)) => return None,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths.as_slice() {
            [old, new, ..] => ChangeEvent::Renamed {
                old: old.clone(),
                new: new.clone(),
            },
            [only] => ChangeEvent::Modified(only.clone()),
            [] => return None,
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            ChangeEvent::Created(paths.first()?.clone())
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => return None,
        EventKind::Modify(_) => ChangeEvent::Modified(paths.first()?.clone()),
        _ => {
            trace!(kind = ?event.kind, "Ignoring event kind");
            return None;
        }
    };

    trace!(event = ?mapped, "Mapped notify event");
    Some(mapped)
}

/// Coalesces rapid changes per path
///
/// A later event for a path replaces the pending one and restarts its
/// debounce window; [`poll`](Self::poll) yields the events whose window has
/// elapsed.
pub struct DebouncedChangeQueue {
    pending: HashMap<PathBuf, (ChangeEvent, Instant)>,
    debounce_delay: Duration,
}

impl DebouncedChangeQueue {
    pub fn new(debounce_delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            debounce_delay,
        }
    }

    pub fn push(&mut self, event: ChangeEvent) {
        let path = event.path().to_path_buf();
        trace!(path = %path.display(), event = ?event, "Debouncing change");
        self.pending.insert(path, (event, Instant::now()));
    }

    /// Removes and returns every settled event
    pub fn poll(&mut self) -> Vec<ChangeEvent> {
        let now = Instant::now();
        let delay = self.debounce_delay;

        let settled_paths: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) >= delay)
            .map(|(path, _)| path.clone())
            .collect();

        let settled: Vec<ChangeEvent> = settled_paths
            .iter()
            .filter_map(|path| self.pending.remove(path).map(|(event, _)| event))
            .collect();

        if !settled.is_empty() {
            debug!(count = settled.len(), "Settled local changes");
        }
        settled
    }

    /// When the oldest pending event settles, if any
    pub fn next_due(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|(_, at)| *at + self.debounce_delay)
            .min()
    }

    /// Removes and returns everything pending regardless of age
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        self.pending.drain().map(|(_, (event, _))| event).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
