//! Per-path exclusive locks
//!
//! Every mutation of a local entry, whichever source triggered it, runs while
//! holding the lock for its [`RelativePath`]. Operations on disjoint paths
//! proceed concurrently.
//!
//! At most one lock instance exists per path. The map entry is removed when
//! the last guard for the path is released, so the table only holds paths
//! that are locked or awaited.

use std::sync::Arc;

use dashmap::DashMap;
use tetherdrive_core::domain::RelativePath;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockTable = DashMap<RelativePath, Arc<Mutex<()>>>;

/// Table of per-path async mutexes
#[derive(Debug, Clone, Default)]
pub struct PathLockManager {
    locks: Arc<LockTable>,
}

impl PathLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `path` is free and locks it
    pub async fn acquire(&self, path: &RelativePath) -> PathLockGuard {
        let mutex = self.locks.entry(path.clone()).or_default().value().clone();
        let reservation = Reservation {
            path: path.clone(),
            locks: Arc::clone(&self.locks),
        };

        trace!(path = %path, "Waiting for path lock");
        let guard = mutex.lock_owned().await;
        trace!(path = %path, "Path lock acquired");

        PathLockGuard {
            guard: Some(guard),
            _reservation: reservation,
        }
    }

    /// Locks two paths without risking a lock-order inversion
    ///
    /// Returns a single guard when both paths are equal.
    pub async fn acquire_pair(
        &self,
        a: &RelativePath,
        b: &RelativePath,
    ) -> (PathLockGuard, Option<PathLockGuard>) {
        if a == b {
            return (self.acquire(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.acquire(first).await;
        let second = self.acquire(second).await;
        (first, Some(second))
    }

    /// Number of paths currently locked or awaited
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Removes the table entry once nobody else references the mutex
#[derive(Debug)]
struct Reservation {
    path: RelativePath,
    locks: Arc<LockTable>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.locks
            .remove_if(&self.path, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Exclusive access to one path; released on drop
#[derive(Debug)]
pub struct PathLockGuard {
    // Must drop before the reservation so the strong count check sees it gone.
    guard: Option<OwnedMutexGuard<()>>,
    _reservation: Reservation,
}

impl PathLockGuard {
    /// The locked path
    pub fn path(&self) -> &RelativePath {
        &self._reservation.path
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        trace!(path = %self._reservation.path, "Path lock released");
    }
}
