//! Per-directory mutual exclusion across concurrent sessions.
//!
//! The table is an explicit object shared by every session of one responder.
//! Membership is taken with a single check-then-insert under the mutex and
//! released by dropping the returned [`DirectoryLease`], so each acquisition
//! is released exactly once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Set of resolved directory paths currently under synchronization.
#[derive(Debug, Clone, Default)]
pub struct DirectoryLockTable {
    inner: Arc<Mutex<HashSet<PathBuf>>>,
}

impl DirectoryLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock for `path`, or `None` if another session holds it.
    pub fn try_acquire(&self, path: impl Into<PathBuf>) -> Option<DirectoryLease> {
        let path = path.into();
        if !self.guard().insert(path.clone()) {
            debug!(path = %path.display(), "directory busy");
            return None;
        }
        debug!(path = %path.display(), "directory locked");
        Some(DirectoryLease {
            table: self.clone(),
            path,
        })
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.guard().contains(path)
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}

/// Held lock on one directory. Dropping it releases the lock.
#[derive(Debug)]
pub struct DirectoryLease {
    table: DirectoryLockTable,
    path: PathBuf,
}

impl DirectoryLease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirectoryLease {
    fn drop(&mut self) {
        self.table.guard().remove(&self.path);
        debug!(path = %self.path.display(), "directory released");
    }
}
