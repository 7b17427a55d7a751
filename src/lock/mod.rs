//! Mutual exclusion around a queue's record log.
//!
//! Locks are keyed by the path of the queue's lock entry. They are not
//! re-entrant: a thread that acquires the same path twice without dropping
//! the first guard waits on itself until its acquire timeout (forever when
//! none is set).

mod dir;
mod process;

use std::path::Path;

use crate::Result;

pub use dir::{read_owner_record, DirLock, OwnerRecord, DEFAULT_RETRY_INTERVAL};
pub use process::ProcessLock;

pub trait QueueLock: Send + Sync {
    /// Blocks until the lock at `path` is held or the lock's acquire timeout
    /// elapses (`Error::LockUnavailable`).
    fn acquire(&self, path: &Path) -> Result<LockGuard>;
}

/// Held lock; released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub(crate) fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}
