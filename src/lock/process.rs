use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::lock::{LockGuard, QueueLock};
use crate::{Error, Result};

/// Keyed mutex for stores that are only ever opened by one process.
///
/// Nothing touches the filesystem, so a panicking holder cannot leave a lock
/// behind: the guard still runs on unwind.
#[derive(Clone, Default)]
pub struct ProcessLock {
    inner: Arc<Inner>,
    acquire_timeout: Option<Duration>,
}

#[derive(Default)]
struct Inner {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

impl ProcessLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

impl QueueLock for ProcessLock {
    fn acquire(&self, path: &Path) -> Result<LockGuard> {
        let started = Instant::now();
        let mut held = self
            .inner
            .held
            .lock()
            .map_err(|_| Error::Poisoned("process lock table"))?;
        while held.contains(path) {
            held = match self.acquire_timeout {
                None => self
                    .inner
                    .released
                    .wait(held)
                    .map_err(|_| Error::Poisoned("process lock table"))?,
                Some(timeout) => {
                    let waited = started.elapsed();
                    let Some(remaining) = timeout.checked_sub(waited) else {
                        return Err(Error::LockUnavailable {
                            path: path.to_path_buf(),
                            waited,
                        });
                    };
                    self.inner
                        .released
                        .wait_timeout(held, remaining)
                        .map_err(|_| Error::Poisoned("process lock table"))?
                        .0
                }
            };
        }
        held.insert(path.to_path_buf());
        drop(held);

        let inner = Arc::clone(&self.inner);
        let key = path.to_path_buf();
        Ok(LockGuard::new(move || {
            let mut held = inner.held.lock().unwrap_or_else(PoisonError::into_inner);
            held.remove(&key);
            drop(held);
            inner.released.notify_all();
        }))
    }
}
