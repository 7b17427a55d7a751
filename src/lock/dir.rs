use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::clock::{Clock, SystemClock};
use crate::lock::{LockGuard, QueueLock};
use crate::{Error, Result};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

const OWNER_FILE: &str = "owner";

/// Directory-creation mutex.
///
/// `create_dir` is atomic on every filesystem we care about, so any number of
/// threads and processes can contend for the same path. The holder records
/// `pid start_time acquired_ns token` inside the directory. A waiter breaks the
/// lock when that owner process no longer exists (Linux only) or when the lease
/// has run out. Releasing and breaking both move the directory aside first and
/// only delete it if it still names the expected owner. Without a lease and without an acquire timeout this behaves like
/// the classic unbounded spin on `mkdir`.
#[derive(Clone)]
pub struct DirLock {
    retry_interval: Duration,
    acquire_timeout: Option<Duration>,
    lease: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl Default for DirLock {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            acquire_timeout: None,
            lease: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl DirLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// A held lock older than `lease` is considered abandoned.
    pub fn with_lease(mut self, lease: Option<Duration>) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn is_stale(&self, path: &Path, owner: Option<&OwnerRecord>) -> Result<bool> {
        let Some(owner) = owner else {
            // Holder has not written its record yet, or the lock was made by
            // a tool that never writes one. Fall back to the directory age.
            return Ok(self.lease_expired_by_mtime(path));
        };
        if !owner_alive(owner)? {
            return Ok(true);
        }
        let Some(lease) = self.lease else {
            return Ok(false);
        };
        let held_for = self.clock.now().saturating_sub(owner.acquired_ns);
        Ok(u128::from(held_for) > lease.as_nanos())
    }

    fn lease_expired_by_mtime(&self, path: &Path) -> bool {
        let Some(lease) = self.lease else {
            return false;
        };
        fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map(|age| age > lease)
            .unwrap_or(false)
    }
}

impl QueueLock for DirLock {
    fn acquire(&self, path: &Path) -> Result<LockGuard> {
        let started = Instant::now();
        loop {
            match fs::create_dir(path) {
                Ok(()) => {
                    let owner = match write_owner_record(path, self.clock.now()) {
                        Ok(owner) => owner,
                        Err(err) => {
                            let _ = fs::remove_dir_all(path);
                            return Err(err);
                        }
                    };
                    let held = path.to_path_buf();
                    return Ok(LockGuard::new(move || release_dir(&held, owner)));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err.into()),
            }

            match read_owner_record(path) {
                Ok(owner) => {
                    if self.is_stale(path, owner.as_ref())? {
                        break_stale(path, owner);
                        continue;
                    }
                }
                // Released between our mkdir and the read; retry after the wait.
                Err(Error::Io(err)) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }

            let waited = started.elapsed();
            if let Some(timeout) = self.acquire_timeout {
                if waited >= timeout {
                    return Err(Error::LockUnavailable {
                        path: path.to_path_buf(),
                        waited,
                    });
                }
            }
            log::debug!("waiting for lock {}", path.display());
            thread::sleep(self.retry_interval);
        }
    }
}

/// Identity of the current holder of a directory lock.
///
/// `token` tells apart acquisitions made by one process, so a holder can
/// recognise its own lock even when the clock has not moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerRecord {
    pub pid: u32,
    pub start_time: u64,
    pub acquired_ns: u64,
    pub token: u64,
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Reads the owner record of the lock at `path`. `Ok(None)` means the lock
/// directory exists but carries no (complete) record.
pub fn read_owner_record(path: &Path) -> Result<Option<OwnerRecord>> {
    if !path.is_dir() {
        return Err(Error::Io(std::io::Error::from(ErrorKind::NotFound)));
    }
    let mut contents = String::new();
    match File::open(path.join(OWNER_FILE)) {
        Ok(mut file) => {
            file.read_to_string(&mut contents)?;
        }
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    if !contents.ends_with('\n') {
        return Ok(None);
    }
    let mut parts = contents.split_whitespace().map(str::parse::<u64>);
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(Ok(pid)), Some(Ok(start_time)), Some(Ok(acquired_ns)), token) => {
            let token = match token {
                None => 0,
                Some(Ok(token)) => token,
                Some(Err(_)) => return Ok(None),
            };
            Ok(Some(OwnerRecord {
                pid: u32::try_from(pid).unwrap_or(0),
                start_time,
                acquired_ns,
                token,
            }))
        }
        _ => Ok(None),
    }
}

fn write_owner_record(path: &Path, acquired_ns: u64) -> Result<OwnerRecord> {
    let (pid, start_time) = lock_identity()?;
    let owner = OwnerRecord {
        pid,
        start_time,
        acquired_ns,
        token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
    };
    let record = format!("{pid} {start_time} {acquired_ns} {}\n", owner.token);
    let mut file = File::create(path.join(OWNER_FILE))?;
    file.write_all(record.as_bytes())?;
    Ok(owner)
}

// A holder whose lease ran out may find a successor's lock at `path`; that
// one is left alone.
fn release_dir(path: &Path, owner: OwnerRecord) {
    match read_owner_record(path) {
        Ok(Some(current)) if current == owner => {}
        Ok(_) => {
            log::warn!("lock {} changed hands before release", path.display());
            return;
        }
        Err(Error::Io(err)) if err.kind() == ErrorKind::NotFound => {
            log::warn!("lock {} vanished before release", path.display());
            return;
        }
        Err(err) => {
            log::warn!("failed to release lock {}: {err}", path.display());
            return;
        }
    }
    if retire(path, Some(owner)) {
        log::trace!("released lock {}", path.display());
    }
}

fn break_stale(path: &Path, owner: Option<OwnerRecord>) {
    if retire(path, owner) {
        log::warn!("broke stale lock {}", path.display());
    }
}

/// Moves the lock at `path` aside and deletes it if it still carries
/// `expected`. A lock that was replaced in the meantime is moved back.
/// Returns whether the expected lock was removed.
fn retire(path: &Path, expected: Option<OwnerRecord>) -> bool {
    let tombstone = tombstone_path(path);
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return false,
        Err(err) => {
            log::warn!("failed to retire lock {}: {err}", path.display());
            return false;
        }
    }
    let found = read_owner_record(&tombstone).ok().flatten();
    if found != expected {
        if let Err(err) = fs::rename(&tombstone, path) {
            log::warn!(
                "failed to restore lock {} from {}: {err}",
                path.display(),
                tombstone.display()
            );
        }
        return false;
    }
    if let Err(err) = fs::remove_dir_all(&tombstone) {
        log::warn!("failed to remove {}: {err}", tombstone.display());
    }
    true
}

fn tombstone_path(path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(
        ".retired-{}-{nanos}-{}",
        std::process::id(),
        NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(name)
}

#[cfg(target_os = "linux")]
fn owner_alive(owner: &OwnerRecord) -> Result<bool> {
    if owner.pid == 0 {
        return Ok(false);
    }
    match proc_start_time(owner.pid) {
        Ok(start) => Ok(start == owner.start_time),
        Err(Error::Io(err)) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(target_os = "linux")]
fn lock_identity() -> Result<(u32, u64)> {
    let pid = std::process::id();
    let start_time = proc_start_time(pid)?;
    Ok((pid, start_time))
}

#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Result<u64> {
    let path = format!("/proc/{pid}/stat");
    let mut contents = String::new();
    File::open(&path)?.read_to_string(&mut contents)?;
    let end = contents
        .rfind(')')
        .ok_or_else(|| Error::CorruptRecord("stat parse".to_string()))?;
    let after = &contents[end + 1..];
    // starttime is field 22; fields after the comm start at 3.
    let start = after
        .split_whitespace()
        .nth(19)
        .ok_or_else(|| Error::CorruptRecord("stat missing starttime".to_string()))?;
    start
        .parse::<u64>()
        .map_err(|_| Error::CorruptRecord("stat starttime invalid".to_string()))
}

#[cfg(not(target_os = "linux"))]
fn owner_alive(_owner: &OwnerRecord) -> Result<bool> {
    Ok(true)
}

#[cfg(not(target_os = "linux"))]
fn lock_identity() -> Result<(u32, u64)> {
    Ok((std::process::id(), 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::tempdir;

    #[test]
    fn acquire_writes_owner_and_release_removes_dir() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        let lock = DirLock::new();

        let guard = lock.acquire(&path).expect("acquire");
        assert!(path.is_dir());
        let owner = read_owner_record(&path).expect("read").expect("record");
        assert_eq!(owner.pid, std::process::id());

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn held_lock_times_out() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        let lock = DirLock::new()
            .with_retry_interval(Duration::from_millis(5))
            .with_acquire_timeout(Some(Duration::from_millis(40)));

        let _held = lock.acquire(&path).expect("acquire");
        let err = lock.acquire(&path).unwrap_err();
        assert!(matches!(err, Error::LockUnavailable { .. }));
    }

    #[test]
    fn expired_lease_is_broken() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        let clock = Arc::new(ManualClock::starting_now());
        let lock = DirLock::new()
            .with_retry_interval(Duration::from_millis(5))
            .with_acquire_timeout(Some(Duration::from_secs(5)))
            .with_lease(Some(Duration::from_secs(30)))
            .with_clock(clock.clone());

        let abandoned = lock.acquire(&path).expect("acquire");
        std::mem::forget(abandoned);

        clock.advance(Duration::from_secs(31));
        let guard = lock.acquire(&path).expect("reacquire after lease");
        let owner = read_owner_record(&path).expect("read").expect("record");
        assert_eq!(owner.acquired_ns, clock.now());
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn expired_holder_release_leaves_successor_alone() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        let clock = Arc::new(ManualClock::starting_now());
        let lock = DirLock::new()
            .with_retry_interval(Duration::from_millis(5))
            .with_acquire_timeout(Some(Duration::from_millis(50)))
            .with_lease(Some(Duration::from_secs(30)))
            .with_clock(clock.clone());

        let first = lock.acquire(&path).expect("first");
        clock.advance(Duration::from_secs(31));
        let second = lock.acquire(&path).expect("second breaks expired lease");
        let successor = read_owner_record(&path).expect("read").expect("record");

        drop(first);
        assert_eq!(
            read_owner_record(&path).expect("read").expect("record"),
            successor
        );
        assert!(matches!(
            lock.acquire(&path).unwrap_err(),
            Error::LockUnavailable { .. }
        ));

        drop(second);
        assert!(!path.exists());
        let leftovers = fs::read_dir(dir.path()).expect("read_dir").count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn breaking_skips_a_lock_that_changed_hands() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        let lock = DirLock::new();

        let _held = lock.acquire(&path).expect("acquire");
        let current = read_owner_record(&path).expect("read").expect("record");
        let judged_stale = OwnerRecord {
            token: current.token + 1,
            ..current
        };

        break_stale(&path, Some(judged_stale));
        assert_eq!(
            read_owner_record(&path).expect("read").expect("record"),
            current
        );
    }

    #[test]
    fn three_field_owner_records_still_parse() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        fs::create_dir(&path).expect("mkdir");
        fs::write(path.join(OWNER_FILE), "12 34 56\n").expect("owner");
        let owner = read_owner_record(&path).expect("read").expect("record");
        assert_eq!(
            owner,
            OwnerRecord {
                pid: 12,
                start_time: 34,
                acquired_ns: 56,
                token: 0,
            }
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn dead_owner_is_broken() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        fs::create_dir(&path).expect("mkdir");
        // pid 0 never names a live process.
        fs::write(path.join(OWNER_FILE), "0 0 0\n").expect("owner");

        let lock = DirLock::new().with_acquire_timeout(Some(Duration::from_secs(5)));
        let _guard = lock.acquire(&path).expect("acquire over dead owner");
    }

    #[test]
    fn bare_directory_without_lease_blocks() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        fs::create_dir(&path).expect("mkdir");

        let lock = DirLock::new()
            .with_retry_interval(Duration::from_millis(5))
            .with_acquire_timeout(Some(Duration::from_millis(30)));
        assert!(matches!(
            lock.acquire(&path).unwrap_err(),
            Error::LockUnavailable { .. }
        ));
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".lock");
        let lock = DirLock::new().with_retry_interval(Duration::from_millis(5));

        let guard = lock.acquire(&path).expect("acquire");
        let waiter = {
            let lock = lock.clone();
            let path = path.clone();
            thread::spawn(move || lock.acquire(&path).map(|guard| guard.release()))
        };
        thread::sleep(Duration::from_millis(30));
        guard.release();
        waiter.join().expect("join").expect("waiter acquire");
        assert!(!path.exists());
    }
}
