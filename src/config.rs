//! Store and driver configuration.
//!
//! Loaded from a JSON file; every field is optional and falls back to the
//! defaults below.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::RecordFormat;
use crate::layout::QueueLayout;
use crate::lock::{DirLock, ProcessLock, QueueLock};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub store: StoreConfig,
    pub driver: DriverConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(data)
            .map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.driver.validate()?;
        if self.store.backend == Backend::File {
            QueueLayout::new(&self.store.root)
                .queue_dir(&self.driver.queue_url)
                .map_err(|err| Error::Config(format!("driver.queue_url: {err}")))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockKind {
    #[default]
    System,
    /// TSC-based clock anchored to wall time at startup.
    Tsc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Directory holding one subdirectory per queue (file backend only).
    pub root: PathBuf,
    /// Encoding for newly written records.
    pub record_format: RecordFormat,
    pub clock: ClockKind,
    pub lock: LockConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            root: PathBuf::from("localq-data"),
            record_format: RecordFormat::Pipe,
            clock: ClockKind::System,
            lock: LockConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn file(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::File,
            root: root.into(),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.backend == Backend::File && self.root.as_os_str().is_empty() {
            return Err(Error::Config("store.root must not be empty".to_string()));
        }
        self.lock.validate()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// Lock directory next to the log; safe across processes.
    #[default]
    Directory,
    /// In-process mutex; only safe when a single process owns the root.
    Process,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub kind: LockKind,
    pub retry_interval_ms: u64,
    /// `None` waits forever.
    pub acquire_timeout_ms: Option<u64>,
    /// `None` never breaks a live holder's lock.
    pub lease_ms: Option<u64>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            kind: LockKind::Directory,
            retry_interval_ms: 50,
            acquire_timeout_ms: None,
            lease_ms: None,
        }
    }
}

impl LockConfig {
    pub fn build(&self) -> Arc<dyn QueueLock> {
        let acquire_timeout = self.acquire_timeout_ms.map(Duration::from_millis);
        match self.kind {
            LockKind::Directory => Arc::new(
                DirLock::new()
                    .with_retry_interval(Duration::from_millis(self.retry_interval_ms))
                    .with_acquire_timeout(acquire_timeout)
                    .with_lease(self.lease_ms.map(Duration::from_millis)),
            ),
            LockKind::Process => {
                Arc::new(ProcessLock::new().with_acquire_timeout(acquire_timeout))
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.retry_interval_ms == 0 {
            return Err(Error::Config(
                "store.lock.retry_interval_ms must be positive".to_string(),
            ));
        }
        if self.lease_ms == Some(0) {
            return Err(Error::Config("store.lock.lease_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// Parameters handed to producer and consumer workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub queue_url: String,
    pub worker_threads: usize,
    /// Messages per push, and batch size per poll.
    pub max_messages: usize,
    pub delay_publish_secs: u32,
    pub visibility_timeout_minutes: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            queue_url: "default".to_string(),
            worker_threads: 4,
            max_messages: 10,
            delay_publish_secs: 0,
            visibility_timeout_minutes: 5,
        }
    }
}

impl DriverConfig {
    fn validate(&self) -> Result<()> {
        if self.queue_url.trim_matches('/').is_empty() {
            return Err(Error::Config("driver.queue_url must not be empty".to_string()));
        }
        if self.worker_threads == 0 {
            return Err(Error::Config("driver.worker_threads must be positive".to_string()));
        }
        if self.max_messages == 0 {
            return Err(Error::Config("driver.max_messages must be positive".to_string()));
        }
        Ok(())
    }
}
