use std::fmt;
use std::path::{Path, PathBuf};

use crate::Error;

pub const MESSAGES_FILE: &str = "messages";
pub const RECEIPTS_FILE: &str = "receipts";
pub const LOCK_DIR: &str = ".lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    EmptyQueueId,
    EmptyComponent { queue_id: String },
    InvalidComponent { queue_id: String, value: String },
    ReservedComponent { queue_id: String, value: String },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::EmptyQueueId => write!(f, "empty queue id"),
            LayoutError::EmptyComponent { queue_id } => {
                write!(f, "empty path component in {queue_id:?}")
            }
            LayoutError::InvalidComponent { queue_id, value } => {
                write!(f, "invalid path component {value:?} in {queue_id:?}")
            }
            LayoutError::ReservedComponent { queue_id, value } => {
                write!(f, "reserved name {value:?} in {queue_id:?}")
            }
        }
    }
}

impl std::error::Error for LayoutError {}

impl From<LayoutError> for Error {
    fn from(err: LayoutError) -> Self {
        Error::InvalidQueueId(err.to_string())
    }
}

type Result<T> = std::result::Result<T, LayoutError>;

/// Maps queue ids onto directories under a store root.
///
/// A queue id is a `/`-separated path such as `orders/eu-west`. Each queue
/// directory holds the record log (`messages`), the highest receipt id ever
/// issued for the queue (`receipts`) and, while held, the lock directory
/// (`.lock`).
#[derive(Debug, Clone)]
pub struct QueueLayout {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePaths {
    pub dir: PathBuf,
    pub messages: PathBuf,
    pub receipts: PathBuf,
    pub lock: PathBuf,
}

impl QueueLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue_dir(&self, queue_id: &str) -> Result<PathBuf> {
        let trimmed = queue_id.trim_matches('/');
        if trimmed.is_empty() {
            return Err(LayoutError::EmptyQueueId);
        }
        let mut dir = self.root.clone();
        for component in trimmed.split('/') {
            validate_component(queue_id, component)?;
            dir.push(component);
        }
        Ok(dir)
    }

    pub fn queue_paths(&self, queue_id: &str) -> Result<QueuePaths> {
        let dir = self.queue_dir(queue_id)?;
        Ok(QueuePaths {
            messages: dir.join(MESSAGES_FILE),
            receipts: dir.join(RECEIPTS_FILE),
            lock: dir.join(LOCK_DIR),
            dir,
        })
    }
}

fn validate_component(queue_id: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(LayoutError::EmptyComponent {
            queue_id: queue_id.to_string(),
        });
    }
    if value == "." || value == ".." || value.contains('\\') || value.contains('\0') {
        return Err(LayoutError::InvalidComponent {
            queue_id: queue_id.to_string(),
            value: value.to_string(),
        });
    }
    if value == MESSAGES_FILE || value == RECEIPTS_FILE || value == LOCK_DIR {
        return Err(LayoutError::ReservedComponent {
            queue_id: queue_id.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}
