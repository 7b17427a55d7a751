use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock unavailable: {} (waited {waited:?})", .path.display())]
    LockUnavailable { path: PathBuf, waited: Duration },

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("unsupported record version: {0}")]
    UnsupportedVersion(u32),

    #[error("invalid queue id: {0}")]
    InvalidQueueId(String),

    #[error("invalid message content: {0}")]
    InvalidContent(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("poisoned: {0}")]
    Poisoned(&'static str),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::CorruptRecord(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
