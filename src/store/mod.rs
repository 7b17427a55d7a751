//! The push/poll/delete contract and its two backends.
//!
//! Both backends hand out messages in the same order: in-flight messages
//! whose visibility timeout has lapsed come first (oldest first, capped at the
//! batch size), then new messages in arrival order. Redelivery bumps
//! `prior_attempts` by one and always issues a fresh receipt id. Deletion is
//! by receipt id.

pub mod file;
pub mod memory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::{Clock, QuantaClock, SystemClock};
use crate::config::{Backend, ClockKind, StoreConfig};
use crate::message::{DeleteMessageRequest, Message, QueueDepth, ReceiveMessageRequest, SendMessageRequest};
use crate::Result;

pub use file::FileQueueStore;
pub use memory::MemoryQueueStore;

pub trait QueueStore: Send + Sync {
    /// Appends every message as NEW, creating the queue if needed.
    fn push(&self, request: &SendMessageRequest) -> Result<()>;

    /// Hands out up to `batch_size` eligible messages and marks them in
    /// flight. An empty vector means nothing was eligible, including when the
    /// queue does not exist.
    fn poll(&self, request: &ReceiveMessageRequest) -> Result<Vec<Message>>;

    /// Removes the in-flight messages whose receipt ids appear in the
    /// request. Returns how many were removed; unknown receipts are ignored.
    fn delete(&self, request: &DeleteMessageRequest) -> Result<usize>;

    /// Counts of new and in-flight messages. A missing queue is empty.
    fn depth(&self, queue_id: &str) -> Result<QueueDepth>;
}

/// Monotonic receipt id source. Ids start at 1.
#[derive(Debug, Default)]
pub struct ReceiptSequence {
    last: AtomicU64,
}

impl ReceiptSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Guarantees later ids are greater than `receipt_id`.
    pub fn observe(&self, receipt_id: u64) {
        self.last.fetch_max(receipt_id, Ordering::AcqRel);
    }
}

/// Builds the backend described by `config`.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn QueueStore>> {
    let clock: Arc<dyn Clock> = match config.clock {
        ClockKind::System => Arc::new(SystemClock),
        ClockKind::Tsc => Arc::new(QuantaClock::new()),
    };
    match config.backend {
        Backend::Memory => {
            log::debug!("opening in-memory queue store");
            Ok(Arc::new(MemoryQueueStore::new().with_clock(clock)))
        }
        Backend::File => {
            std::fs::create_dir_all(&config.root)?;
            log::debug!("opening file queue store at {}", config.root.display());
            let store = FileQueueStore::new(&config.root)
                .with_format(config.record_format)
                .with_lock(config.lock.build())
                .with_clock(clock);
            Ok(Arc::new(store))
        }
    }
}
