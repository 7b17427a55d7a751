//! Local emulation of a managed message queue.
//!
//! Producers push batches, consumers poll for work and delete what they have
//! processed. A polled message stays hidden for the request's visibility
//! timeout; if it is not deleted by then, the next poll hands it out again
//! with a fresh receipt id (at-least-once delivery). Two interchangeable
//! stores implement the contract: [`FileQueueStore`] keeps one record log per
//! queue on disk, [`MemoryQueueStore`] keeps everything in process memory.

pub mod clock;
pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod layout;
pub mod lock;
pub mod message;
pub mod store;

pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use codec::RecordFormat;
pub use config::{Backend, Config, DriverConfig, LockConfig, StoreConfig};
pub use error::{Error, Result};
pub use lock::{DirLock, LockGuard, ProcessLock, QueueLock};
pub use message::{
    DeleteMessageRequest, Message, MessageStatus, QueueDepth, ReceiveMessageRequest,
    SendMessageRequest,
};
pub use store::{FileQueueStore, MemoryQueueStore, QueueStore};
