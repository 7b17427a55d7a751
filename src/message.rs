//! Message record and the request shapes shared by every store.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const NANOS_PER_MINUTE: u64 = 60 * 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "INFLIGHT")]
    InFlight,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::New => "NEW",
            MessageStatus::InFlight => "INFLIGHT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NEW" => Some(MessageStatus::New),
            "INFLIGHT" => Some(MessageStatus::InFlight),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work.
///
/// `invisible_from` is nanoseconds since the UNIX epoch and is only set while
/// the message is in flight. A `receipt_id` of 0 means the message has never
/// been handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub status: MessageStatus,
    pub prior_attempts: u32,
    pub invisible_from: Option<u64>,
    pub receipt_id: u64,
    pub content: String,
}

impl Message {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            status: MessageStatus::New,
            prior_attempts: 0,
            invisible_from: None,
            receipt_id: 0,
            content: content.into(),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == MessageStatus::InFlight
    }

    /// Marks the message as handed out at `now` under `receipt_id`.
    pub(crate) fn deliver(&mut self, now: u64, receipt_id: u64) {
        self.status = MessageStatus::InFlight;
        self.invisible_from = Some(now);
        self.receipt_id = receipt_id;
    }

    /// Pushed messages always enter the queue fresh, whatever the caller set.
    pub(crate) fn into_new(self) -> Self {
        Self {
            status: MessageStatus::New,
            invisible_from: None,
            receipt_id: 0,
            ..self
        }
    }
}

/// Returns true when an in-flight message has been hidden strictly longer
/// than `timeout` as of `now`.
///
/// Elapsed time is measured at clock resolution (nanoseconds), not rounded to
/// whole minutes. New messages are never redeliverable.
pub fn is_redeliverable(message: &Message, now: u64, timeout: Duration) -> bool {
    if !message.is_in_flight() {
        return false;
    }
    let Some(since) = message.invisible_from else {
        // Neither record format decodes this; only hand-built messages get here.
        return true;
    };
    let elapsed = now.saturating_sub(since);
    u128::from(elapsed) > timeout.as_nanos()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageRequest {
    pub queue_id: String,
    pub messages: Vec<Message>,
    pub delay_seconds: u32,
}

impl SendMessageRequest {
    pub fn new(queue_id: impl Into<String>, messages: Vec<Message>, delay_seconds: u32) -> Self {
        Self {
            queue_id: queue_id.into(),
            messages,
            delay_seconds,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.delay_seconds))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveMessageRequest {
    pub queue_id: String,
    pub batch_size: usize,
    pub visibility_timeout_minutes: u32,
}

impl ReceiveMessageRequest {
    pub fn new(queue_id: impl Into<String>, batch_size: usize, visibility_timeout_minutes: u32) -> Self {
        Self {
            queue_id: queue_id.into(),
            batch_size,
            visibility_timeout_minutes,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_nanos(u64::from(self.visibility_timeout_minutes) * NANOS_PER_MINUTE)
    }
}

/// Messages to acknowledge. Matching is by `receipt_id`; content is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteMessageRequest {
    pub queue_id: String,
    pub messages: Vec<Message>,
}

impl DeleteMessageRequest {
    pub fn new(queue_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            queue_id: queue_id.into(),
            messages,
        }
    }

    /// Receipt ids that can match a delivery. Never-delivered messages carry
    /// receipt 0 and are dropped here.
    pub fn receipts(&self) -> impl Iterator<Item = u64> + '_ {
        self.messages
            .iter()
            .map(|message| message.receipt_id)
            .filter(|&receipt| receipt != 0)
    }
}

/// Point-in-time message counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub new: usize,
    pub in_flight: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.new + self.in_flight
    }
}
