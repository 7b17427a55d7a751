use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use dashmap::DashMap;

use crate::clock::{Clock, SystemClock};
use crate::message::{
    is_redeliverable, DeleteMessageRequest, Message, QueueDepth, ReceiveMessageRequest,
    SendMessageRequest,
};
use crate::store::{QueueStore, ReceiptSequence};
use crate::{Error, Result};

/// Ephemeral store. Each queue owns its FIFO of new messages and its
/// in-flight registry behind one mutex, so polls on the same queue never
/// race on redelivery and polls on different queues never contend.
pub struct MemoryQueueStore {
    queues: DashMap<String, Arc<Mutex<QueueState>>>,
    clock: Arc<dyn Clock>,
    receipts: ReceiptSequence,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    in_flight: Vec<Message>,
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            clock: Arc::new(SystemClock),
            receipts: ReceiptSequence::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn queue(&self, queue_id: &str) -> Arc<Mutex<QueueState>> {
        if let Some(queue) = self.queues.get(queue_id) {
            return Arc::clone(queue.value());
        }
        let entry = self.queues.entry(queue_id.to_string()).or_default();
        Arc::clone(entry.value())
    }

    fn existing(&self, queue_id: &str) -> Option<Arc<Mutex<QueueState>>> {
        self.queues
            .get(queue_id)
            .map(|queue| Arc::clone(queue.value()))
    }
}

fn lock_state(queue: &Mutex<QueueState>) -> Result<MutexGuard<'_, QueueState>> {
    queue.lock().map_err(|_| Error::Poisoned("queue state"))
}

impl QueueStore for MemoryQueueStore {
    /// Sleeps for the request's delay on the calling thread before anything
    /// becomes visible. No lock is held while sleeping.
    fn push(&self, request: &SendMessageRequest) -> Result<()> {
        let delay = request.delay();
        if !delay.is_zero() {
            log::debug!("delaying push to {} by {delay:?}", request.queue_id);
            thread::sleep(delay);
        }
        let queue = self.queue(&request.queue_id);
        let mut state = lock_state(&queue)?;
        state.ready.extend(
            request
                .messages
                .iter()
                .cloned()
                .map(Message::into_new),
        );
        log::debug!(
            "pushed {} messages to {}",
            request.messages.len(),
            request.queue_id
        );
        Ok(())
    }

    fn poll(&self, request: &ReceiveMessageRequest) -> Result<Vec<Message>> {
        if request.batch_size == 0 {
            return Ok(Vec::new());
        }
        let Some(queue) = self.existing(&request.queue_id) else {
            return Ok(Vec::new());
        };
        let now = self.clock.now();
        let timeout = request.visibility_timeout();
        let mut state = lock_state(&queue)?;

        let mut batch = Vec::with_capacity(request.batch_size);
        let mut idx = 0;
        while idx < state.in_flight.len() && batch.len() < request.batch_size {
            if is_redeliverable(&state.in_flight[idx], now, timeout) {
                let mut message = state.in_flight.remove(idx);
                message.prior_attempts = message.prior_attempts.saturating_add(1);
                batch.push(message);
            } else {
                idx += 1;
            }
        }
        let redelivered = batch.len();
        while batch.len() < request.batch_size {
            let Some(message) = state.ready.pop_front() else {
                break;
            };
            batch.push(message);
        }
        if batch.is_empty() {
            log::debug!("no eligible messages in {}", request.queue_id);
            return Ok(batch);
        }

        for message in &mut batch {
            message.deliver(now, self.receipts.next());
            state.in_flight.push(message.clone());
        }
        log::debug!(
            "delivered {} messages from {} ({redelivered} redelivered)",
            batch.len(),
            request.queue_id
        );
        Ok(batch)
    }

    fn delete(&self, request: &DeleteMessageRequest) -> Result<usize> {
        let receipts: HashSet<u64> = request.receipts().collect();
        if receipts.is_empty() {
            return Ok(0);
        }
        let Some(queue) = self.existing(&request.queue_id) else {
            return Ok(0);
        };
        let mut state = lock_state(&queue)?;
        let before = state.in_flight.len();
        state
            .in_flight
            .retain(|message| !receipts.contains(&message.receipt_id));
        let removed = before - state.in_flight.len();
        log::debug!("deleted {removed} messages from {}", request.queue_id);
        Ok(removed)
    }

    fn depth(&self, queue_id: &str) -> Result<QueueDepth> {
        let Some(queue) = self.existing(queue_id) else {
            return Ok(QueueDepth::default());
        };
        let state = lock_state(&queue)?;
        Ok(QueueDepth {
            new: state.ready.len(),
            in_flight: state.in_flight.len(),
        })
    }
}
