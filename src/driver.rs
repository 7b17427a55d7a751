//! Producer and consumer workers that exercise a store the way client
//! applications do: push a batch, or poll a batch and acknowledge it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::DriverConfig;
use crate::message::{DeleteMessageRequest, Message, ReceiveMessageRequest, SendMessageRequest};
use crate::store::QueueStore;
use crate::{Error, Result};

const IDLE_BACKOFF: Duration = Duration::from_millis(10);

pub struct Producer {
    store: Arc<dyn QueueStore>,
    queue_url: String,
    delay_publish_secs: u32,
    max_messages: usize,
    worker: usize,
}

impl Producer {
    pub fn new(store: Arc<dyn QueueStore>, config: &DriverConfig, worker: usize) -> Self {
        Self {
            store,
            queue_url: config.queue_url.clone(),
            delay_publish_secs: config.delay_publish_secs,
            max_messages: config.max_messages,
            worker,
        }
    }

    /// Pushes one request of `max_messages` generated messages.
    pub fn run_once(&self) -> Result<usize> {
        let messages: Vec<Message> = (0..self.max_messages)
            .map(|seq| Message::new(format!("producer {} message {seq}", self.worker)))
            .collect();
        let count = messages.len();
        let request = SendMessageRequest::new(&self.queue_url, messages, self.delay_publish_secs);
        self.store.push(&request)?;
        Ok(count)
    }
}

pub struct Consumer {
    store: Arc<dyn QueueStore>,
    queue_url: String,
    visibility_timeout_minutes: u32,
    max_messages: usize,
}

impl Consumer {
    pub fn new(store: Arc<dyn QueueStore>, config: &DriverConfig) -> Self {
        Self {
            store,
            queue_url: config.queue_url.clone(),
            visibility_timeout_minutes: config.visibility_timeout_minutes,
            max_messages: config.max_messages,
        }
    }

    /// Polls once, logs what arrived and deletes it. Returns the number of
    /// messages acknowledged.
    pub fn run_once(&self) -> Result<usize> {
        let request = ReceiveMessageRequest::new(
            &self.queue_url,
            self.max_messages,
            self.visibility_timeout_minutes,
        );
        let received = self.store.poll(&request)?;
        if received.is_empty() {
            return Ok(0);
        }
        for message in &received {
            log::info!(
                "{} receipt={} attempts={} {}",
                self.queue_url,
                message.receipt_id,
                message.prior_attempts,
                message.content
            );
        }
        self.store
            .delete(&DeleteMessageRequest::new(&self.queue_url, received))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadReport {
    pub pushed: usize,
    pub consumed: usize,
}

/// Runs `worker_threads` producers (one push each) alongside
/// `worker_threads` consumers that keep polling until every message has been
/// produced and the queue is empty.
pub fn run_workload(store: Arc<dyn QueueStore>, config: &DriverConfig) -> Result<WorkloadReport> {
    let producers_done = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let pushed = AtomicUsize::new(0);
    let consumed = AtomicUsize::new(0);

    thread::scope(|scope| -> Result<()> {
        let mut handles = Vec::with_capacity(config.worker_threads * 2);
        for worker in 0..config.worker_threads {
            let producer = Producer::new(Arc::clone(&store), config, worker);
            let (pushed, producers_done, failed) = (&pushed, &producers_done, &failed);
            handles.push(scope.spawn(move || {
                let result = producer.run_once();
                match &result {
                    Ok(count) => {
                        pushed.fetch_add(*count, Ordering::AcqRel);
                    }
                    Err(_) => failed.store(true, Ordering::Release),
                }
                producers_done.fetch_add(1, Ordering::AcqRel);
                result.map(|_| ())
            }));
        }
        for _ in 0..config.worker_threads {
            let consumer = Consumer::new(Arc::clone(&store), config);
            let store = Arc::clone(&store);
            let (consumed, producers_done, failed) = (&consumed, &producers_done, &failed);
            handles.push(scope.spawn(move || -> Result<()> {
                while !failed.load(Ordering::Acquire) {
                    let count = match consumer.run_once() {
                        Ok(count) => count,
                        Err(err) => {
                            failed.store(true, Ordering::Release);
                            return Err(err);
                        }
                    };
                    consumed.fetch_add(count, Ordering::AcqRel);
                    if count > 0 {
                        continue;
                    }
                    if producers_done.load(Ordering::Acquire) == config.worker_threads
                        && store.depth(&config.queue_url)?.total() == 0
                    {
                        break;
                    }
                    thread::sleep(IDLE_BACKOFF);
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| Error::Poisoned("driver worker panicked"))??;
        }
        Ok(())
    })?;

    let report = WorkloadReport {
        pushed: pushed.into_inner(),
        consumed: consumed.into_inner(),
    };
    log::info!(
        "workload on {} finished: pushed={} consumed={}",
        config.queue_url,
        report.pushed,
        report.consumed
    );
    Ok(report)
}
