//! Behaviour every backend must share.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use localq::{
    Clock, DeleteMessageRequest, FileQueueStore, ManualClock, MemoryQueueStore, Message,
    MessageStatus, QueueStore, ReceiveMessageRequest, SendMessageRequest,
};
use tempfile::{tempdir, TempDir};

const QUEUE: &str = "Q";
const MINUTE: Duration = Duration::from_secs(60);

struct Backend {
    name: &'static str,
    store: Box<dyn QueueStore>,
    clock: Arc<ManualClock>,
    _dir: Option<TempDir>,
}

fn backends() -> Vec<Backend> {
    let memory_clock = Arc::new(ManualClock::starting_now());
    let file_clock = Arc::new(ManualClock::starting_now());
    let dir = tempdir().expect("tempdir");
    vec![
        Backend {
            name: "memory",
            store: Box::new(MemoryQueueStore::new().with_clock(memory_clock.clone())),
            clock: memory_clock,
            _dir: None,
        },
        Backend {
            name: "file",
            store: Box::new(FileQueueStore::new(dir.path()).with_clock(file_clock.clone())),
            clock: file_clock,
            _dir: Some(dir),
        },
    ]
}

fn push(store: &dyn QueueStore, contents: &[&str]) {
    let messages = contents.iter().map(|content| Message::new(*content)).collect();
    store
        .push(&SendMessageRequest::new(QUEUE, messages, 0))
        .expect("push");
}

fn poll(store: &dyn QueueStore, batch: usize, timeout_minutes: u32) -> Vec<Message> {
    store
        .poll(&ReceiveMessageRequest::new(QUEUE, batch, timeout_minutes))
        .expect("poll")
}

fn delete(store: &dyn QueueStore, messages: &[Message]) -> usize {
    store
        .delete(&DeleteMessageRequest::new(QUEUE, messages.to_vec()))
        .expect("delete")
}

fn contents(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|message| message.content.as_str()).collect()
}

#[test]
fn poll_returns_everything_pushed_with_distinct_receipts() {
    for backend in backends() {
        let store = backend.store.as_ref();
        push(store, &["a", "b", "c", "d", "e"]);

        let received = poll(store, 10, 5);
        assert_eq!(contents(&received), ["a", "b", "c", "d", "e"], "{}", backend.name);
        let receipts: HashSet<u64> = received.iter().map(|m| m.receipt_id).collect();
        assert_eq!(receipts.len(), 5, "{}", backend.name);
        for message in &received {
            assert_eq!(message.status, MessageStatus::InFlight, "{}", backend.name);
            assert_eq!(message.invisible_from, Some(backend.clock.now()), "{}", backend.name);
            assert_eq!(message.prior_attempts, 0, "{}", backend.name);
            assert_ne!(message.receipt_id, 0, "{}", backend.name);
        }
    }
}

#[test]
fn consecutive_polls_split_the_backlog() {
    for backend in backends() {
        let store = backend.store.as_ref();
        let all: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        push(store, &refs);

        let first = poll(store, 5, 5);
        let second = poll(store, 5, 5);
        assert_eq!(contents(&first), refs[..5], "{}", backend.name);
        assert_eq!(contents(&second), refs[5..], "{}", backend.name);
        assert!(poll(store, 5, 5).is_empty(), "{}", backend.name);
    }
}

#[test]
fn missing_or_empty_queue_yields_nothing() {
    for backend in backends() {
        let store = backend.store.as_ref();
        assert!(poll(store, 10, 5).is_empty(), "{}", backend.name);
        assert_eq!(delete(store, &[]), 0, "{}", backend.name);
        assert_eq!(store.depth(QUEUE).expect("depth").total(), 0, "{}", backend.name);
    }
}

#[test]
fn expired_message_is_redelivered_with_incremented_attempts() {
    for backend in backends() {
        let store = backend.store.as_ref();
        push(store, &["job"]);
        let first = poll(store, 10, 5);
        assert_eq!(first.len(), 1);

        backend.clock.advance(10 * MINUTE);
        let again = poll(store, 10, 5);
        assert_eq!(contents(&again), ["job"], "{}", backend.name);
        assert_eq!(again[0].prior_attempts, 1, "{}", backend.name);
        assert!(again[0].receipt_id > first[0].receipt_id, "{}", backend.name);
        assert_eq!(again[0].invisible_from, Some(backend.clock.now()), "{}", backend.name);

        backend.clock.advance(10 * MINUTE);
        let third = poll(store, 10, 5);
        assert_eq!(third[0].prior_attempts, 2, "{}", backend.name);
    }
}

#[test]
fn message_inside_visibility_window_stays_hidden() {
    for backend in backends() {
        let store = backend.store.as_ref();
        push(store, &["job"]);
        assert_eq!(poll(store, 10, 5).len(), 1);

        backend.clock.advance(2 * MINUTE);
        assert!(poll(store, 10, 5).is_empty(), "{}", backend.name);

        backend.clock.advance(3 * MINUTE);
        assert!(
            poll(store, 10, 5).is_empty(),
            "{}: exactly the timeout is not past it",
            backend.name
        );
    }
}

#[test]
fn delivery_inside_a_second_stays_hidden_for_the_full_timeout() {
    for backend in backends() {
        let store = backend.store.as_ref();
        backend.clock.advance(Duration::from_millis(900));
        push(store, &["job"]);
        assert_eq!(poll(store, 10, 5).len(), 1);

        backend.clock.advance(5 * MINUTE - Duration::from_millis(500));
        assert!(poll(store, 10, 5).is_empty(), "{}", backend.name);

        backend.clock.advance(Duration::from_millis(1_500));
        let redelivered = poll(store, 10, 5);
        assert_eq!(contents(&redelivered), ["job"], "{}", backend.name);
        assert_eq!(redelivered[0].prior_attempts, 1, "{}", backend.name);
    }
}

#[test]
fn redelivery_comes_before_new_messages() {
    for backend in backends() {
        let store = backend.store.as_ref();
        push(store, &["a", "b", "c"]);
        let first = poll(store, 1, 5);
        assert_eq!(contents(&first), ["a"]);

        backend.clock.advance(6 * MINUTE);
        let next = poll(store, 2, 5);
        assert_eq!(contents(&next), ["a", "b"], "{}", backend.name);
        assert_eq!(next[0].prior_attempts, 1, "{}", backend.name);
        assert_eq!(next[1].prior_attempts, 0, "{}", backend.name);
    }
}

#[test]
fn each_expired_message_appears_once_per_poll() {
    for backend in backends() {
        let store = backend.store.as_ref();
        push(store, &["a", "b", "c"]);
        assert_eq!(poll(store, 3, 1).len(), 3);

        backend.clock.advance(2 * MINUTE);
        let again = poll(store, 10, 1);
        assert_eq!(contents(&again), ["a", "b", "c"], "{}", backend.name);
        assert!(poll(store, 10, 1).is_empty(), "{}", backend.name);
    }
}

#[test]
fn redelivery_is_capped_by_batch_size() {
    for backend in backends() {
        let store = backend.store.as_ref();
        push(store, &["a", "b", "c", "d"]);
        assert_eq!(poll(store, 4, 1).len(), 4);

        backend.clock.advance(2 * MINUTE);
        assert_eq!(contents(&poll(store, 3, 1)), ["a", "b", "c"], "{}", backend.name);
        assert_eq!(contents(&poll(store, 3, 1)), ["d"], "{}", backend.name);
    }
}

#[test]
fn delete_removes_exactly_the_requested_messages() {
    for backend in backends() {
        let store = backend.store.as_ref();
        push(store, &["a", "b", "c", "d"]);
        let received = poll(store, 4, 5);

        assert_eq!(delete(store, &received[..2]), 2, "{}", backend.name);
        let depth = store.depth(QUEUE).expect("depth");
        assert_eq!(depth.total(), 2, "{}", backend.name);
        assert_eq!(depth.in_flight, 2, "{}", backend.name);

        assert_eq!(delete(store, &received[..2]), 0, "{}: repeat delete", backend.name);
        assert_eq!(store.depth(QUEUE).expect("depth").total(), 2, "{}", backend.name);

        // Deleted messages never come back.
        backend.clock.advance(10 * MINUTE);
        assert_eq!(contents(&poll(store, 10, 5)), ["c", "d"], "{}", backend.name);
    }
}

#[test]
fn deleted_message_is_not_polled_again() {
    for backend in backends() {
        let store = backend.store.as_ref();
        push(store, &["only"]);
        let received = poll(store, 1, 5);
        assert_eq!(delete(store, &received), 1, "{}", backend.name);

        assert!(poll(store, 1, 5).is_empty(), "{}", backend.name);
        backend.clock.advance(60 * MINUTE);
        assert!(poll(store, 1, 5).is_empty(), "{}", backend.name);
    }
}

#[test]
fn stale_receipt_does_not_delete_redelivered_message() {
    for backend in backends() {
        let store = backend.store.as_ref();
        push(store, &["job"]);
        let first = poll(store, 1, 1);
        backend.clock.advance(2 * MINUTE);
        let second = poll(store, 1, 1);

        assert_eq!(delete(store, &first), 0, "{}", backend.name);
        assert_eq!(delete(store, &second), 1, "{}", backend.name);
    }
}

#[test]
fn new_messages_cannot_be_deleted() {
    for backend in backends() {
        let store = backend.store.as_ref();
        push(store, &["a"]);
        assert_eq!(delete(store, &[Message::new("a")]), 0, "{}", backend.name);
        assert_eq!(store.depth(QUEUE).expect("depth").new, 1, "{}", backend.name);
    }
}

#[test]
fn zero_batch_size_returns_nothing_and_changes_nothing() {
    for backend in backends() {
        let store = backend.store.as_ref();
        push(store, &["a"]);
        assert!(poll(store, 0, 5).is_empty(), "{}", backend.name);
        assert_eq!(store.depth(QUEUE).expect("depth").new, 1, "{}", backend.name);
    }
}

#[test]
fn queues_are_independent() {
    for backend in backends() {
        let store = backend.store.as_ref();
        push(store, &["q"]);
        store
            .push(&SendMessageRequest::new("other", vec![Message::new("o")], 0))
            .expect("push other");

        let other = store
            .poll(&ReceiveMessageRequest::new("other", 10, 5))
            .expect("poll other");
        assert_eq!(contents(&other), ["o"], "{}", backend.name);
        assert_eq!(contents(&poll(store, 10, 5)), ["q"], "{}", backend.name);

        // Receipts from one queue do not delete in another.
        assert_eq!(
            store
                .delete(&DeleteMessageRequest::new(QUEUE, other))
                .expect("cross delete"),
            0,
            "{}",
            backend.name
        );
    }
}
