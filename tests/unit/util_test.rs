//! Tests for shared types and utilities

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sequence_scheduler::core::{
    ExecutionMode, Sequence, TaskPriority, TaskShutdownBehavior, TaskTraits,
};
use sequence_scheduler::util::{Clock, ManualClock, WaitableEvent};

#[test]
fn test_priority_ordering() {
    assert!(TaskPriority::UserBlocking > TaskPriority::UserVisible);
    assert!(TaskPriority::UserVisible > TaskPriority::BestEffort);
    assert_eq!(TaskPriority::HIGHEST, TaskPriority::UserBlocking);
    assert_eq!(TaskPriority::default(), TaskPriority::UserVisible);
}

#[test]
fn test_traits_serde_names() {
    let traits = TaskTraits::new()
        .with_priority(TaskPriority::BestEffort)
        .with_shutdown_behavior(TaskShutdownBehavior::BlockShutdown);
    let json = serde_json::to_string(&traits).unwrap();
    assert!(json.contains("\"best_effort\""), "{json}");

    let back: TaskTraits = serde_json::from_str(&json).unwrap();
    assert_eq!(back, traits);
}

#[test]
fn test_manual_clock_orders_sequences() {
    let clock = Arc::new(ManualClock::new());
    let traits = TaskTraits::new();
    let first = Sequence::with_clock(traits, ExecutionMode::Parallel, clock.clone());
    let second = Sequence::with_clock(traits, ExecutionMode::Parallel, clock.clone());

    first.push_task(sequence_scheduler::core::Task::new(|| {}));
    clock.advance(Duration::from_millis(5));
    second.push_task(sequence_scheduler::core::Task::new(|| {}));

    let first_key = first.begin_transaction().sort_key();
    let second_key = second.begin_transaction().sort_key();
    // Same priority: the older task wins.
    assert!(first_key > second_key);
    assert_eq!(
        second_key.next_task_sequenced_time() - first_key.next_task_sequenced_time(),
        Duration::from_millis(5)
    );
    assert!(clock.now() >= second_key.next_task_sequenced_time());
}

#[test]
fn test_waitable_event_across_threads() {
    let event = Arc::new(WaitableEvent::new());
    let signal = Arc::clone(&event);
    let handle = thread::spawn(move || signal.signal());
    event.wait();
    handle.join().unwrap();
    assert!(event.is_signaled());
    assert!(event.wait_timeout(Duration::ZERO));
}

#[test]
fn test_init_tracing_is_idempotent() {
    sequence_scheduler::util::init_tracing();
    sequence_scheduler::util::init_tracing();
    tracing::info!(target: "util_test", "tracing initialized");
}
