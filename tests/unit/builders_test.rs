//! Tests for builder modules

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sequence_scheduler::builders::build_scheduler;
use sequence_scheduler::config::{SchedulerConfig, TrackerConfig, WorkerPoolConfig};
use sequence_scheduler::core::{SchedulerError, TaskPriority, TaskShutdownBehavior, TaskTraits};

#[test]
fn test_build_scheduler_applies_config() {
    let config = SchedulerConfig {
        tracker: TrackerConfig::new().with_max_best_effort_sequences(2),
        pool: WorkerPoolConfig::new().with_worker_count(2),
    };

    let scheduler = build_scheduler(&config).unwrap();
    assert_eq!(scheduler.pool.stats().worker_count, 2);
    assert!(Arc::ptr_eq(scheduler.pool.tracker(), &scheduler.tracker));

    let ran = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&ran);
    let traits = TaskTraits::new()
        .with_priority(TaskPriority::BestEffort)
        .with_shutdown_behavior(TaskShutdownBehavior::BlockShutdown);
    scheduler
        .pool
        .post_task(traits, move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    scheduler.shutdown();
    assert!(scheduler.tracker.is_shutdown_complete());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_build_scheduler_rejects_invalid_config() {
    let config = SchedulerConfig {
        tracker: TrackerConfig::new().with_max_best_effort_sequences(0),
        pool: WorkerPoolConfig::new(),
    };
    assert!(matches!(
        build_scheduler(&config),
        Err(SchedulerError::InvalidConfig(_))
    ));
}
