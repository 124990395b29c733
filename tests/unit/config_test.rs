//! Tests for configuration validation

use sequence_scheduler::config::pool::MIN_THREAD_STACK_SIZE;
use sequence_scheduler::config::{SchedulerConfig, TrackerConfig, WorkerPoolConfig};

#[test]
fn test_default_config_is_valid() {
    let config = SchedulerConfig::default();
    assert!(config.validate().is_ok());
    assert!(config.pool.worker_count >= 1);
    assert_eq!(config.tracker.max_best_effort_sequences, usize::MAX);
}

#[test]
fn test_pool_config_invalid_worker_count() {
    let invalid = WorkerPoolConfig::new().with_worker_count(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_stack_size() {
    let invalid = WorkerPoolConfig::new().with_thread_stack_size(MIN_THREAD_STACK_SIZE - 1);
    assert!(invalid.validate().is_err());
    let valid = WorkerPoolConfig::new().with_thread_stack_size(MIN_THREAD_STACK_SIZE);
    assert!(valid.validate().is_ok());
}

#[test]
fn test_pool_config_invalid_name_prefix() {
    let invalid = WorkerPoolConfig::new().with_thread_name_prefix("");
    assert!(invalid.validate().is_err());
}

#[test]
fn test_tracker_config_invalid_best_effort_cap() {
    let invalid = TrackerConfig::new().with_max_best_effort_sequences(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_scheduler_config_reports_section() {
    let config = SchedulerConfig {
        tracker: TrackerConfig::new(),
        pool: WorkerPoolConfig::new().with_worker_count(0),
    };
    let err = config.validate().unwrap_err();
    assert!(err.starts_with("pool invalid"), "{err}");
}

#[test]
fn test_scheduler_config_from_json() {
    let json = r#"{
        "tracker": { "max_best_effort_sequences": 2 },
        "pool": { "worker_count": 3, "thread_name_prefix": "io" }
    }"#;

    let config = SchedulerConfig::from_json_str(json).unwrap();
    assert_eq!(config.tracker.max_best_effort_sequences, 2);
    assert_eq!(config.pool.worker_count, 3);
    assert_eq!(config.pool.thread_name_prefix, "io");
    assert_eq!(
        config.pool.thread_stack_size,
        WorkerPoolConfig::default().thread_stack_size
    );
}

#[test]
fn test_scheduler_config_from_json_rejects_invalid() {
    assert!(SchedulerConfig::from_json_str("{ not json").is_err());
    assert!(SchedulerConfig::from_json_str(r#"{ "pool": { "worker_count": 0 } }"#).is_err());
}
