//! Tests for error types

use std::error::Error as _;

use sequence_scheduler::core::SchedulerError;

#[test]
fn test_shutdown_started_error() {
    let err = SchedulerError::ShutdownStarted;
    assert_eq!(format!("{err}"), "task rejected: shutdown has started");
}

#[test]
fn test_invalid_config_error() {
    let err = SchedulerError::InvalidConfig("worker_count must be greater than 0".to_string());
    assert_eq!(
        format!("{err}"),
        "invalid configuration: worker_count must be greater than 0"
    );
}

#[test]
fn test_worker_spawn_error_keeps_source() {
    let err = SchedulerError::WorkerSpawn {
        worker_id: 1,
        source: std::io::Error::other("resource temporarily unavailable"),
    };
    let source = err.source().unwrap();
    assert_eq!(source.to_string(), "resource temporarily unavailable");
}

#[test]
fn test_errors_convert_to_anyhow() {
    fn fails() -> sequence_scheduler::core::AppResult<()> {
        Err(SchedulerError::PoolShutdown)?
    }
    let err = fails().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SchedulerError>(),
        Some(SchedulerError::PoolShutdown)
    ));
}
