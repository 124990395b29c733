//! Error types for scheduler operations.
//!
//! Broken internal contracts (popping an empty sequence, starting shutdown
//! twice) panic. The errors below are for failures a caller can react to.

use thiserror::Error;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The pool was shut down and accepts no more work.
    #[error("pool has been shut down")]
    PoolShutdown,
    /// The tracker refused the task because shutdown has started.
    #[error("task rejected: shutdown has started")]
    ShutdownStarted,
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread {worker_id}: {source}")]
    WorkerSpawn {
        /// Index of the worker that failed to start.
        worker_id: usize,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
