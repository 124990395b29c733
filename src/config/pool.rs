//! Worker pool configuration.

use serde::{Deserialize, Serialize};

/// Smallest stack a worker thread may be given.
pub const MIN_THREAD_STACK_SIZE: usize = 64 * 1024;

const DEFAULT_THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;
const DEFAULT_THREAD_NAME_PREFIX: &str = "scheduler-worker";

/// Settings for the worker threads of a [`WorkerPool`](crate::core::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker threads. Defaults to the number of logical CPUs.
    pub worker_count: usize,
    /// Stack size of each worker thread, in bytes.
    pub thread_stack_size: usize,
    /// Worker threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            thread_stack_size: DEFAULT_THREAD_STACK_SIZE,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_owned(),
        }
    }
}

impl WorkerPoolConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, thread_stack_size: usize) -> Self {
        self.thread_stack_size = thread_stack_size;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Validate pool configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.thread_stack_size < MIN_THREAD_STACK_SIZE {
            return Err(format!(
                "thread_stack_size must be at least {MIN_THREAD_STACK_SIZE} bytes"
            ));
        }
        if self.thread_name_prefix.trim().is_empty() {
            return Err("thread_name_prefix must not be empty".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerPoolConfig::default();
        assert!(config.worker_count >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let err = WorkerPoolConfig::new().with_worker_count(0).validate();
        assert_eq!(err.unwrap_err(), "worker_count must be greater than 0");

        let err = WorkerPoolConfig::new().with_thread_stack_size(1024).validate();
        assert!(err.unwrap_err().contains("thread_stack_size"));

        let err = WorkerPoolConfig::new().with_thread_name_prefix(" ").validate();
        assert!(err.unwrap_err().contains("thread_name_prefix"));
    }
}
