//! Task tracker configuration.

use serde::{Deserialize, Serialize};

/// Limits applied by a [`TaskTracker`](crate::core::TaskTracker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Cap on concurrently scheduled `BestEffort` sequences. Unlimited by
    /// default.
    pub max_best_effort_sequences: usize,
    /// A warning is logged once more `BlockShutdown` tasks than this were
    /// posted after shutdown started.
    pub max_block_shutdown_tasks_posted_during_shutdown: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_best_effort_sequences: usize::MAX,
            max_block_shutdown_tasks_posted_during_shutdown: 1000,
        }
    }
}

impl TrackerConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap concurrently scheduled `BestEffort` sequences.
    #[must_use]
    pub const fn with_max_best_effort_sequences(mut self, max: usize) -> Self {
        self.max_best_effort_sequences = max;
        self
    }

    /// Set the threshold for the "too many `BlockShutdown` tasks" warning.
    #[must_use]
    pub const fn with_max_block_shutdown_tasks_posted_during_shutdown(
        mut self,
        max: usize,
    ) -> Self {
        self.max_block_shutdown_tasks_posted_during_shutdown = max;
        self
    }

    /// Validate tracker configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_best_effort_sequences == 0 {
            return Err("max_best_effort_sequences must be greater than 0".into());
        }
        if self.max_block_shutdown_tasks_posted_during_shutdown == 0 {
            return Err(
                "max_block_shutdown_tasks_posted_during_shutdown must be greater than 0".into(),
            );
        }
        Ok(())
    }
}
