//! Build a tracker and worker pool from [`SchedulerConfig`].

use std::sync::Arc;

use tracing::info;

use crate::config::SchedulerConfig;
use crate::core::{SchedulerError, TaskTracker, WorkerPool};

/// A task tracker together with the worker pool running its sequences.
pub struct Scheduler {
    /// Shared tracker; also reachable through [`WorkerPool::tracker`].
    pub tracker: Arc<TaskTracker>,
    /// Worker pool bound to `tracker`.
    pub pool: WorkerPool,
}

impl Scheduler {
    /// Shut down the tracker and stop the workers.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

/// Validate `cfg` and build a tracker plus a running worker pool.
///
/// # Errors
///
/// `InvalidConfig` if validation fails, `WorkerSpawn` if a worker thread
/// can't be started.
pub fn build_scheduler(cfg: &SchedulerConfig) -> Result<Scheduler, SchedulerError> {
    cfg.validate().map_err(SchedulerError::InvalidConfig)?;

    let tracker = Arc::new(TaskTracker::new(cfg.tracker));
    let pool = WorkerPool::new(cfg.pool.clone(), Arc::clone(&tracker))?;
    info!(
        worker_count = cfg.pool.worker_count,
        max_best_effort_sequences = cfg.tracker.max_best_effort_sequences,
        "Scheduler built"
    );
    Ok(Scheduler { tracker, pool })
}
