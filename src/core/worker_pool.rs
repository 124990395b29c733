//! Worker pool running sequences on dedicated OS threads.
//!
//! The pool owns a [`PriorityQueue`](super::PriorityQueue) of sequences that
//! were admitted by the [`TaskTracker`](super::TaskTracker), and a set of
//! worker threads pulling from it. It is also the
//! [`CanScheduleSequenceObserver`](super::CanScheduleSequenceObserver) the
//! tracker calls when a preempted sequence may run.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use sequence_scheduler::config::WorkerPoolConfig;
//! use sequence_scheduler::core::{TaskPriority, TaskTracker, TaskTraits, WorkerPool};
//!
//! let tracker = Arc::new(TaskTracker::default());
//! let pool = WorkerPool::new(WorkerPoolConfig::new().with_worker_count(2), tracker)?;
//!
//! let runner = pool.create_sequenced_task_runner(
//!     TaskTraits::new().with_priority(TaskPriority::UserBlocking),
//! );
//! runner.post_task(|| println!("first"))?;
//! runner.post_task(|| println!("second"))?;
//!
//! pool.flush_for_testing();
//! pool.shutdown();
//! # Ok::<(), sequence_scheduler::core::SchedulerError>(())
//! ```

#[cfg(not(target_arch = "wasm32"))]
mod native;

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Tasks currently running or being skipped.
    pub active_tasks: u64,
    /// Sequences waiting in the pool's priority queue.
    pub queued_sequences: usize,
    /// Sequences parked by the concurrency limiter, all tiers.
    pub preempted_sequences: usize,
    /// Tasks accepted by `post_task`.
    pub posted_tasks: u64,
    /// Tasks refused because of shutdown.
    pub rejected_tasks: u64,
    /// Tasks taken off a sequence, whether they ran or were skipped.
    pub processed_tasks: u64,
    /// Undelayed tasks posted but not processed yet.
    pub incomplete_undelayed_tasks: usize,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub active_tasks: AtomicU64,
    pub posted_tasks: AtomicU64,
    pub rejected_tasks: AtomicU64,
    pub processed_tasks: AtomicU64,
}

impl PoolCounters {
    /// Copy the counters into a fresh [`PoolStats`]; queue-derived fields are
    /// left to the caller.
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            posted_tasks: self.posted_tasks.load(Ordering::Relaxed),
            rejected_tasks: self.rejected_tasks.load(Ordering::Relaxed),
            processed_tasks: self.processed_tasks.load(Ordering::Relaxed),
            ..PoolStats::default()
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use native::{TaskRunner, WorkerPool};
