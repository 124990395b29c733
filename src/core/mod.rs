//! Core scheduling abstractions: tasks, sequences, the priority queue, the
//! concurrency limiter, the task tracker and the worker pool.

pub mod error;
pub mod preemption;
pub mod priority_queue;
pub mod sequence;
pub mod shutdown;
pub mod task;
pub mod task_context;
pub mod task_tracker;
pub mod worker_pool;

pub use error::{AppResult, SchedulerError};
pub use preemption::{CanScheduleSequenceObserver, PreemptionState, SharedObserver};
pub use priority_queue::PriorityQueue;
pub use sequence::{Sequence, SequenceSortKey, SequenceToken, SequenceTransaction};
pub use shutdown::AtomicShutdownState;
pub use task::{ExecutionMode, Task, TaskId, TaskPriority, TaskShutdownBehavior, TaskTraits};
pub use task_context::TaskContext;
pub use task_tracker::TaskTracker;
pub use worker_pool::PoolStats;
#[cfg(not(target_arch = "wasm32"))]
pub use worker_pool::{TaskRunner, WorkerPool};
