//! # Sequence Scheduler
//!
//! A priority-aware, shutdown-aware task scheduling core for worker thread pools.
//!
//! Work is posted as [`Task`](core::Task)s onto [`Sequence`](core::Sequence)s:
//! FIFO run-queues whose tasks never run concurrently. A
//! [`TaskTracker`](core::TaskTracker) decides which tasks may be posted and
//! run, caps how many low-priority sequences occupy workers at once, and
//! coordinates process shutdown so that work marked `BlockShutdown` always
//! finishes while everything else is dropped in an orderly way.
//!
//! ## Core Problem Solved
//!
//! - **Priorities without starvation**: sequences are ordered by priority, then
//!   by how long their next task has waited
//! - **Background work stays in the background**: `BestEffort` sequences can be
//!   capped system-wide, independent of the number of workers
//! - **Deterministic shutdown**: each task declares whether shutdown must wait
//!   for it, may skip it, or may leave it running
//! - **Flush for tests**: block until everything posted so far has run
//!
//! ## Key Features
//!
//! - **Sequences**: single-consumer, multi-producer run-queues with sort keys
//! - **Priority queue**: O(log n) push, pop, remove and re-key of sequences
//! - **Concurrency limiter**: per-priority caps with a fair preemption heap
//! - **Execution fence**: pause all scheduling, then resume in order
//! - **Worker pool**: dedicated OS threads pulling from the priority queue
//!
//! ## Example
//!
//! ```rust
//! use sequence_scheduler::builders::build_scheduler;
//! use sequence_scheduler::config::SchedulerConfig;
//! use sequence_scheduler::core::{TaskShutdownBehavior, TaskTraits};
//!
//! let scheduler = build_scheduler(&SchedulerConfig::default())?;
//!
//! let traits = TaskTraits::new().with_shutdown_behavior(TaskShutdownBehavior::BlockShutdown);
//! scheduler.pool.post_task(traits, || println!("flushed to disk"))?;
//!
//! // Returns once the BlockShutdown task above has run.
//! scheduler.shutdown();
//! # Ok::<(), sequence_scheduler::core::SchedulerError>(())
//! ```
//!
//! For lower-level use, drive a [`TaskTracker`](core::TaskTracker) directly
//! with your own workers; see `tests/task_tracker_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions and shutdown accounting.
pub mod core;
/// Configuration models for the tracker and the worker pool.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Shared utilities.
pub mod util;
