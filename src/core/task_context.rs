//! Per-thread context of the task currently running.
//!
//! [`TaskTracker::run_and_pop_next_task`](super::TaskTracker::run_and_pop_next_task)
//! installs a [`TaskContext`] for the duration of each task body. Code running
//! inside a task can query it, and library code can assert that the
//! restrictions implied by the task's traits are respected.

use std::cell::Cell;

use crate::core::sequence::SequenceToken;
use crate::core::task::{ExecutionMode, TaskPriority, TaskShutdownBehavior, TaskTraits};

/// What the running task is and what it may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    /// Sequence the task belongs to.
    pub sequence_token: SequenceToken,
    /// Priority the task runs at.
    pub priority: TaskPriority,
    /// Execution mode of the sequence.
    pub execution_mode: ExecutionMode,
    /// Blocking calls are allowed.
    pub may_block: bool,
    /// Waiting on synchronization primitives is allowed.
    pub with_sync_primitives: bool,
    /// Process-lifetime singletons may be touched. `false` for tasks that can
    /// outlive shutdown, since singletons may already be torn down.
    pub singleton_allowed: bool,
}

impl TaskContext {
    /// Context for a task of `sequence_token` run with `traits` and the
    /// effective shutdown `behavior`.
    #[must_use]
    pub fn new(
        sequence_token: SequenceToken,
        traits: TaskTraits,
        execution_mode: ExecutionMode,
        behavior: TaskShutdownBehavior,
    ) -> Self {
        Self {
            sequence_token,
            priority: traits.priority,
            execution_mode,
            may_block: traits.may_block,
            with_sync_primitives: traits.with_sync_primitives,
            singleton_allowed: behavior != TaskShutdownBehavior::ContinueOnShutdown,
        }
    }
}

thread_local! {
    static CURRENT: Cell<Option<TaskContext>> = const { Cell::new(None) };
}

/// Restores the previous context when dropped.
#[must_use = "the context is removed as soon as the guard is dropped"]
pub struct ScopedTaskContext {
    prev: Option<TaskContext>,
}

impl ScopedTaskContext {
    /// Install `context` on the current thread.
    pub fn enter(context: TaskContext) -> Self {
        let prev = CURRENT.with(|slot| slot.replace(Some(context)));
        Self { prev }
    }
}

impl Drop for ScopedTaskContext {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|slot| slot.set(prev));
    }
}

/// Context of the task running on this thread, if any.
#[must_use]
pub fn current() -> Option<TaskContext> {
    CURRENT.with(Cell::get)
}

/// Token of the sequence whose task runs on this thread.
#[must_use]
pub fn current_sequence_token() -> Option<SequenceToken> {
    current().map(|cx| cx.sequence_token)
}

/// Priority of the running task; [`TaskPriority::HIGHEST`] outside of a task.
#[must_use]
pub fn current_task_priority() -> TaskPriority {
    current().map_or(TaskPriority::HIGHEST, |cx| cx.priority)
}

/// Execution mode of the running task's sequence.
#[must_use]
pub fn current_execution_mode() -> Option<ExecutionMode> {
    current().map(|cx| cx.execution_mode)
}

/// Panics if the running task was not posted with `may_block`.
///
/// # Panics
///
/// Inside a task whose traits forbid blocking.
pub fn assert_blocking_allowed() {
    if let Some(cx) = current() {
        assert!(
            cx.may_block,
            "blocking call in a task of {} not posted with may_block",
            cx.sequence_token
        );
    }
}

/// Panics if the running task may not wait on synchronization primitives.
///
/// # Panics
///
/// Inside a task whose traits forbid waiting.
pub fn assert_sync_primitives_allowed() {
    if let Some(cx) = current() {
        assert!(
            cx.with_sync_primitives,
            "wait on a sync primitive in a task of {} not posted with_sync_primitives",
            cx.sequence_token
        );
    }
}

/// Panics if the running task may outlive process singletons.
///
/// # Panics
///
/// Inside a `ContinueOnShutdown` task.
pub fn assert_singleton_allowed() {
    if let Some(cx) = current() {
        assert!(
            cx.singleton_allowed,
            "singleton accessed from continue_on_shutdown task of {}",
            cx.sequence_token
        );
    }
}
