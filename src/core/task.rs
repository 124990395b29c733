//! Tasks and the traits that govern how they are scheduled.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique task identifier, used for log correlation.
pub type TaskId = Uuid;

/// Priority tier of a task or sequence, lowest first.
///
/// The derived ordering is significant: `UserBlocking > UserVisible > BestEffort`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Work the user won't notice if it's delayed; capped while other work runs.
    BestEffort,
    /// Work whose result is visible to the user, but not blocking interaction.
    #[default]
    UserVisible,
    /// Work the user is waiting on.
    UserBlocking,
}

impl TaskPriority {
    /// Number of priority tiers.
    pub const COUNT: usize = 3;

    /// All tiers from lowest to highest.
    pub const ALL: [Self; Self::COUNT] = [Self::BestEffort, Self::UserVisible, Self::UserBlocking];

    /// Highest tier.
    pub const HIGHEST: Self = Self::UserBlocking;

    /// Stable index for per-priority arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::BestEffort => 0,
            Self::UserVisible => 1,
            Self::UserBlocking => 2,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BestEffort => "best_effort",
            Self::UserVisible => "user_visible",
            Self::UserBlocking => "user_blocking",
        };
        f.write_str(name)
    }
}

/// What happens to a task when shutdown starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskShutdownBehavior {
    /// May be running when shutdown completes; dropped if it hasn't started.
    ContinueOnShutdown,
    /// Dropped if it hasn't started when shutdown starts; shutdown waits for it
    /// if it already started.
    #[default]
    SkipOnShutdown,
    /// Shutdown waits for it, even if it is posted during shutdown.
    BlockShutdown,
}

impl fmt::Display for TaskShutdownBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ContinueOnShutdown => "continue_on_shutdown",
            Self::SkipOnShutdown => "skip_on_shutdown",
            Self::BlockShutdown => "block_shutdown",
        };
        f.write_str(name)
    }
}

/// How tasks posted through one runner relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Every task gets its own sequence.
    Parallel,
    /// Tasks share one sequence and run one at a time, in order.
    Sequenced,
    /// Like `Sequenced`, with the expectation that a single thread serves it.
    SingleThread,
}

/// Scheduling attributes shared by all tasks of a sequence.
///
/// ```
/// use sequence_scheduler::core::{TaskPriority, TaskShutdownBehavior, TaskTraits};
///
/// let traits = TaskTraits::new()
///     .with_priority(TaskPriority::BestEffort)
///     .with_shutdown_behavior(TaskShutdownBehavior::BlockShutdown)
///     .may_block();
/// assert!(traits.may_block);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TaskTraits {
    /// Priority tier.
    pub priority: TaskPriority,
    /// Shutdown behavior.
    pub shutdown_behavior: TaskShutdownBehavior,
    /// Tasks may perform blocking work (file IO, sleeping).
    pub may_block: bool,
    /// Tasks may wait on synchronization primitives.
    pub with_sync_primitives: bool,
}

impl TaskTraits {
    /// Default traits: `UserVisible`, `SkipOnShutdown`, no blocking.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the shutdown behavior.
    #[must_use]
    pub const fn with_shutdown_behavior(mut self, behavior: TaskShutdownBehavior) -> Self {
        self.shutdown_behavior = behavior;
        self
    }

    /// Allow blocking calls.
    #[must_use]
    pub const fn may_block(mut self) -> Self {
        self.may_block = true;
        self
    }

    /// Allow waiting on synchronization primitives.
    #[must_use]
    pub const fn with_sync_primitives(mut self) -> Self {
        self.with_sync_primitives = true;
        self
    }
}

type TaskBody = Box<dyn FnOnce() + Send + 'static>;

/// One unit of work.
///
/// The body runs at most once. A task is moved into a [`Sequence`](super::Sequence),
/// taken out by exactly one worker and then consumed.
pub struct Task {
    id: TaskId,
    body: TaskBody,
    posted_at: Instant,
    delay: Duration,
    pub(crate) sequenced_time: Option<Instant>,
}

impl Task {
    /// Create an undelayed task.
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::delayed(body, Duration::ZERO)
    }

    /// Create a task that is meant to run after `delay`.
    pub fn delayed<F>(body: F, delay: Duration) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            body: Box::new(body),
            posted_at: Instant::now(),
            delay,
            sequenced_time: None,
        }
    }

    /// Task identifier.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task was posted with a non-zero delay.
    #[must_use]
    pub fn is_delayed(&self) -> bool {
        !self.delay.is_zero()
    }

    /// Earliest time the task should run, if delayed.
    #[must_use]
    pub fn delayed_run_time(&self) -> Option<Instant> {
        self.is_delayed().then(|| self.posted_at + self.delay)
    }

    /// When the task was created.
    #[must_use]
    pub const fn posted_at(&self) -> Instant {
        self.posted_at
    }

    /// When the task was pushed onto its sequence, if it has been.
    #[must_use]
    pub const fn sequenced_time(&self) -> Option<Instant> {
        self.sequenced_time
    }

    /// Shutdown behavior that actually applies to this task.
    ///
    /// A delayed `BlockShutdown` task is treated as `SkipOnShutdown` so that
    /// pending delayed work can't hold process exit hostage.
    #[must_use]
    pub fn effective_shutdown_behavior(
        &self,
        behavior: TaskShutdownBehavior,
    ) -> TaskShutdownBehavior {
        if behavior == TaskShutdownBehavior::BlockShutdown && self.is_delayed() {
            TaskShutdownBehavior::SkipOnShutdown
        } else {
            behavior
        }
    }

    pub(crate) fn into_body(self) -> TaskBody {
        self.body
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("delay", &self.delay)
            .field("sequenced_time", &self.sequenced_time)
            .finish_non_exhaustive()
    }
}
