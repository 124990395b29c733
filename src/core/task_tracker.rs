//! Shutdown-aware task admission and execution.
//!
//! The [`TaskTracker`] sits between producers, sequences and workers:
//!
//! 1. A producer asks [`will_post_task`](TaskTracker::will_post_task) before
//!    pushing a task onto a sequence.
//! 2. The poster that made a sequence non-empty asks
//!    [`will_schedule_sequence`](TaskTracker::will_schedule_sequence) whether
//!    the sequence's priority tier has room. If not, the sequence is parked and
//!    handed back later through a [`CanScheduleSequenceObserver`].
//! 3. A worker calls [`run_and_pop_next_task`](TaskTracker::run_and_pop_next_task),
//!    which runs or skips one task and says whether the sequence should keep
//!    going on this worker.
//!
//! Shutdown is split in two so that callers can stop producers between the
//! phases: [`start_shutdown`](TaskTracker::start_shutdown) stops admission of
//! everything but `BlockShutdown` work, and
//! [`complete_shutdown`](TaskTracker::complete_shutdown) blocks until that work
//! has drained.
//!
//! Lock order: sequence lock, then a tier lock. The shutdown, flush and fence
//! locks never nest inside those.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::TrackerConfig;
use crate::core::preemption::{PreemptionState, SharedObserver};
use crate::core::sequence::{Sequence, SequenceTransaction};
use crate::core::shutdown::AtomicShutdownState;
use crate::core::task::{Task, TaskPriority, TaskShutdownBehavior, TaskTraits};
use crate::core::task_context::{ScopedTaskContext, TaskContext};
use crate::util::event::WaitableEvent;

#[cfg(doc)]
use crate::core::preemption::CanScheduleSequenceObserver;

type FlushCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct FlushState {
    callback: Option<FlushCallback>,
}

struct FenceState {
    /// Fence raised through `set_execution_fence_enabled`.
    toggled: bool,
    /// Outstanding `begin_fence` calls.
    fences: usize,
    /// Outstanding `begin_best_effort_fence` calls.
    best_effort_fences: usize,
    /// Set once shutdown is completing; every fence is ignored from then on.
    overridden: bool,
    /// Caps in effect when no fence applies, indexed by priority.
    saved_max_scheduled: [usize; TaskPriority::COUNT],
}

impl FenceState {
    fn is_full_fence_up(&self) -> bool {
        !self.overridden && (self.toggled || self.fences > 0)
    }

    fn effective_max_scheduled(&self, priority: TaskPriority) -> usize {
        let fenced = self.is_full_fence_up()
            || (!self.overridden
                && priority == TaskPriority::BestEffort
                && self.best_effort_fences > 0);
        if fenced {
            0
        } else {
            self.saved_max_scheduled[priority.index()]
        }
    }
}

/// Tracks posted and running tasks and coordinates shutdown.
pub struct TaskTracker {
    state: AtomicShutdownState,
    /// Created by `start_shutdown`, signaled once nothing blocks shutdown.
    shutdown_event: Mutex<Option<Arc<WaitableEvent>>>,
    num_block_shutdown_tasks_posted_during_shutdown: AtomicUsize,
    max_block_shutdown_tasks_posted_during_shutdown: usize,
    num_incomplete_undelayed_tasks: AtomicUsize,
    flush: Mutex<FlushState>,
    flush_cv: Condvar,
    tiers: [PreemptionState; TaskPriority::COUNT],
    fence: Mutex<FenceState>,
}

impl TaskTracker {
    /// Create a tracker with the given limits.
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        let saved_max_scheduled = [config.max_best_effort_sequences, usize::MAX, usize::MAX];
        let tiers = TaskPriority::ALL
            .map(|priority| PreemptionState::new(priority, saved_max_scheduled[priority.index()]));
        Self {
            state: AtomicShutdownState::new(),
            shutdown_event: Mutex::new(None),
            num_block_shutdown_tasks_posted_during_shutdown: AtomicUsize::new(0),
            max_block_shutdown_tasks_posted_during_shutdown: config
                .max_block_shutdown_tasks_posted_during_shutdown,
            num_incomplete_undelayed_tasks: AtomicUsize::new(0),
            flush: Mutex::new(FlushState::default()),
            flush_cv: Condvar::new(),
            tiers,
            fence: Mutex::new(FenceState {
                toggled: false,
                fences: 0,
                best_effort_fences: 0,
                overridden: false,
                saved_max_scheduled,
            }),
        }
    }

    /// Create a tracker capping concurrently scheduled `BestEffort`
    /// sequences at `max`.
    #[must_use]
    pub fn with_max_best_effort_sequences(max: usize) -> Self {
        Self::new(TrackerConfig::new().with_max_best_effort_sequences(max))
    }

    /// Admission check before `task` is pushed onto a sequence.
    ///
    /// Returns `false` if the task must be dropped because shutdown has
    /// started. `BlockShutdown` tasks are still accepted during shutdown, and
    /// hold it until they've run.
    pub fn will_post_task(&self, task: &Task, shutdown_behavior: TaskShutdownBehavior) -> bool {
        let behavior = task.effective_shutdown_behavior(shutdown_behavior);
        if !self.before_queue_task(behavior) {
            return false;
        }
        if !task.is_delayed() {
            self.num_incomplete_undelayed_tasks
                .fetch_add(1, Ordering::SeqCst);
        }
        true
    }

    /// Ask whether the transaction's sequence may be handed to a worker now.
    ///
    /// On `false` the sequence was preempted and `observer` will be called
    /// with it once its tier has room.
    pub fn will_schedule_sequence(
        &self,
        transaction: &SequenceTransaction<'_>,
        observer: Option<SharedObserver>,
    ) -> bool {
        let sort_key = transaction.sort_key();
        self.tier(sort_key.priority())
            .try_admit(&transaction.sequence(), sort_key, observer)
    }

    /// Run (or skip, if shutdown forbids it) the next task of `sequence`, then
    /// pop it.
    ///
    /// Returns the sequence if the calling worker should keep running it. An
    /// emptied sequence is never returned; the next poster reschedules it.
    /// A sequence that has to yield is handed to its observer instead.
    ///
    /// # Panics
    ///
    /// If `sequence` has no task ready to take.
    pub fn run_and_pop_next_task(
        &self,
        sequence: Arc<Sequence>,
        observer: Option<SharedObserver>,
    ) -> Option<Arc<Sequence>> {
        let (task, traits) = {
            let mut transaction = sequence.begin_transaction();
            (transaction.take_task(), transaction.traits())
        };
        let behavior = task.effective_shutdown_behavior(traits.shutdown_behavior);
        let is_delayed = task.is_delayed();

        let can_run = self.before_run_task(behavior);
        self.run_or_skip_task(task, &sequence, traits, behavior, can_run);
        if can_run {
            self.after_run_task(behavior);
        }
        if !is_delayed {
            self.decrement_num_incomplete_undelayed_tasks();
        }

        let next_sort_key = {
            let mut transaction = sequence.begin_transaction();
            if transaction.pop() {
                None
            } else {
                Some(transaction.sort_key())
            }
        };

        // The slot belongs to the tier that admitted the sequence, which may
        // differ from `traits.priority` if the priority changed while queued.
        let admitted = sequence.admitted_priority().unwrap_or(traits.priority);
        let ran_tier = self.tier(admitted);
        match next_sort_key {
            Some(sort_key) if sort_key.priority() != admitted => {
                // The priority changed: give the old slot back and compete in
                // the new tier.
                ran_tier.release_and_maybe_promote(None, observer.clone());
                self.tier(sort_key.priority())
                    .try_admit(&sequence, sort_key, observer)
                    .then_some(sequence)
            }
            Some(sort_key) => ran_tier.release_and_maybe_promote(Some((sequence, sort_key)), observer),
            None => ran_tier.release_and_maybe_promote(None, observer),
        }
    }

    /// Decide whether a taken task may run, given its effective shutdown
    /// behavior. Called by [`run_and_pop_next_task`](Self::run_and_pop_next_task).
    ///
    /// A `SkipOnShutdown` task that is allowed to run blocks shutdown until the
    /// matching [`after_run_task`](Self::after_run_task).
    pub fn before_run_task(&self, behavior: TaskShutdownBehavior) -> bool {
        match behavior {
            TaskShutdownBehavior::BlockShutdown => {
                // Counted since `will_post_task`.
                debug_assert!(self.state.num_items_blocking_shutdown() > 0);
                true
            }
            TaskShutdownBehavior::SkipOnShutdown => {
                let shutdown_started = self.state.increment_num_items_blocking_shutdown();
                if shutdown_started {
                    if self.state.decrement_num_items_blocking_shutdown() {
                        self.on_blocking_shutdown_tasks_complete();
                    }
                    return false;
                }
                true
            }
            TaskShutdownBehavior::ContinueOnShutdown => !self.state.has_shutdown_started(),
        }
    }

    /// Account for a task that ran. `BlockShutdown` and `SkipOnShutdown` tasks
    /// stop blocking shutdown, which may complete it.
    pub fn after_run_task(&self, behavior: TaskShutdownBehavior) {
        if matches!(
            behavior,
            TaskShutdownBehavior::BlockShutdown | TaskShutdownBehavior::SkipOnShutdown
        ) && self.state.decrement_num_items_blocking_shutdown()
        {
            self.on_blocking_shutdown_tasks_complete();
        }
    }

    /// Stop accepting tasks other than `BlockShutdown` ones.
    ///
    /// # Panics
    ///
    /// If called more than once.
    pub fn start_shutdown(&self) {
        let mut shutdown_event = self.shutdown_event.lock();
        assert!(shutdown_event.is_none(), "start_shutdown() called twice");
        let event = Arc::new(WaitableEvent::new());
        *shutdown_event = Some(Arc::clone(&event));

        if self.state.start_shutdown() {
            event.signal();
            info!("Shutdown started, nothing blocking it");
        } else {
            info!(
                blocking_tasks = self.state.num_items_blocking_shutdown(),
                "Shutdown started, waiting for blocking tasks"
            );
        }
    }

    /// Block until every task holding shutdown has run, then release pending
    /// flushes.
    ///
    /// Every execution fence is overridden and the `BestEffort` cap is lifted
    /// first, so that preempted `BlockShutdown` sequences of any tier can
    /// drain. Fences raised afterwards have no effect.
    ///
    /// # Panics
    ///
    /// If [`start_shutdown`](Self::start_shutdown) wasn't called.
    pub fn complete_shutdown(&self) {
        let event = self
            .shutdown_event
            .lock()
            .clone()
            .unwrap_or_else(|| panic!("complete_shutdown() called before start_shutdown()"));

        {
            let mut fence = self.fence.lock();
            if fence.is_full_fence_up() || fence.best_effort_fences > 0 {
                info!(
                    fences = fence.fences,
                    best_effort_fences = fence.best_effort_fences,
                    "Shutdown overriding execution fences"
                );
            }
            fence.overridden = true;
            fence.saved_max_scheduled[TaskPriority::BestEffort.index()] = usize::MAX;
            self.apply_fence(&fence);
        }
        event.wait();

        {
            let _flush = self.flush.lock();
            self.flush_cv.notify_all();
        }
        self.call_flush_callback_for_testing();
        info!("Shutdown complete");
    }

    /// [`start_shutdown`](Self::start_shutdown) followed by
    /// [`complete_shutdown`](Self::complete_shutdown).
    pub fn shutdown(&self) {
        self.start_shutdown();
        self.complete_shutdown();
    }

    /// Whether shutdown started.
    #[must_use]
    pub fn has_shutdown_started(&self) -> bool {
        self.state.has_shutdown_started()
    }

    /// Whether shutdown started and nothing blocks it anymore.
    #[must_use]
    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_event
            .lock()
            .as_ref()
            .is_some_and(|event| event.is_signaled())
    }

    /// Number of tasks currently holding shutdown.
    #[must_use]
    pub fn num_tasks_blocking_shutdown(&self) -> usize {
        self.state.num_items_blocking_shutdown()
    }

    /// Number of undelayed tasks posted but not yet run or skipped.
    #[must_use]
    pub fn num_incomplete_undelayed_tasks(&self) -> usize {
        self.num_incomplete_undelayed_tasks.load(Ordering::SeqCst)
    }

    /// Change how many sequences of `priority` may be scheduled at once.
    ///
    /// While a fence covers the tier only the value restored by lifting the
    /// fence changes.
    pub fn set_max_scheduled_sequences(&self, priority: TaskPriority, max: usize) {
        let mut fence = self.fence.lock();
        fence.saved_max_scheduled[priority.index()] = max;
        self.tier(priority)
            .set_max_scheduled(fence.effective_max_scheduled(priority));
    }

    /// Raise or lift the toggled execution fence.
    ///
    /// While the fence is up no sequence is admitted; running tasks finish and
    /// their sequences are parked. Lifting it restores the previous caps and
    /// resumes parked sequences, highest priority first, unless a counted
    /// fence from [`begin_fence`](Self::begin_fence) is still up.
    pub fn set_execution_fence_enabled(&self, enabled: bool) {
        let mut fence = self.fence.lock();
        if fence.toggled == enabled {
            return;
        }
        fence.toggled = enabled;
        self.apply_fence(&fence);
        info!(enabled, "Execution fence toggled");
    }

    /// Raise a fence stopping every tier. Fences nest: scheduling resumes once
    /// each `begin_fence` has a matching [`end_fence`](Self::end_fence).
    pub fn begin_fence(&self) {
        let mut fence = self.fence.lock();
        fence.fences += 1;
        if fence.fences == 1 {
            self.apply_fence(&fence);
        }
        debug!(fences = fence.fences, "Execution fence raised");
    }

    /// Drop one fence raised by [`begin_fence`](Self::begin_fence).
    ///
    /// # Panics
    ///
    /// If no such fence is up.
    pub fn end_fence(&self) {
        let mut fence = self.fence.lock();
        assert!(fence.fences > 0, "end_fence() without begin_fence()");
        fence.fences -= 1;
        if fence.fences == 0 {
            self.apply_fence(&fence);
        }
        debug!(fences = fence.fences, "Execution fence lowered");
    }

    /// Raise a fence stopping only the `BestEffort` tier. Nests like
    /// [`begin_fence`](Self::begin_fence).
    pub fn begin_best_effort_fence(&self) {
        let mut fence = self.fence.lock();
        fence.best_effort_fences += 1;
        if fence.best_effort_fences == 1 {
            self.apply_fence(&fence);
        }
        debug!(
            best_effort_fences = fence.best_effort_fences,
            "BestEffort fence raised"
        );
    }

    /// Drop one fence raised by
    /// [`begin_best_effort_fence`](Self::begin_best_effort_fence).
    ///
    /// # Panics
    ///
    /// If no such fence is up.
    pub fn end_best_effort_fence(&self) {
        let mut fence = self.fence.lock();
        assert!(
            fence.best_effort_fences > 0,
            "end_best_effort_fence() without begin_best_effort_fence()"
        );
        fence.best_effort_fences -= 1;
        if fence.best_effort_fences == 0 {
            self.apply_fence(&fence);
        }
        debug!(
            best_effort_fences = fence.best_effort_fences,
            "BestEffort fence lowered"
        );
    }

    /// Whether a fence stopping every tier is up.
    #[must_use]
    pub fn execution_fence_enabled(&self) -> bool {
        self.fence.lock().is_full_fence_up()
    }

    /// Whether the `BestEffort` tier is stopped by any fence.
    #[must_use]
    pub fn best_effort_fence_enabled(&self) -> bool {
        let fence = self.fence.lock();
        fence.is_full_fence_up() || (!fence.overridden && fence.best_effort_fences > 0)
    }

    fn apply_fence(&self, fence: &FenceState) {
        for tier in self.tiers.iter().rev() {
            tier.set_max_scheduled(fence.effective_max_scheduled(tier.priority()));
        }
    }

    /// Number of preempted sequences of `priority` waiting for a slot.
    #[must_use]
    pub fn preempted_sequence_count_for_testing(&self, priority: TaskPriority) -> usize {
        self.tier(priority).preempted_count()
    }

    /// Block until every undelayed task posted so far has run or been
    /// skipped, or shutdown has completed.
    pub fn flush_for_testing(&self) {
        let mut flush = self.flush.lock();
        while self.num_incomplete_undelayed_tasks.load(Ordering::SeqCst) != 0
            && !self.is_shutdown_complete()
        {
            self.flush_cv.wait(&mut flush);
        }
    }

    /// Call `callback` once every undelayed task posted so far has run or
    /// been skipped, or shutdown has completed. It may run synchronously.
    ///
    /// # Panics
    ///
    /// If a previous callback is still pending.
    pub fn flush_async_for_testing<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut flush = self.flush.lock();
        assert!(
            flush.callback.is_none(),
            "only one flush_async_for_testing() may be pending at a time"
        );
        if self.num_incomplete_undelayed_tasks.load(Ordering::SeqCst) == 0
            || self.is_shutdown_complete()
        {
            drop(flush);
            callback();
        } else {
            flush.callback = Some(Box::new(callback));
        }
    }

    /// Resolve once every undelayed task posted so far has run or been
    /// skipped, or shutdown has completed.
    ///
    /// # Panics
    ///
    /// If a [`flush_async_for_testing`](Self::flush_async_for_testing) callback
    /// is pending.
    #[cfg(feature = "tokio-runtime")]
    pub async fn flush_async(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.flush_async_for_testing(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Drop every queued task of a sequence that no worker will ever run,
    /// settling what those tasks hold: shutdown blocking, the undelayed count
    /// and the tier slot the sequence was admitted with.
    ///
    /// Returns the number of tasks dropped.
    pub fn discard_sequence(&self, sequence: &Arc<Sequence>) -> usize {
        let (tasks, traits) = {
            let mut transaction = sequence.begin_transaction();
            (transaction.take_untaken_tasks(), transaction.traits())
        };
        let discarded = tasks.len();
        for task in tasks {
            let behavior = task.effective_shutdown_behavior(traits.shutdown_behavior);
            let is_delayed = task.is_delayed();
            drop(task);
            if behavior == TaskShutdownBehavior::BlockShutdown
                && self.state.decrement_num_items_blocking_shutdown()
            {
                self.on_blocking_shutdown_tasks_complete();
            }
            if !is_delayed {
                self.decrement_num_incomplete_undelayed_tasks();
            }
        }

        if let Some(admitted) = sequence.admitted_priority() {
            sequence.set_admitted_priority(None);
            self.tier(admitted).release_and_maybe_promote(None, None);
        }
        warn!(sequence = %sequence.token(), discarded, "Discarded tasks no worker will run");
        discarded
    }

    fn tier(&self, priority: TaskPriority) -> &PreemptionState {
        &self.tiers[priority.index()]
    }

    fn before_queue_task(&self, behavior: TaskShutdownBehavior) -> bool {
        if behavior != TaskShutdownBehavior::BlockShutdown {
            return !self.state.has_shutdown_started();
        }

        let shutdown_started = self.state.increment_num_items_blocking_shutdown();
        if !shutdown_started {
            return true;
        }

        if self.is_shutdown_complete() {
            error!("BlockShutdown task posted after shutdown completed; rejecting it");
            if self.state.decrement_num_items_blocking_shutdown() {
                self.on_blocking_shutdown_tasks_complete();
            }
            return false;
        }

        let posted = self
            .num_block_shutdown_tasks_posted_during_shutdown
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if posted == self.max_block_shutdown_tasks_posted_during_shutdown.saturating_add(1) {
            warn!(
                posted,
                threshold = self.max_block_shutdown_tasks_posted_during_shutdown,
                "Too many BlockShutdown tasks posted during shutdown; shutdown may hang"
            );
        }
        true
    }

    fn run_or_skip_task(
        &self,
        task: Task,
        sequence: &Sequence,
        traits: TaskTraits,
        behavior: TaskShutdownBehavior,
        can_run: bool,
    ) {
        let token = sequence.token();
        let task_id = task.id();
        let _context = ScopedTaskContext::enter(TaskContext::new(
            token,
            traits,
            sequence.execution_mode(),
            behavior,
        ));
        let body = task.into_body();

        if !can_run {
            debug!(%task_id, sequence = %token, %behavior, "Skipping task after shutdown started");
            drop(body);
            return;
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
            error!(
                %task_id,
                sequence = %token,
                panic = panic_message(payload.as_ref()),
                "Task panicked"
            );
        }
    }

    fn decrement_num_incomplete_undelayed_tasks(&self) {
        let prev = self
            .num_incomplete_undelayed_tasks
            .fetch_sub(1, Ordering::SeqCst);
        assert!(prev >= 1, "more undelayed tasks completed than posted");
        if prev == 1 {
            {
                let _flush = self.flush.lock();
                self.flush_cv.notify_all();
            }
            self.call_flush_callback_for_testing();
        }
    }

    fn call_flush_callback_for_testing(&self) {
        let callback = self.flush.lock().callback.take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn on_blocking_shutdown_tasks_complete(&self) {
        let shutdown_event = self.shutdown_event.lock();
        let Some(event) = shutdown_event.as_ref() else {
            panic!("blocking tasks drained after shutdown started, but no shutdown event exists");
        };
        event.signal();
        debug!("Last task blocking shutdown finished");
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTracker")
            .field("shutdown_started", &self.has_shutdown_started())
            .field("tasks_blocking_shutdown", &self.num_tasks_blocking_shutdown())
            .field(
                "incomplete_undelayed_tasks",
                &self.num_incomplete_undelayed_tasks(),
            )
            .field("tiers", &self.tiers)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}
