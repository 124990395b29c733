//! Native implementation of `WorkerPool` using OS threads.
//!
//! # Design Principles
//!
//! - **No polling**: every sequence pushed onto the queue is paired with one
//!   wake token on a channel; idle workers block on `recv()`
//! - **Short critical sections**: the queue lock is held only to push or pop
//! - **Clean shutdown**: dropping the sender unblocks workers once the tokens
//!   already sent have been consumed

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::WorkerPoolConfig;
use crate::core::error::SchedulerError;
use crate::core::preemption::{CanScheduleSequenceObserver, SharedObserver};
use crate::core::priority_queue::PriorityQueue;
use crate::core::sequence::{Sequence, SequenceSortKey, SequenceToken};
use crate::core::task::{ExecutionMode, Task, TaskPriority, TaskTraits};
use crate::core::task_context;
use crate::core::task_tracker::TaskTracker;

use super::{PoolCounters, PoolStats};

/// How long `shutdown` waits for each worker before detaching it.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared by the pool handle, its runners and its workers.
struct PoolShared {
    tracker: Arc<TaskTracker>,
    queue: Mutex<PriorityQueue>,
    /// One token per queued sequence. `None` once workers are stopping.
    wake_tx: Mutex<Option<Sender<()>>>,
    counters: PoolCounters,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_done: AtomicBool,
    /// Handed to the tracker with every sequence it may park.
    observer: SharedObserver,
}

impl PoolShared {
    fn observer(&self) -> SharedObserver {
        Arc::clone(&self.observer)
    }

    fn is_stopped(&self) -> bool {
        self.wake_tx.lock().is_none()
    }

    /// Admit `task` and push it onto `sequence`, scheduling the sequence if it
    /// was empty.
    fn post_task_to_sequence(
        &self,
        sequence: &Arc<Sequence>,
        task: Task,
    ) -> Result<(), SchedulerError> {
        if self.is_stopped() {
            return Err(SchedulerError::PoolShutdown);
        }
        let behavior = sequence.shutdown_behavior();
        if !self.tracker.will_post_task(&task, behavior) {
            self.counters.rejected_tasks.fetch_add(1, Ordering::Relaxed);
            debug!(sequence = %sequence.token(), %behavior, "Task rejected by tracker");
            return Err(SchedulerError::ShutdownStarted);
        }
        self.counters.posted_tasks.fetch_add(1, Ordering::Relaxed);

        let mut transaction = sequence.begin_transaction();
        if !transaction.push_task(task) {
            // Already scheduled or running; the worker will get to it.
            return Ok(());
        }
        if self
            .tracker
            .will_schedule_sequence(&transaction, Some(self.observer()))
        {
            let sort_key = transaction.sort_key();
            drop(transaction);
            self.push_to_queue(Arc::clone(sequence), sort_key);
        }
        Ok(())
    }

    fn enqueue(&self, sequence: Arc<Sequence>) {
        let sort_key = sequence.begin_transaction().sort_key();
        self.push_to_queue(sequence, sort_key);
    }

    /// Queue `sequence` with a wake token. Once the workers are stopping
    /// nothing would pop it, so its tasks are discarded instead.
    fn push_to_queue(&self, sequence: Arc<Sequence>, sort_key: SequenceSortKey) {
        {
            // The queue push happens under the wake lock so that
            // `stop_workers` can't drop the sender between push and send.
            let wake_tx = self.wake_tx.lock();
            if let Some(wake_tx) = wake_tx.as_ref() {
                self.queue.lock().push(sequence, sort_key);
                let _ = wake_tx.send(());
                return;
            }
        }
        debug!(sequence = %sequence.token(), "Workers stopped, not queueing sequence");
        self.tracker.discard_sequence(&sequence);
    }

    fn stats(&self) -> PoolStats {
        let worker_count = self.workers.lock().len();
        let mut stats = self.counters.snapshot(worker_count);
        stats.queued_sequences = self.queue.lock().len();
        stats.preempted_sequences = TaskPriority::ALL
            .iter()
            .map(|&p| self.tracker.preempted_sequence_count_for_testing(p))
            .sum();
        stats.incomplete_undelayed_tasks = self.tracker.num_incomplete_undelayed_tasks();
        stats
    }

    fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down worker pool");
        if !self.tracker.has_shutdown_started() {
            self.tracker.start_shutdown();
        }
        self.tracker.complete_shutdown();
        self.stop_workers();
    }

    /// Drop the wake sender and join every worker, detaching the ones that
    /// don't exit in time (e.g. stuck in a `ContinueOnShutdown` task).
    fn stop_workers(&self) {
        *self.wake_tx.lock() = None;

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let worker_count = workers.len();
        for (idx, worker) in workers.into_iter().enumerate() {
            let (tx, rx) = std::sync::mpsc::channel();
            let join_thread = thread::spawn(move || {
                let result = worker.join();
                let _ = tx.send(result.is_ok());
            });

            match rx.recv_timeout(WORKER_JOIN_TIMEOUT) {
                Ok(true) => {
                    debug!(worker_id = idx, "Worker joined successfully");
                    let _ = join_thread.join();
                }
                Ok(false) => {
                    warn!(worker_id = idx, "Worker panicked");
                    let _ = join_thread.join();
                }
                Err(_) => {
                    warn!(worker_id = idx, "Worker did not exit within timeout - detaching");
                }
            }
        }
        info!(worker_count, "Worker pool stopped");
    }
}

/// Routes promoted sequences back into the pool's queue.
///
/// The tracker keeps observers of parked sequences, and the pool owns the
/// tracker, so both links back are weak.
struct PoolObserver {
    pool: Weak<PoolShared>,
    tracker: Weak<TaskTracker>,
}

impl CanScheduleSequenceObserver for PoolObserver {
    fn on_can_schedule_sequence(&self, sequence: Arc<Sequence>) {
        if let Some(pool) = self.pool.upgrade() {
            pool.enqueue(sequence);
        } else if let Some(tracker) = self.tracker.upgrade() {
            debug!(sequence = %sequence.token(), "Pool gone, discarding promoted sequence");
            tracker.discard_sequence(&sequence);
        }
    }
}

/// Pool of worker threads running tasks admitted by a [`TaskTracker`].
///
/// Shutdown is explicit: [`shutdown`](Self::shutdown) drives the tracker
/// through both shutdown phases while the workers keep draining, then stops
/// the workers. Dropping the pool only stops the workers.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Create a pool and start `config.worker_count` worker threads.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration is invalid, `WorkerSpawn` if a
    /// thread can't be started.
    pub fn new(config: WorkerPoolConfig, tracker: Arc<TaskTracker>) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let (wake_tx, wake_rx) = unbounded::<()>();
        let shared = Arc::new_cyclic(|pool| PoolShared {
            observer: Arc::new(PoolObserver {
                pool: pool.clone(),
                tracker: Arc::downgrade(&tracker),
            }),
            tracker,
            queue: Mutex::new(PriorityQueue::new()),
            wake_tx: Mutex::new(Some(wake_tx)),
            counters: PoolCounters::default(),
            workers: Mutex::new(Vec::with_capacity(config.worker_count)),
            shutdown_done: AtomicBool::new(false),
        });

        for worker_id in 0..config.worker_count {
            match spawn_worker(worker_id, &config, wake_rx.clone(), Arc::clone(&shared)) {
                Ok(handle) => shared.workers.lock().push(handle),
                Err(e) => {
                    shared.stop_workers();
                    return Err(e);
                }
            }
        }

        info!(
            worker_count = config.worker_count,
            thread_name_prefix = %config.thread_name_prefix,
            "WorkerPool initialized with dedicated OS threads"
        );

        Ok(Self { config, shared })
    }

    /// Tracker admitting this pool's tasks.
    #[must_use]
    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.shared.tracker
    }

    /// Pool configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Post a task on its own sequence.
    ///
    /// # Errors
    ///
    /// `ShutdownStarted` if the tracker refused it, `PoolShutdown` if the
    /// workers were stopped.
    pub fn post_task<F>(&self, traits: TaskTraits, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sequence = Sequence::with_mode(traits, ExecutionMode::Parallel);
        self.shared.post_task_to_sequence(&sequence, Task::new(f))
    }

    /// Runner whose tasks run one at a time, in posting order.
    #[must_use]
    pub fn create_sequenced_task_runner(&self, traits: TaskTraits) -> TaskRunner {
        self.create_runner(traits, ExecutionMode::Sequenced)
    }

    /// Runner for tasks that expect single-thread affinity. Tasks run one at
    /// a time, in posting order.
    #[must_use]
    pub fn create_single_thread_task_runner(&self, traits: TaskTraits) -> TaskRunner {
        self.create_runner(traits, ExecutionMode::SingleThread)
    }

    fn create_runner(&self, traits: TaskTraits, mode: ExecutionMode) -> TaskRunner {
        TaskRunner {
            shared: Arc::clone(&self.shared),
            sequence: Sequence::with_mode(traits, mode),
        }
    }

    /// Change the priority of `sequence`, re-keying it if it is queued.
    pub fn update_sequence_priority(&self, sequence: &Arc<Sequence>, priority: TaskPriority) {
        self.shared.update_sequence_priority(sequence, priority);
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Block until every undelayed task posted so far was processed, or
    /// shutdown completed.
    pub fn flush_for_testing(&self) {
        self.shared.tracker.flush_for_testing();
    }

    /// Shut the tracker down, waiting for `BlockShutdown` work, then stop
    /// the workers. Calling it again is a no-op.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// [`shutdown`](Self::shutdown) on tokio's blocking pool.
    #[cfg(feature = "tokio-runtime")]
    pub async fn shutdown_async(&self) {
        let shared = Arc::clone(&self.shared);
        if let Err(e) = tokio::task::spawn_blocking(move || shared.shutdown()).await {
            warn!(error = %e, "Worker pool shutdown task failed");
        }
    }

    /// Wait for pending undelayed work, then stop the workers without
    /// shutting the tracker down.
    pub fn join(&self) {
        self.flush_for_testing();
        self.shared.stop_workers();
    }
}

impl PoolShared {
    fn update_sequence_priority(&self, sequence: &Arc<Sequence>, priority: TaskPriority) {
        let mut transaction = sequence.begin_transaction();
        transaction.update_priority(priority);
        self.queue.lock().update_sort_key(&transaction);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers are not joined here; `shutdown()` is the graceful path.
        if let Some(wake_tx) = self.shared.wake_tx.lock().take() {
            drop(wake_tx);
            debug!("WorkerPool dropped without explicit shutdown - workers will be detached");
        }
    }
}

/// Posts tasks onto one sequence of a [`WorkerPool`].
#[derive(Clone)]
pub struct TaskRunner {
    shared: Arc<PoolShared>,
    sequence: Arc<Sequence>,
}

impl TaskRunner {
    /// Post a task after the ones already posted through this runner.
    ///
    /// # Errors
    ///
    /// `ShutdownStarted` if the tracker refused it, `PoolShutdown` if the
    /// workers were stopped.
    pub fn post_task<F>(&self, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.post_task_to_sequence(&self.sequence, Task::new(f))
    }

    /// Token of the runner's sequence.
    #[must_use]
    pub fn sequence_token(&self) -> SequenceToken {
        self.sequence.token()
    }

    /// The runner's sequence.
    #[must_use]
    pub const fn sequence(&self) -> &Arc<Sequence> {
        &self.sequence
    }

    /// Whether the calling thread is running a task of this runner.
    #[must_use]
    pub fn runs_tasks_in_current_sequence(&self) -> bool {
        task_context::current_sequence_token() == Some(self.sequence.token())
    }

    /// Change the priority of the runner's sequence.
    pub fn update_priority(&self, priority: TaskPriority) {
        self.shared.update_sequence_priority(&self.sequence, priority);
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Spawn a worker thread.
fn spawn_worker(
    worker_id: usize,
    config: &WorkerPoolConfig,
    wake_rx: Receiver<()>,
    shared: Arc<PoolShared>,
) -> Result<JoinHandle<()>, SchedulerError> {
    thread::Builder::new()
        .name(format!("{}-{worker_id}", config.thread_name_prefix))
        .stack_size(config.thread_stack_size)
        .spawn(move || worker_loop(worker_id, &wake_rx, &shared))
        .map_err(|source| SchedulerError::WorkerSpawn { worker_id, source })
}

fn worker_loop(worker_id: usize, wake_rx: &Receiver<()>, shared: &PoolShared) {
    debug!(worker_id, "Worker thread started");
    let observer = shared.observer();

    // When the sender is dropped, recv() drains the remaining tokens and
    // then returns Err.
    while wake_rx.recv().is_ok() {
        let Some(sequence) = shared.queue.lock().pop() else {
            continue;
        };

        shared.counters.active_tasks.fetch_add(1, Ordering::Relaxed);
        let token = sequence.token();
        let next = shared
            .tracker
            .run_and_pop_next_task(sequence, Some(Arc::clone(&observer)));
        shared.counters.active_tasks.fetch_sub(1, Ordering::Relaxed);
        shared.counters.processed_tasks.fetch_add(1, Ordering::Relaxed);

        if let Some(sequence) = next {
            debug!(worker_id, sequence = %token, "Re-enqueueing sequence");
            shared.enqueue(sequence);
        }
    }

    debug!(worker_id, "Worker thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::core::task::TaskShutdownBehavior;
    use std::sync::atomic::AtomicUsize;

    fn pool(workers: usize, tracker: TrackerConfig) -> WorkerPool {
        WorkerPool::new(
            WorkerPoolConfig::new().with_worker_count(workers),
            Arc::new(TaskTracker::new(tracker)),
        )
        .unwrap()
    }

    #[test]
    fn test_worker_pool_basic() {
        let pool = pool(2, TrackerConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = Arc::clone(&count);
            pool.post_task(TaskTraits::new(), move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.flush_for_testing();
        assert_eq!(count.load(Ordering::SeqCst), 10);

        let stats = pool.stats();
        assert_eq!(stats.worker_count, 2);
        assert_eq!(stats.posted_tasks, 10);
        assert_eq!(stats.incomplete_undelayed_tasks, 0);
        pool.shutdown();
    }

    #[test]
    fn test_sequenced_runner_preserves_order() {
        let pool = pool(4, TrackerConfig::default());
        let runner = pool.create_sequenced_task_runner(TaskTraits::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let order = Arc::clone(&order);
            let current = runner.clone();
            runner
                .post_task(move || {
                    assert!(current.runs_tasks_in_current_sequence());
                    order.lock().push(i);
                })
                .unwrap();
        }
        pool.flush_for_testing();
        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
        assert!(!runner.runs_tasks_in_current_sequence());
        pool.shutdown();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = WorkerPool::new(
            WorkerPoolConfig::new().with_worker_count(0),
            Arc::new(TaskTracker::default()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }

    #[test]
    fn test_post_after_shutdown_is_rejected() {
        let pool = pool(1, TrackerConfig::default());
        pool.shutdown();
        let err = pool.post_task(TaskTraits::new(), || {}).unwrap_err();
        assert!(matches!(err, SchedulerError::PoolShutdown));
    }

    #[test]
    fn test_block_shutdown_tasks_finish_before_shutdown_returns() {
        let pool = pool(2, TrackerConfig::default());
        let done = Arc::new(AtomicUsize::new(0));
        let traits =
            TaskTraits::new().with_shutdown_behavior(TaskShutdownBehavior::BlockShutdown);
        for _ in 0..20 {
            let done = Arc::clone(&done);
            pool.post_task(traits, move || {
                thread::sleep(Duration::from_millis(1));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert!(pool.tracker().is_shutdown_complete());
    }

    #[test]
    fn test_sequence_promoted_after_workers_stop_is_discarded() {
        let pool = pool(1, TrackerConfig::default());
        pool.tracker().set_execution_fence_enabled(true);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_task = Arc::clone(&ran);
        pool.post_task(TaskTraits::new(), move || {
            ran_in_task.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(pool.stats().preempted_sequences, 1);

        pool.shared.stop_workers();
        pool.tracker().set_execution_fence_enabled(false);

        let stats = pool.stats();
        assert_eq!(stats.queued_sequences, 0);
        assert_eq!(stats.preempted_sequences, 0);
        assert_eq!(stats.incomplete_undelayed_tasks, 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        // Nothing is left for a flush or shutdown to wait on.
        pool.flush_for_testing();
        pool.tracker().shutdown();
        assert!(pool.tracker().is_shutdown_complete());
    }

    #[test]
    fn test_posts_racing_worker_stop_are_run_or_discarded() {
        let pool = Arc::new(pool(2, TrackerConfig::default()));
        let ran = Arc::new(AtomicUsize::new(0));
        let poster = {
            let pool = Arc::clone(&pool);
            let ran = Arc::clone(&ran);
            thread::spawn(move || {
                let mut accepted = 0;
                for _ in 0..500 {
                    let ran = Arc::clone(&ran);
                    let posted = pool.post_task(TaskTraits::new(), move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    });
                    if posted.is_ok() {
                        accepted += 1;
                    }
                }
                accepted
            })
        };
        thread::sleep(Duration::from_millis(1));
        pool.shared.stop_workers();
        let accepted = poster.join().unwrap();

        // Every accepted task either ran or was discarded; none is stranded
        // in the queue.
        pool.flush_for_testing();
        assert_eq!(pool.stats().queued_sequences, 0);
        assert!(ran.load(Ordering::SeqCst) <= accepted);
    }
}
