//! Sequences: ordered run-queues of tasks sharing one execution context.
//!
//! A [`Sequence`] is shared (`Arc`) between the producers posting to it and the
//! scheduler structures holding it while it waits for a worker. All access to
//! its queue goes through a [`SequenceTransaction`], which holds the sequence
//! lock for the duration of a few O(1) operations and never across task
//! execution.
//!
//! Consumer discipline: a worker calls [`SequenceTransaction::take_task`], runs
//! the task *without* holding the transaction, then calls
//! [`SequenceTransaction::pop`]. Between the two the front slot stays occupied,
//! so the sequence keeps reporting a sort key while its task runs.

use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};

use crate::core::task::{ExecutionMode, Task, TaskPriority, TaskShutdownBehavior, TaskTraits};
use crate::util::clock::{system_clock, Clock};

static NEXT_SEQUENCE_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identifies the execution context of a sequence. Unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceToken(u64);

impl SequenceToken {
    fn next() -> Self {
        Self(NEXT_SEQUENCE_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw token value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq-{}", self.0)
    }
}

/// Ordering key of a sequence in the scheduler.
///
/// A key compares *greater* when its sequence should run first: higher
/// priority wins, and within one priority the earlier sequenced time wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSortKey {
    priority: TaskPriority,
    next_task_sequenced_time: Instant,
}

impl SequenceSortKey {
    /// Build a key.
    #[must_use]
    pub const fn new(priority: TaskPriority, next_task_sequenced_time: Instant) -> Self {
        Self {
            priority,
            next_task_sequenced_time,
        }
    }

    /// Priority of the sequence.
    #[must_use]
    pub const fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// When the next task of the sequence was pushed.
    #[must_use]
    pub const fn next_task_sequenced_time(&self) -> Instant {
        self.next_task_sequenced_time
    }
}

impl Ord for SequenceSortKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.next_task_sequenced_time.cmp(&self.next_task_sequenced_time))
    }
}

impl PartialOrd for SequenceSortKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

pub(crate) const INVALID_HEAP_HANDLE: usize = usize::MAX;
const NO_TIER: usize = usize::MAX;

struct Slot {
    sequenced_time: Instant,
    /// `None` once a worker has taken the task.
    task: Option<Task>,
}

struct SequenceInner {
    traits: TaskTraits,
    queue: VecDeque<Slot>,
}

/// An ordered run-queue of tasks.
pub struct Sequence {
    token: SequenceToken,
    execution_mode: ExecutionMode,
    clock: Arc<dyn Clock>,
    inner: Mutex<SequenceInner>,
    /// Index in the owning `PriorityQueue`; only written under that queue's lock.
    heap_handle: AtomicUsize,
    /// Tier holding the slot the sequence was admitted with.
    admitted_tier: AtomicUsize,
}

impl Sequence {
    /// Create an empty parallel sequence.
    #[must_use]
    pub fn new(traits: TaskTraits) -> Arc<Self> {
        Self::with_mode(traits, ExecutionMode::Parallel)
    }

    /// Create an empty sequence for the given execution mode.
    #[must_use]
    pub fn with_mode(traits: TaskTraits, execution_mode: ExecutionMode) -> Arc<Self> {
        Self::with_clock(traits, execution_mode, system_clock())
    }

    /// Create an empty sequence stamping tasks with `clock`.
    #[must_use]
    pub fn with_clock(
        traits: TaskTraits,
        execution_mode: ExecutionMode,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            token: SequenceToken::next(),
            execution_mode,
            clock,
            inner: Mutex::new(SequenceInner {
                traits,
                queue: VecDeque::new(),
            }),
            heap_handle: AtomicUsize::new(INVALID_HEAP_HANDLE),
            admitted_tier: AtomicUsize::new(NO_TIER),
        })
    }

    /// Token identifying this sequence.
    #[must_use]
    pub const fn token(&self) -> SequenceToken {
        self.token
    }

    /// Execution mode this sequence was created for.
    #[must_use]
    pub const fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    /// Lock the sequence for a batch of queue operations.
    pub fn begin_transaction(self: &Arc<Self>) -> SequenceTransaction<'_> {
        SequenceTransaction {
            sequence: self,
            inner: self.inner.lock(),
        }
    }

    /// Push a task; see [`SequenceTransaction::push_task`].
    pub fn push_task(self: &Arc<Self>, task: Task) -> bool {
        self.begin_transaction().push_task(task)
    }

    /// Current traits.
    #[must_use]
    pub fn traits(&self) -> TaskTraits {
        self.inner.lock().traits
    }

    /// Shutdown behavior of the sequence's tasks.
    #[must_use]
    pub fn shutdown_behavior(&self) -> TaskShutdownBehavior {
        self.inner.lock().traits.shutdown_behavior
    }

    pub(crate) fn heap_handle(&self) -> Option<usize> {
        match self.heap_handle.load(Ordering::Relaxed) {
            INVALID_HEAP_HANDLE => None,
            index => Some(index),
        }
    }

    pub(crate) fn set_heap_handle(&self, index: usize) {
        self.heap_handle.store(index, Ordering::Relaxed);
    }

    pub(crate) fn clear_heap_handle(&self) {
        self.heap_handle.store(INVALID_HEAP_HANDLE, Ordering::Relaxed);
    }

    /// Tier whose slot the sequence currently holds, if any. Differs from the
    /// traits' priority when the priority changed after admission.
    pub(crate) fn admitted_priority(&self) -> Option<TaskPriority> {
        TaskPriority::ALL
            .get(self.admitted_tier.load(Ordering::Acquire))
            .copied()
    }

    pub(crate) fn set_admitted_priority(&self, priority: Option<TaskPriority>) {
        let tier = priority.map_or(NO_TIER, TaskPriority::index);
        self.admitted_tier.store(tier, Ordering::Release);
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("token", &self.token)
            .field("execution_mode", &self.execution_mode)
            .field("heap_handle", &self.heap_handle())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a sequence's queue and traits.
pub struct SequenceTransaction<'a> {
    sequence: &'a Arc<Sequence>,
    inner: MutexGuard<'a, SequenceInner>,
}

impl SequenceTransaction<'_> {
    /// The sequence this transaction locks.
    #[must_use]
    pub fn sequence(&self) -> Arc<Sequence> {
        Arc::clone(self.sequence)
    }

    /// Append `task` and stamp its sequenced time.
    ///
    /// Returns `true` if the sequence was empty before the push, in which case
    /// the caller is responsible for scheduling it.
    pub fn push_task(&mut self, mut task: Task) -> bool {
        let was_empty = self.inner.queue.is_empty();
        let sequenced_time = self.sequence.clock.now();
        task.sequenced_time = Some(sequenced_time);
        self.inner.queue.push_back(Slot {
            sequenced_time,
            task: Some(task),
        });
        was_empty
    }

    /// Take the front task out of the sequence. The slot stays occupied until
    /// [`pop`](Self::pop).
    ///
    /// # Panics
    ///
    /// If the sequence is empty or its front task was already taken.
    pub fn take_task(&mut self) -> Task {
        let front = self
            .inner
            .queue
            .front_mut()
            .unwrap_or_else(|| panic!("take_task() on empty {}", self.sequence.token));
        front
            .task
            .take()
            .unwrap_or_else(|| panic!("take_task() on {} while its front task is running", self.sequence.token))
    }

    /// Remove the front slot, whose task must have been taken.
    ///
    /// Returns `true` if the sequence is empty afterwards.
    ///
    /// # Panics
    ///
    /// If the sequence is empty or its front task wasn't taken.
    pub fn pop(&mut self) -> bool {
        let token = self.sequence.token;
        match self.inner.queue.front() {
            None => panic!("pop() on empty {token}"),
            Some(slot) if slot.task.is_some() => {
                panic!("pop() on {token} before its front task was taken")
            }
            Some(_) => {}
        }
        self.inner.queue.pop_front();
        self.inner.queue.is_empty()
    }

    /// Remove every slot whose task hasn't been taken and return those tasks
    /// in order. A slot whose task is running stays.
    pub(crate) fn take_untaken_tasks(&mut self) -> Vec<Task> {
        let mut tasks = Vec::new();
        self.inner.queue.retain_mut(|slot| match slot.task.take() {
            Some(task) => {
                tasks.push(task);
                false
            }
            None => true,
        });
        tasks
    }

    /// Sort key derived from the current priority and the next task to run.
    ///
    /// # Panics
    ///
    /// If the sequence is empty.
    #[must_use]
    pub fn sort_key(&self) -> SequenceSortKey {
        let queue = &self.inner.queue;
        let slot = queue
            .iter()
            .find(|slot| slot.task.is_some())
            .or_else(|| queue.front())
            .unwrap_or_else(|| panic!("sort_key() on empty {}", self.sequence.token));
        SequenceSortKey::new(self.inner.traits.priority, slot.sequenced_time)
    }

    /// Current traits.
    #[must_use]
    pub fn traits(&self) -> TaskTraits {
        self.inner.traits
    }

    /// Change the priority. The caller must re-key any priority queue holding
    /// the sequence.
    pub fn update_priority(&mut self, priority: TaskPriority) {
        self.inner.traits.priority = priority;
    }

    /// Number of slots, including one whose task is running.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Whether the sequence has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    fn manual_sequence(clock: &Arc<ManualClock>) -> Arc<Sequence> {
        Sequence::with_clock(
            TaskTraits::default(),
            ExecutionMode::Sequenced,
            Arc::clone(clock) as Arc<dyn Clock>,
        )
    }

    #[test]
    fn test_push_reports_empty_transition() {
        let sequence = Sequence::new(TaskTraits::default());
        let mut txn = sequence.begin_transaction();
        assert!(txn.push_task(Task::new(|| {})));
        assert!(!txn.push_task(Task::new(|| {})));
        assert_eq!(txn.len(), 2);
    }

    #[test]
    fn test_take_and_pop_in_fifo_order() {
        let sequence = Sequence::new(TaskTraits::default());
        let ids: Vec<_> = (0..3)
            .map(|_| {
                let task = Task::new(|| {});
                let id = task.id();
                sequence.push_task(task);
                id
            })
            .collect();

        for (i, expected) in ids.iter().enumerate() {
            let mut txn = sequence.begin_transaction();
            assert_eq!(txn.take_task().id(), *expected);
            assert_eq!(txn.pop(), i == ids.len() - 1);
        }
    }

    #[test]
    fn test_sort_key_tracks_next_task() {
        let clock = Arc::new(ManualClock::new());
        let sequence = manual_sequence(&clock);
        let t0 = clock.now();
        sequence.push_task(Task::new(|| {}));
        clock.advance(Duration::from_millis(3));
        sequence.push_task(Task::new(|| {}));

        let mut txn = sequence.begin_transaction();
        assert_eq!(txn.sort_key().next_task_sequenced_time(), t0);

        let _running = txn.take_task();
        assert_eq!(
            txn.sort_key().next_task_sequenced_time(),
            t0 + Duration::from_millis(3)
        );

        txn.pop();
        let _ = txn.take_task();
        // Only the in-flight slot remains; its time is reported.
        assert_eq!(
            txn.sort_key().next_task_sequenced_time(),
            t0 + Duration::from_millis(3)
        );
        assert!(txn.pop());
    }

    #[test]
    fn test_update_priority_changes_sort_key() {
        let sequence = Sequence::new(TaskTraits::default());
        sequence.push_task(Task::new(|| {}));
        let mut txn = sequence.begin_transaction();
        assert_eq!(txn.sort_key().priority(), TaskPriority::UserVisible);
        txn.update_priority(TaskPriority::UserBlocking);
        assert_eq!(txn.sort_key().priority(), TaskPriority::UserBlocking);
        assert_eq!(txn.traits().priority, TaskPriority::UserBlocking);
    }

    #[test]
    fn test_sort_key_ordering() {
        let now = Instant::now();
        let later = now + Duration::from_millis(1);
        let high = SequenceSortKey::new(TaskPriority::UserBlocking, later);
        let low = SequenceSortKey::new(TaskPriority::BestEffort, now);
        assert!(high > low);

        let early = SequenceSortKey::new(TaskPriority::UserVisible, now);
        let late = SequenceSortKey::new(TaskPriority::UserVisible, later);
        assert!(early > late);
    }

    #[test]
    #[should_panic(expected = "take_task() on empty")]
    fn test_take_from_empty_sequence_panics() {
        let sequence = Sequence::new(TaskTraits::default());
        let _ = sequence.begin_transaction().take_task();
    }

    #[test]
    #[should_panic(expected = "while its front task is running")]
    fn test_double_take_panics() {
        let sequence = Sequence::new(TaskTraits::default());
        sequence.push_task(Task::new(|| {}));
        sequence.push_task(Task::new(|| {}));
        let mut txn = sequence.begin_transaction();
        let _ = txn.take_task();
        let _ = txn.take_task();
    }

    #[test]
    #[should_panic(expected = "before its front task was taken")]
    fn test_pop_untaken_slot_panics() {
        let sequence = Sequence::new(TaskTraits::default());
        sequence.push_task(Task::new(|| {}));
        sequence.begin_transaction().pop();
    }

    #[test]
    fn test_concurrent_push_single_consumer() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 200;

        let sequence = Sequence::new(TaskTraits::default());
        let in_use = Arc::new(AtomicBool::new(false));
        let mut producers = vec![];

        for _ in 0..PRODUCERS {
            let sequence = Arc::clone(&sequence);
            producers.push(thread::spawn(move || {
                for _ in 0..PER_PRODUCER {
                    sequence.push_task(Task::new(|| {}));
                }
            }));
        }
        for handle in producers {
            handle.join().unwrap();
        }

        let mut consumed = 0;
        loop {
            let task = {
                let mut txn = sequence.begin_transaction();
                if txn.is_empty() {
                    break;
                }
                txn.take_task()
            };
            assert!(!in_use.swap(true, Ordering::AcqRel));
            (task.into_body())();
            in_use.store(false, Ordering::Release);
            sequence.begin_transaction().pop();
            consumed += 1;
        }
        assert_eq!(consumed, PRODUCERS * PER_PRODUCER);
    }
}
