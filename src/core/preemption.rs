//! Per-priority concurrency limiter.
//!
//! Each [`PreemptionState`] caps how many sequences of one priority tier may be
//! scheduled on workers at once. A sequence refused admission is parked in a
//! min-heap keyed by the sequenced time of its next task, and handed back later
//! through its [`CanScheduleSequenceObserver`]. Observers always run after the
//! tier lock is released, so they may call back into the scheduler.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::sequence::{Sequence, SequenceSortKey};
use crate::core::task::TaskPriority;

/// Receives sequences that were preempted and may now be scheduled.
///
/// Implemented by worker pools. The callback is invoked exactly once per
/// promotion and never while a limiter lock is held.
pub trait CanScheduleSequenceObserver: Send + Sync {
    /// `sequence` was admitted and should be handed to a worker.
    fn on_can_schedule_sequence(&self, sequence: Arc<Sequence>);
}

/// Shared observer handle.
pub type SharedObserver = Arc<dyn CanScheduleSequenceObserver>;

struct PreemptedSequence {
    sequence: Arc<Sequence>,
    next_task_sequenced_time: Instant,
    insertion_order: u64,
    observer: Option<SharedObserver>,
}

impl PreemptedSequence {
    fn notify(self) {
        let token = self.sequence.token();
        let Some(observer) = self.observer else {
            panic!("preempted {token} became schedulable but no observer was provided");
        };
        debug!(sequence = %token, "Promoting preempted sequence");
        observer.on_can_schedule_sequence(self.sequence);
    }
}

// BinaryHeap is a max-heap: the earliest time (then the earliest insertion)
// compares greatest.
impl Ord for PreemptedSequence {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .next_task_sequenced_time
            .cmp(&self.next_task_sequenced_time)
            .then_with(|| other.insertion_order.cmp(&self.insertion_order))
    }
}

impl PartialOrd for PreemptedSequence {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PreemptedSequence {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for PreemptedSequence {}

struct TierState {
    max_scheduled: usize,
    current_scheduled: usize,
    preempted: BinaryHeap<PreemptedSequence>,
    next_insertion_order: u64,
}

impl TierState {
    fn has_capacity(&self) -> bool {
        self.current_scheduled < self.max_scheduled
    }

    fn park(
        &mut self,
        sequence: Arc<Sequence>,
        next_task_sequenced_time: Instant,
        observer: Option<SharedObserver>,
    ) {
        let insertion_order = self.next_insertion_order;
        self.next_insertion_order += 1;
        sequence.set_admitted_priority(None);
        self.preempted.push(PreemptedSequence {
            sequence,
            next_task_sequenced_time,
            insertion_order,
            observer,
        });
    }

    /// Admit as many parked sequences as the cap allows.
    fn drain_admissible(&mut self, priority: TaskPriority) -> Vec<PreemptedSequence> {
        let mut ready = Vec::new();
        while self.has_capacity() {
            let Some(entry) = self.preempted.pop() else {
                break;
            };
            self.current_scheduled += 1;
            entry.sequence.set_admitted_priority(Some(priority));
            ready.push(entry);
        }
        ready
    }
}

/// Admission state of one priority tier.
pub struct PreemptionState {
    priority: TaskPriority,
    state: Mutex<TierState>,
}

impl PreemptionState {
    /// Create a tier allowing `max_scheduled` concurrently scheduled sequences.
    #[must_use]
    pub fn new(priority: TaskPriority, max_scheduled: usize) -> Self {
        Self {
            priority,
            state: Mutex::new(TierState {
                max_scheduled,
                current_scheduled: 0,
                preempted: BinaryHeap::new(),
                next_insertion_order: 0,
            }),
        }
    }

    /// Tier this state limits.
    #[must_use]
    pub const fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Try to take a slot for `sequence`.
    ///
    /// On refusal the sequence is parked and `observer` is told when it can
    /// run. Returns `true` if the caller may schedule it right away.
    pub fn try_admit(
        &self,
        sequence: &Arc<Sequence>,
        sort_key: SequenceSortKey,
        observer: Option<SharedObserver>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.has_capacity() {
            state.current_scheduled += 1;
            sequence.set_admitted_priority(Some(self.priority));
            return true;
        }
        debug!(
            sequence = %sequence.token(),
            priority = %self.priority,
            max_scheduled = state.max_scheduled,
            "Sequence preempted"
        );
        state.park(
            Arc::clone(sequence),
            sort_key.next_task_sequenced_time(),
            observer,
        );
        false
    }

    /// Give back the slot used to run one task.
    ///
    /// `just_ran` is the sequence that ran, with its new sort key, or `None`
    /// if it became empty. It is returned for immediate continuation when
    /// the tier has room and its next task is strictly earlier than every
    /// parked one. Otherwise it is parked and the earliest parked sequence is
    /// promoted through its observer.
    pub fn release_and_maybe_promote(
        &self,
        just_ran: Option<(Arc<Sequence>, SequenceSortKey)>,
        observer: Option<SharedObserver>,
    ) -> Option<Arc<Sequence>> {
        let promoted = {
            let mut state = self.state.lock();
            assert!(
                state.current_scheduled > 0,
                "release_and_maybe_promote() on {} tier with nothing scheduled",
                self.priority
            );
            state.current_scheduled -= 1;

            if let Some((sequence, sort_key)) = just_ran {
                let next_time = sort_key.next_task_sequenced_time();
                let runs_first = state
                    .preempted
                    .peek()
                    .is_none_or(|top| top.next_task_sequenced_time > next_time);
                if state.has_capacity() && runs_first {
                    state.current_scheduled += 1;
                    return Some(sequence);
                }
                state.park(sequence, next_time, observer);
            }

            if state.has_capacity() {
                let entry = state.preempted.pop();
                if let Some(entry) = &entry {
                    state.current_scheduled += 1;
                    entry.sequence.set_admitted_priority(Some(self.priority));
                }
                entry
            } else {
                None
            }
        };

        if let Some(entry) = promoted {
            entry.notify();
        }
        None
    }

    /// Change the cap. Raising it promotes as many parked sequences as fit.
    pub fn set_max_scheduled(&self, max_scheduled: usize) {
        let ready = {
            let mut state = self.state.lock();
            state.max_scheduled = max_scheduled;
            state.drain_admissible(self.priority)
        };
        for entry in ready {
            entry.notify();
        }
    }

    /// Current cap.
    #[must_use]
    pub fn max_scheduled(&self) -> usize {
        self.state.lock().max_scheduled
    }

    /// Sequences currently holding a slot.
    #[must_use]
    pub fn current_scheduled(&self) -> usize {
        self.state.lock().current_scheduled
    }

    /// Sequences parked waiting for a slot.
    #[must_use]
    pub fn preempted_count(&self) -> usize {
        self.state.lock().preempted.len()
    }
}

impl fmt::Debug for PreemptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PreemptionState")
            .field("priority", &self.priority)
            .field("max_scheduled", &state.max_scheduled)
            .field("current_scheduled", &state.current_scheduled)
            .field("preempted", &state.preempted.len())
            .finish()
    }
}
