//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use sequence_scheduler::core::{
    CanScheduleSequenceObserver, ExecutionMode, Sequence, SharedObserver, Task,
    TaskShutdownBehavior, TaskTracker, TaskTraits,
};

/// Long enough for a blocked thread to have made progress if it could.
pub const TINY_TIMEOUT: Duration = Duration::from_millis(30);

pub const ALL_BEHAVIORS: [TaskShutdownBehavior; 3] = [
    TaskShutdownBehavior::ContinueOnShutdown,
    TaskShutdownBehavior::SkipOnShutdown,
    TaskShutdownBehavior::BlockShutdown,
];

pub fn traits_for(behavior: TaskShutdownBehavior) -> TaskTraits {
    TaskTraits::new().with_shutdown_behavior(behavior)
}

/// Counts how many tasks created through it ran.
#[derive(Clone, Default)]
pub struct RunCounter(Arc<AtomicUsize>);

impl RunCounter {
    pub fn task(&self) -> Task {
        let count = Arc::clone(&self.0);
        Task::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    pub fn delayed_task(&self, delay: Duration) -> Task {
        let count = Arc::clone(&self.0);
        Task::delayed(
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
            delay,
        )
    }

    /// A bare closure, for APIs that take `FnOnce` rather than `Task`.
    pub fn closure(&self) -> impl FnOnce() + Send + 'static {
        let count = Arc::clone(&self.0);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Observer forwarding every promoted sequence on a channel.
pub struct ChannelObserver {
    tx: Sender<Arc<Sequence>>,
}

impl ChannelObserver {
    pub fn create() -> (Arc<Self>, Receiver<Arc<Sequence>>) {
        let (tx, rx) = unbounded();
        (Arc::new(Self { tx }), rx)
    }

    pub fn shared(self: &Arc<Self>) -> Option<SharedObserver> {
        Some(Arc::clone(self) as SharedObserver)
    }
}

impl CanScheduleSequenceObserver for ChannelObserver {
    fn on_can_schedule_sequence(&self, sequence: Arc<Sequence>) {
        let _ = self.tx.send(sequence);
    }
}

/// `will_post_task`, push onto a fresh sequence, `will_schedule_sequence`.
///
/// Returns `None` if the tracker refused the post. Panics if the sequence was
/// preempted; use [`post_and_schedule`] when preemption is expected.
pub fn post_and_queue(tracker: &TaskTracker, task: Task, traits: TaskTraits) -> Option<Arc<Sequence>> {
    let (sequence, scheduled) = post_and_schedule(tracker, task, traits, None)?;
    assert!(scheduled, "sequence unexpectedly preempted");
    Some(sequence)
}

/// Like [`post_and_queue`], reporting whether the sequence was admitted.
pub fn post_and_schedule(
    tracker: &TaskTracker,
    task: Task,
    traits: TaskTraits,
    observer: Option<SharedObserver>,
) -> Option<(Arc<Sequence>, bool)> {
    if !tracker.will_post_task(&task, traits.shutdown_behavior) {
        return None;
    }
    let sequence = Sequence::with_mode(traits, ExecutionMode::Parallel);
    let mut transaction = sequence.begin_transaction();
    assert!(transaction.push_task(task));
    let scheduled = tracker.will_schedule_sequence(&transaction, observer);
    drop(transaction);
    Some((sequence, scheduled))
}

/// Runs a blocking call on another thread and reports whether it returned.
pub struct AsyncCall {
    done: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl AsyncCall {
    pub fn spawn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let handle = thread::spawn(move || {
            f();
            flag.store(true, Ordering::SeqCst);
        });
        Self { done, handle }
    }

    pub fn complete_shutdown(tracker: &Arc<TaskTracker>) -> Self {
        let tracker = Arc::clone(tracker);
        Self::spawn(move || tracker.complete_shutdown())
    }

    pub fn flush(tracker: &Arc<TaskTracker>) -> Self {
        let tracker = Arc::clone(tracker);
        Self::spawn(move || tracker.flush_for_testing())
    }

    /// Asserts the call is still blocked after a short wait.
    pub fn assert_in_progress(&self) {
        thread::sleep(TINY_TIMEOUT);
        assert!(!self.done.load(Ordering::SeqCst), "call returned too early");
    }

    pub fn wait(self) {
        self.handle.join().unwrap();
        assert!(self.done.load(Ordering::SeqCst));
    }
}
