//! Heap of sequences ordered by [`SequenceSortKey`].
//!
//! The heap is an arena (`Vec`) of entries. Each entry's index is written back
//! into its sequence as a heap handle on every move, which makes removal and
//! re-keying of an arbitrary sequence O(log n) without a side lookup table.
//!
//! The queue itself isn't synchronized; owners wrap it in a mutex. Callers
//! must compute sort keys (which locks the sequence) before taking that mutex.

use std::sync::Arc;

use crate::core::sequence::{Sequence, SequenceSortKey, SequenceTransaction};
use crate::core::task::TaskPriority;

struct HeapEntry {
    sequence: Arc<Sequence>,
    sort_key: SequenceSortKey,
}

/// Max-heap of sequences: the top entry is the one that should run next.
#[derive(Default)]
pub struct PriorityQueue {
    heap: Vec<HeapEntry>,
    num_sequences_per_priority: [usize; TaskPriority::COUNT],
}

impl PriorityQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `sequence` with `sort_key`.
    ///
    /// # Panics
    ///
    /// If `sequence` is already in a priority queue.
    pub fn push(&mut self, sequence: Arc<Sequence>, sort_key: SequenceSortKey) {
        assert!(
            sequence.heap_handle().is_none(),
            "{} pushed twice into a priority queue",
            sequence.token()
        );
        self.num_sequences_per_priority[sort_key.priority().index()] += 1;
        let index = self.heap.len();
        sequence.set_heap_handle(index);
        self.heap.push(HeapEntry { sequence, sort_key });
        self.sift_up(index);
    }

    /// Sort key of the top sequence.
    ///
    /// # Panics
    ///
    /// If the queue is empty.
    #[must_use]
    pub fn peek_sort_key(&self) -> SequenceSortKey {
        self.heap
            .first()
            .map(|entry| entry.sort_key)
            .unwrap_or_else(|| panic!("peek_sort_key() on empty priority queue"))
    }

    /// Remove and return the top sequence.
    pub fn pop(&mut self) -> Option<Arc<Sequence>> {
        if self.heap.is_empty() {
            return None;
        }
        Some(self.remove_at(0).sequence)
    }

    /// Remove `sequence` if present.
    ///
    /// Returns `false` if it isn't in this queue, e.g. because a worker popped
    /// it first.
    pub fn remove(&mut self, sequence: &Arc<Sequence>) -> bool {
        let Some(index) = self.index_of(sequence) else {
            return false;
        };
        self.remove_at(index);
        true
    }

    /// Recompute the key of the transaction's sequence after its priority
    /// changed. No-op if the sequence isn't in this queue.
    pub fn update_sort_key(&mut self, transaction: &SequenceTransaction<'_>) {
        let sequence = transaction.sequence();
        let Some(index) = self.index_of(&sequence) else {
            return;
        };
        if transaction.is_empty() {
            self.remove_at(index);
            return;
        }
        let new_key = transaction.sort_key();
        let old_key = std::mem::replace(&mut self.heap[index].sort_key, new_key);
        self.num_sequences_per_priority[old_key.priority().index()] -= 1;
        self.num_sequences_per_priority[new_key.priority().index()] += 1;
        self.sift_up(index);
        if let Some(index) = sequence.heap_handle() {
            self.sift_down(index);
        }
    }

    /// Number of queued sequences with `priority`.
    #[must_use]
    pub const fn num_sequences_with_priority(&self, priority: TaskPriority) -> usize {
        self.num_sequences_per_priority[priority.index()]
    }

    /// Number of queued sequences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no sequence is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove every sequence, clearing their heap handles.
    pub fn clear(&mut self) -> Vec<Arc<Sequence>> {
        self.num_sequences_per_priority = [0; TaskPriority::COUNT];
        self.heap
            .drain(..)
            .map(|entry| {
                entry.sequence.clear_heap_handle();
                entry.sequence
            })
            .collect()
    }

    fn index_of(&self, sequence: &Arc<Sequence>) -> Option<usize> {
        let index = sequence.heap_handle()?;
        // A handle belonging to another queue must not be trusted.
        self.heap
            .get(index)
            .filter(|entry| Arc::ptr_eq(&entry.sequence, sequence))
            .map(|_| index)
    }

    fn remove_at(&mut self, index: usize) -> HeapEntry {
        let last = self.heap.len() - 1;
        self.swap(index, last);
        let Some(entry) = self.heap.pop() else {
            unreachable!("remove_at() on empty heap");
        };
        entry.sequence.clear_heap_handle();
        self.num_sequences_per_priority[entry.sort_key.priority().index()] -= 1;
        if index < self.heap.len() {
            let parent = index.saturating_sub(1) / 2;
            if index > 0 && self.heap[index].sort_key > self.heap[parent].sort_key {
                self.sift_up(index);
            } else {
                self.sift_down(index);
            }
        }
        entry
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.heap[a].sequence.set_heap_handle(a);
        self.heap[b].sequence.set_heap_handle(b);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[index].sort_key <= self.heap[parent].sort_key {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut largest = index;
            if left < len && self.heap[left].sort_key > self.heap[largest].sort_key {
                largest = left;
            }
            if right < len && self.heap[right].sort_key > self.heap[largest].sort_key {
                largest = right;
            }
            if largest == index {
                break;
            }
            self.swap(index, largest);
            index = largest;
        }
    }
}

impl Drop for PriorityQueue {
    fn drop(&mut self) {
        for entry in &self.heap {
            entry.sequence.clear_heap_handle();
        }
    }
}
