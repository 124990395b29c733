//! Lock-free shutdown bookkeeping.
//!
//! A single `AtomicUsize` packs two facts: bit 0 says whether shutdown started,
//! and the remaining bits count the items that block shutdown. Because both
//! live in one word, every transition observes a consistent pair, and exactly
//! one thread sees the "started with the last blocking item gone" edge.

use std::sync::atomic::{AtomicUsize, Ordering};

const SHUTDOWN_STARTED: usize = 1;
const ITEM: usize = 1 << 1;

/// Packed "shutdown started" flag and blocking-item counter.
#[derive(Debug, Default)]
pub struct AtomicShutdownState {
    bits: AtomicUsize,
}

impl AtomicShutdownState {
    /// Fresh state: not started, nothing blocking.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bits: AtomicUsize::new(0),
        }
    }

    /// Set the started flag.
    ///
    /// Returns `true` if no item blocks shutdown, i.e. it may complete now.
    pub fn start_shutdown(&self) -> bool {
        let prev = self.bits.fetch_or(SHUTDOWN_STARTED, Ordering::SeqCst);
        prev & !SHUTDOWN_STARTED == 0
    }

    /// Count one more blocking item.
    ///
    /// Returns `true` if shutdown had already started.
    pub fn increment_num_items_blocking_shutdown(&self) -> bool {
        let prev = self.bits.fetch_add(ITEM, Ordering::SeqCst);
        prev & SHUTDOWN_STARTED != 0
    }

    /// Count one fewer blocking item.
    ///
    /// Returns `true` if shutdown started and this was the last item, in which
    /// case the caller must signal shutdown completion.
    ///
    /// # Panics
    ///
    /// If no item was counted.
    pub fn decrement_num_items_blocking_shutdown(&self) -> bool {
        let prev = self.bits.fetch_sub(ITEM, Ordering::SeqCst);
        assert!(
            prev >= ITEM,
            "decrement_num_items_blocking_shutdown() without a matching increment"
        );
        prev == SHUTDOWN_STARTED | ITEM
    }

    /// Whether shutdown started.
    #[must_use]
    pub fn has_shutdown_started(&self) -> bool {
        self.bits.load(Ordering::SeqCst) & SHUTDOWN_STARTED != 0
    }

    /// Whether shutdown started and items still block it.
    #[must_use]
    pub fn are_items_blocking_shutdown(&self) -> bool {
        let bits = self.bits.load(Ordering::SeqCst);
        bits & SHUTDOWN_STARTED != 0 && bits >= ITEM
    }

    /// Number of items blocking shutdown.
    #[must_use]
    pub fn num_items_blocking_shutdown(&self) -> usize {
        self.bits.load(Ordering::SeqCst) >> 1
    }
}
