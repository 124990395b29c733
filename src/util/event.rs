//! One-shot, manually reset event.
//!
//! Built on a `parking_lot` mutex/condvar pair. Once signaled the event stays
//! signaled; every current and future waiter returns immediately.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// An event that can be signaled once and waited on by many threads.
///
/// # Examples
///
/// ```
/// use sequence_scheduler::util::WaitableEvent;
/// use std::sync::Arc;
/// use std::thread;
///
/// let event = Arc::new(WaitableEvent::new());
/// let signaler = Arc::clone(&event);
///
/// thread::spawn(move || signaler.signal());
///
/// event.wait();
/// assert!(event.is_signaled());
/// ```
#[derive(Debug, Default)]
pub struct WaitableEvent {
    signaled: Mutex<bool>,
    cvar: Condvar,
}

impl WaitableEvent {
    /// Create an unsignaled event.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    /// Signal the event and wake every waiter. Signaling twice is a no-op.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cvar.notify_all();
    }

    /// Whether [`signal`](Self::signal) has been called.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until the event is signaled.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        self.cvar.wait_while(&mut signaled, |s| !*s);
    }

    /// Block until the event is signaled or `timeout` elapses.
    ///
    /// Returns `true` if the event was signaled.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            let _ = self
                .cvar
                .wait_while_for(&mut signaled, |s| !*s, timeout);
        }
        *signaled
    }
}
