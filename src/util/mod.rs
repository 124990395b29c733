//! Shared utilities.

pub mod clock;
pub mod event;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use event::WaitableEvent;
pub use telemetry::{init_tracing, DEFAULT_LOG_DIRECTIVE};
