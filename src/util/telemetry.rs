//! Structured logging setup for the scheduler.
//!
//! Worker threads are named `{thread_name_prefix}-{index}` after
//! [`WorkerPoolConfig`](crate::config::WorkerPoolConfig), and the subscriber
//! installed here prints that name on every line, so events from different
//! workers can be told apart.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_DIRECTIVE: &str = "sequence_scheduler=info";

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_LOG_DIRECTIVE`]. Does nothing if a global subscriber is already
/// set, so embedding applications keep their own.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_thread_names(true)
        .try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE))
}
