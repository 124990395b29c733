//! Builders to construct scheduler components from configuration.

#[cfg(not(target_arch = "wasm32"))]
mod scheduler_builder;

#[cfg(not(target_arch = "wasm32"))]
pub use scheduler_builder::{build_scheduler, Scheduler};
