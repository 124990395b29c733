//! Configuration models for the tracker and the worker pool.
//!
//! Configuration can be built in code, parsed from JSON, or read from
//! `SCHEDULER_*` environment variables (a `.env` file is honored).

pub mod pool;
pub mod tracker;

use std::env;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::core::AppResult;

pub use pool::WorkerPoolConfig;
pub use tracker::TrackerConfig;

/// Environment variable overriding [`WorkerPoolConfig::worker_count`].
pub const ENV_WORKER_COUNT: &str = "SCHEDULER_WORKER_COUNT";
/// Environment variable overriding [`WorkerPoolConfig::thread_stack_size`].
pub const ENV_THREAD_STACK_SIZE: &str = "SCHEDULER_THREAD_STACK_SIZE";
/// Environment variable overriding [`WorkerPoolConfig::thread_name_prefix`].
pub const ENV_THREAD_NAME_PREFIX: &str = "SCHEDULER_THREAD_NAME_PREFIX";
/// Environment variable overriding [`TrackerConfig::max_best_effort_sequences`].
pub const ENV_MAX_BEST_EFFORT_SEQUENCES: &str = "SCHEDULER_MAX_BEST_EFFORT_SEQUENCES";
/// Environment variable overriding
/// [`TrackerConfig::max_block_shutdown_tasks_posted_during_shutdown`].
pub const ENV_MAX_BLOCK_SHUTDOWN_TASKS: &str =
    "SCHEDULER_MAX_BLOCK_SHUTDOWN_TASKS_POSTED_DURING_SHUTDOWN";

/// Root scheduler configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Task tracker limits.
    pub tracker: TrackerConfig,
    /// Worker thread settings.
    pub pool: WorkerPoolConfig,
}

impl SchedulerConfig {
    /// Validate the tracker and pool sections.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        self.tracker
            .validate()
            .map_err(|e| format!("tracker invalid: {e}"))?;
        self.pool.validate().map_err(|e| format!("pool invalid: {e}"))?;
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from defaults overridden by `SCHEDULER_*`
    /// environment variables. A `.env` file in the working directory is
    /// loaded first if present.
    ///
    /// # Errors
    ///
    /// Fails if a variable doesn't parse or the result doesn't validate.
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Fails if a variable doesn't parse or the result doesn't validate.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(v) = var(ENV_WORKER_COUNT) {
            cfg.pool.worker_count = parse_var(ENV_WORKER_COUNT, &v)?;
        }
        if let Some(v) = var(ENV_THREAD_STACK_SIZE) {
            cfg.pool.thread_stack_size = parse_var(ENV_THREAD_STACK_SIZE, &v)?;
        }
        if let Some(v) = var(ENV_THREAD_NAME_PREFIX) {
            cfg.pool.thread_name_prefix = v;
        }
        if let Some(v) = var(ENV_MAX_BEST_EFFORT_SEQUENCES) {
            cfg.tracker.max_best_effort_sequences = parse_var(ENV_MAX_BEST_EFFORT_SEQUENCES, &v)?;
        }
        if let Some(v) = var(ENV_MAX_BLOCK_SHUTDOWN_TASKS) {
            cfg.tracker.max_block_shutdown_tasks_posted_during_shutdown =
                parse_var(ENV_MAX_BLOCK_SHUTDOWN_TASKS, &v)?;
        }

        cfg.validate().map_err(|e| anyhow!("config invalid: {e}"))?;
        Ok(cfg)
    }
}

fn parse_var<T>(key: &str, value: &str) -> AppResult<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key}={value:?} is not a valid number"))
}
