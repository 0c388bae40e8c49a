//! Engine configuration read from `CASEGEN_*` environment variables.
//!
//! Every setting has a default. A value that does not parse is logged and the
//! default is used instead; configuration never aborts startup.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::executor::{BackgroundExecutor, ExecutorConfig};
use super::manager::TaskManager;
use super::retry::{ResilientCaller, RetryPolicy};
use super::store::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, TaskStore};

pub const WORKER_NAME_ENV: &str = "CASEGEN_WORKER_NAME";
pub const RETRY_COUNT_ENV: &str = "CASEGEN_AI_RETRY_COUNT";
pub const RETRY_DELAY_MS_ENV: &str = "CASEGEN_AI_RETRY_DELAY_MS";
pub const RETRY_BACKOFF_ENV: &str = "CASEGEN_AI_RETRY_BACKOFF";
pub const CALL_TIMEOUT_SECS_ENV: &str = "CASEGEN_AI_CALL_TIMEOUT_SECS";
pub const PAGE_SIZE_ENV: &str = "CASEGEN_PAGE_SIZE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Background worker thread name
    pub worker_name: String,
    /// Policy for calls to the AI backends
    pub retry: RetryPolicy,
    /// Page size for listings that do not ask for one (1..=100)
    pub default_page_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_name: ExecutorConfig::default().name,
            retry: RetryPolicy::default(),
            default_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the process environment in
    /// production, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(name) = lookup(WORKER_NAME_ENV) {
            let name = name.trim();
            if name.is_empty() {
                warn!(key = WORKER_NAME_ENV, "empty worker name; using default");
            } else {
                config.worker_name = name.to_string();
            }
        }

        if let Some(attempts) = parsed::<u32>(&lookup, RETRY_COUNT_ENV) {
            if attempts == 0 {
                warn!(key = RETRY_COUNT_ENV, "retry count must be at least 1; using default");
            } else {
                config.retry.max_attempts = attempts;
            }
        }

        if let Some(ms) = parsed::<u64>(&lookup, RETRY_DELAY_MS_ENV) {
            config.retry.initial_delay = Duration::from_millis(ms);
        }

        if let Some(backoff) = parsed::<f64>(&lookup, RETRY_BACKOFF_ENV) {
            if backoff.is_finite() && backoff >= 1.0 {
                config.retry.backoff_multiplier = backoff;
            } else {
                warn!(key = RETRY_BACKOFF_ENV, backoff, "backoff must be >= 1.0; using default");
            }
        }

        if let Some(secs) = parsed::<u64>(&lookup, CALL_TIMEOUT_SECS_ENV) {
            config.retry.call_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(size) = parsed::<u32>(&lookup, PAGE_SIZE_ENV) {
            let clamped = size.clamp(1, MAX_PAGE_SIZE);
            if clamped != size {
                warn!(key = PAGE_SIZE_ENV, requested = size, used = clamped, "page size out of range");
            }
            config.default_page_size = clamped;
        }

        config
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default().with_name(self.worker_name.clone())
    }

    /// Retrying caller for one named external operation.
    pub fn caller(&self, name: impl Into<String>) -> ResilientCaller {
        ResilientCaller::new(name, self.retry.clone())
    }

    /// Manager over `store` with its own background worker and this config's
    /// default page size.
    pub fn task_manager<S: TaskStore + 'static>(&self, store: S) -> TaskManager<S> {
        TaskManager::new(store, Arc::new(BackgroundExecutor::new(self.executor_config())))
            .with_default_page_size(self.default_page_size)
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "invalid configuration value; using default");
            None
        }
    }
}
