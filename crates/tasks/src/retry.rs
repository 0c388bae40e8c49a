//! Bounded retry with exponential backoff for flaky external calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use casegen_core::{CallError, ErrorKind};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (values below 1 behave as 1)
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Factor applied to the delay after every further failure
    pub backoff_multiplier: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Per-attempt time budget; an elapsed budget is a `Timeout` failure
    pub call_timeout: Option<Duration>,
    /// Error kinds worth another attempt; everything else fails fast
    pub retryable: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            call_timeout: Some(Duration::from_secs(120)),
            retryable: ErrorKind::ALL
                .into_iter()
                .filter(|kind| kind.is_transient())
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, initial_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
            ..Default::default()
        }
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    ///
    /// `initial_delay * backoff_multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exp);
        let max_nanos = self.max_delay.as_nanos() as f64;

        if !nanos.is_finite() || nanos >= max_nanos {
            return self.max_delay;
        }
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }
}

/// Runs an operation under a [`RetryPolicy`].
///
/// Failures whose kind is not in the policy's allowlist are returned after the
/// first attempt without sleeping. Retryable failures are retried until the
/// attempt budget is spent; the last error is then returned.
#[derive(Debug, Clone)]
pub struct ResilientCaller {
    name: String,
    policy: RetryPolicy,
}

impl ResilientCaller {
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Same policy, different label for logging.
    pub fn named(&self, name: impl Into<String>) -> Self {
        Self::new(name, self.policy.clone())
    }

    /// Call `op` until it succeeds, fails permanently, or runs out of attempts.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let outcome = match self.policy.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(CallError::timeout(format!(
                        "{} did not finish within {limit:?}",
                        self.name
                    ))),
                },
                None => op().await,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(call = %self.name, attempt, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.policy.is_retryable(err.kind()) {
                debug!(call = %self.name, attempt, error = %err, "non-retryable failure");
                return Err(err);
            }

            if !self.policy.should_retry(attempt) {
                error!(
                    call = %self.name,
                    attempts = attempt,
                    error = %err,
                    "call still failing after final attempt"
                );
                return Err(err);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                call = %self.name,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "call failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// [`call`](Self::call), degrading any final failure to `fallback`.
    pub async fn call_or<T, F, Fut>(&self, op: F, fallback: T) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        match self.call(op).await {
            Ok(value) => value,
            Err(err) => {
                warn!(call = %self.name, error = %err, "call failed; using fallback value");
                fallback
            }
        }
    }
}
