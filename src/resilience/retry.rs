//! Bounded exponential-backoff retry executor
//!
//! Only errors classified as transient are retried. Every other error, and the
//! error of the final attempt, is handed back to the caller exactly as the
//! operation produced it.

use crate::config::RetryConfig;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Whether a failed attempt should be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    Abort,
}

/// Classification hook for errors flowing through the [`RetryExecutor`]
pub trait Retryable {
    fn disposition(&self) -> RetryDisposition;

    fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retry
    }
}

/// Classifies an HTTP status code
///
/// | Status | Disposition |
/// |--------|-------------|
/// | 5xx    | Retry       |
/// | 429    | Retry       |
/// | other  | Abort       |
pub fn classify_status(status: u16) -> RetryDisposition {
    match status {
        429 | 500..=599 => RetryDisposition::Retry,
        _ => RetryDisposition::Abort,
    }
}

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(240),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the given failed attempt (1-based)
    ///
    /// `min(initial_delay * backoff_multiplier^(attempt-1), max_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Information handed to the `on_retry` hook before each backoff sleep
#[derive(Clone, Copy)]
pub struct RetryAttempt<'a> {
    /// The attempt that just failed (1-based)
    pub attempt: u32,
    /// How long the executor is about to sleep
    pub delay: Duration,
    /// The error that triggered the retry
    pub error: &'a dyn fmt::Display,
}

pub type RetryHook = Arc<dyn Fn(RetryAttempt<'_>) + Send + Sync>;

/// Source of the backoff sleep
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Runs an operation until it succeeds, fails permanently, or runs out of
/// attempts
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    on_retry: Option<RetryHook>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryExecutor {
    /// A policy with zero attempts is treated as a single attempt, and a
    /// multiplier below one as one.
    pub fn new(mut policy: RetryPolicy) -> Self {
        policy.max_attempts = policy.max_attempts.max(1);
        if policy.backoff_multiplier.is_nan() || policy.backoff_multiplier < 1.0 {
            policy.backoff_multiplier = 1.0;
        }

        Self {
            policy,
            sleeper: Arc::new(TokioSleeper),
            on_retry: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_on_retry(mut self, hook: RetryHook) -> Self {
        self.on_retry = Some(hook);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation`, passing the 1-based attempt number
    ///
    /// Returns the first success, the first non-retryable error, or the error
    /// of the last attempt once `max_attempts` is reached.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                tracing::debug!(attempt, error = %err, "non-retryable error; giving up");
                return Err(err);
            }

            if attempt >= self.policy.max_attempts {
                tracing::error!(attempt, error = %err, "retries exhausted");
                return Err(err);
            }

            let delay = self.policy.delay_for_attempt(attempt);
            tracing::warn!(
                attempt,
                max_attempts = self.policy.max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure; retrying"
            );

            if let Some(hook) = &self.on_retry {
                hook(RetryAttempt {
                    attempt,
                    delay,
                    error: &err,
                });
            }

            self.sleeper.sleep(delay).await;
        }
    }
}
