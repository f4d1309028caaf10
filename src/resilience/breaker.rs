//! Circuit breaker guarding the fetch dependency
//!
//! The breaker counts failures of the protected operation and, once the
//! failure threshold is reached, rejects further calls without invoking the
//! operation until the recovery timeout has elapsed. After the timeout a trial
//! call is let through: success closes the circuit, failure reopens it.

use crate::config::BreakerConfig;
use crate::state::{from_unix_seconds, unix_seconds};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Represents the current state of a circuit breaker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls pass through normally
    #[default]
    #[serde(rename = "CLOSED")]
    Closed,

    /// Calls are rejected without invoking the operation
    #[serde(rename = "OPEN")]
    Open,

    /// A trial call is let through to check for recovery
    #[serde(rename = "HALF_OPEN")]
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CLOSED" => Some(Self::Closed),
            "OPEN" => Some(Self::Open),
            "HALF_OPEN" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain record of breaker internals, as persisted in progress snapshots
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CircuitRecord {
    #[serde(default)]
    pub state: CircuitState,

    #[serde(default)]
    pub failure_count: u32,

    /// Seconds since the Unix epoch
    #[serde(default)]
    pub last_failure_time: Option<f64>,
}

impl CircuitRecord {
    /// Rewrites a persisted `OPEN` state to `HALF_OPEN`.
    ///
    /// The downtime between the save and the load is unknown, so a restored
    /// breaker gets exactly one optimistic trial call.
    pub fn demote_open(mut self) -> Self {
        if self.state == CircuitState::Open {
            self.state = CircuitState::HalfOpen;
        }
        self
    }
}

/// Error returned when the breaker short-circuits a call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{name}' is {state} - failing fast")]
pub struct CircuitOpenError {
    pub name: String,
    pub state: CircuitState,
}

/// Outcome of a failed [`CircuitBreaker::call`]
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call; the operation was not invoked
    #[error(transparent)]
    Open(CircuitOpenError),

    /// The operation ran and failed; the error is passed through untouched
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns the operation's own error, if the operation ran
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Open(_) => None,
            Self::Inner(err) => Some(err),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<SystemTime>,
}

/// Thread-safe circuit breaker with Closed/Open/Half-Open transitions
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker
    ///
    /// A zero threshold is treated as one.
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
            }),
        }
    }

    /// Creates a breaker from its configuration section
    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(
            config.name.clone(),
            config.failure_threshold,
            Duration::from_secs(config.recovery_timeout_secs),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn last_failure_time(&self) -> Option<SystemTime> {
        self.lock().last_failure_time
    }

    /// Runs `operation` under breaker protection
    ///
    /// When the circuit is open and still cooling down the operation is not
    /// invoked and [`BreakerError::Open`] is returned. Otherwise the outcome is
    /// recorded and the operation's own result is returned unchanged.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.allow_request().map_err(BreakerError::Open)?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Checks whether a call may proceed, moving an open circuit whose
    /// recovery timeout has elapsed to half-open.
    ///
    /// Concurrent callers arriving while the circuit is half-open are all let
    /// through.
    pub fn allow_request(&self) -> Result<CircuitState, CircuitOpenError> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            if self.cooled_down(&inner) {
                self.transition(&mut inner, CircuitState::HalfOpen);
            } else {
                return Err(CircuitOpenError {
                    name: self.name.clone(),
                    state: inner.state,
                });
            }
        }

        Ok(inner.state)
    }

    /// True when the circuit is open and the recovery timeout has not elapsed.
    ///
    /// Does not change state.
    pub fn is_open_and_cooling(&self) -> bool {
        let inner = self.lock();
        inner.state == CircuitState::Open && !self.cooled_down(&inner)
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::Open {
            return;
        }

        inner.failure_count = 0;
        inner.last_failure_time = None;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Records a failed call, opening the circuit when appropriate.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(SystemTime::now());

        match inner.state {
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open)
            }
            _ => {}
        }
    }

    /// Forces the breaker back to closed with a clean slate.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.last_failure_time = None;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Captures the breaker internals for persistence
    pub fn to_record(&self) -> CircuitRecord {
        let inner = self.lock();
        CircuitRecord {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure_time.map(unix_seconds),
        }
    }

    /// Overwrites the breaker internals with a persisted record
    pub fn restore(&self, record: &CircuitRecord) {
        let mut inner = self.lock();
        inner.state = record.state;
        inner.failure_count = record.failure_count;
        inner.last_failure_time = record.last_failure_time.and_then(from_unix_seconds);
        tracing::debug!(
            breaker = %self.name,
            state = %inner.state,
            failure_count = inner.failure_count,
            "circuit breaker restored"
        );
    }

    fn cooled_down(&self, inner: &BreakerInner) -> bool {
        match inner.last_failure_time {
            // Clock moved backwards: treat as no time elapsed.
            Some(at) => SystemTime::now()
                .duration_since(at)
                .map(|elapsed| elapsed >= self.recovery_timeout)
                .unwrap_or(false),
            None => true,
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitState) {
        if inner.state != next {
            tracing::warn!(
                breaker = %self.name,
                previous = %inner.state,
                next = %next,
                failure_count = inner.failure_count,
                "circuit breaker state changed"
            );
            inner.state = next;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
