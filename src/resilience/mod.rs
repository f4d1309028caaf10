//! Fault-tolerance primitives
//!
//! - `CircuitBreaker`: stops calling a failing dependency for a cooldown period
//! - `RetryExecutor`: retries transient failures with capped exponential backoff
//!
//! The two compose explicitly: `breaker.call(|| retry.run(|_| fetch(url)))`.
//! An exhausted retry run therefore counts as a single breaker failure.

mod breaker;
mod retry;

pub use breaker::{BreakerError, CircuitBreaker, CircuitOpenError, CircuitRecord, CircuitState};
pub use retry::{
    classify_status, RetryAttempt, RetryDisposition, RetryExecutor, RetryHook, RetryPolicy,
    Retryable, Sleeper, TokioSleeper,
};
