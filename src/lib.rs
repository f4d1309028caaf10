//! Sumi-Harvest: a fault-tolerant batch URL harvester
//!
//! This crate fetches a batch of URLs while guarding the remote dependency with
//! a circuit breaker, retrying transient failures with exponential backoff,
//! persisting progress after every URL so an interrupted batch can resume, and
//! recording runs in SQLite through a bounded connection pool.

pub mod config;
pub mod crawler;
pub mod pool;
pub mod resilience;
pub mod shutdown;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Errors that end a harvest early
///
/// A URL that fails terminally is recorded in the report rather than raised
/// here; only conditions that stop the whole batch surface as errors.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    CircuitOpen(#[from] resilience::CircuitOpenError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] state::PersistenceError),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Sumi-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Fetch, FetchError, HttpFetcher, ScrapeOrchestrator, ScrapeReport};
pub use pool::{ConnectionPool, PoolError, SqlitePool};
pub use resilience::{CircuitBreaker, CircuitOpenError, CircuitState, RetryExecutor, RetryPolicy};
pub use shutdown::ShutdownCoordinator;
pub use state::{PersistenceError, ProgressSnapshot, ProgressStore};
