//! Storage traits and error types
//!
//! This module defines the trait interface for the run ledger and
//! associated error types.

use crate::pool::PoolError;
use crate::storage::{FailureLevel, FailureRecord, RunRecord, RunStatus};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Connection pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Bookkeeping for harvest runs
///
/// Implementations are shared between the orchestrator and the binary, so
/// every method takes `&self`.
pub trait RunStore: Send + Sync {
    /// Creates a new run in the `running` state
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn start_run(&self, config_hash: &str) -> StorageResult<i64>;

    /// Records a URL that failed terminally during a run
    fn record_failure(
        &self,
        run_id: i64,
        url: &str,
        message: &str,
        level: FailureLevel,
    ) -> StorageResult<()>;

    /// Sets the final status, end time, and item count of a run
    fn finish_run(&self, run_id: i64, status: RunStatus, items_count: u64) -> StorageResult<()>;

    /// Gets a run by ID
    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Gets the most recent run
    fn latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Gets the failures recorded for a run, oldest first
    fn failures_for_run(&self, run_id: i64) -> StorageResult<Vec<FailureRecord>>;
}
