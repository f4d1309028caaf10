//! Storage module for the run ledger
//!
//! This module records every harvest run in SQLite, including:
//! - Run start, end, status, and item count
//! - The hash of the configuration the run used
//! - URLs that failed terminally, with a severity level
//!
//! All database access goes through the shared connection pool.

mod ledger;
mod schema;
mod traits;

pub use ledger::SqliteLedger;
pub use schema::initialize_schema;
pub use traits::{RunStore, StorageError, StorageResult};

/// Represents a harvest run
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: RunStatus,
    pub config_hash: String,
    pub items_count: u64,
}

/// Status of a harvest run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Severity of a recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureLevel {
    Warning,
    Error,
    Critical,
}

impl FailureLevel {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// A URL that failed during a run
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub id: i64,
    pub run_id: i64,
    pub url: String,
    pub error_message: String,
    pub level: FailureLevel,
    pub occurred_at: String,
}
