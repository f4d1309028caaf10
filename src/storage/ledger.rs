//! SQLite run ledger
//!
//! This module provides a SQLite-based implementation of the RunStore trait,
//! borrowing a pooled connection for every operation.

use crate::pool::{with_transaction, SqliteManager, SqlitePool};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{RunStore, StorageError, StorageResult};
use crate::storage::{FailureLevel, FailureRecord, RunRecord, RunStatus};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

const RUN_COLUMNS: &str = "id, started_at, ended_at, status, config_hash, items_count";

/// Run ledger stored in SQLite
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: Arc<SqlitePool>,
}

impl SqliteLedger {
    /// Wraps an existing pool, creating the ledger tables if needed
    pub fn new(pool: Arc<SqlitePool>) -> StorageResult<Self> {
        {
            let conn = pool.get()?;
            initialize_schema(&conn)?;
        }
        Ok(Self { pool })
    }

    /// Opens the database at `path` with a pool of `max_connections`
    pub fn open(path: &Path, max_connections: usize) -> StorageResult<Self> {
        Self::new(Arc::new(SqliteManager::new(path).into_pool(max_connections)))
    }

    pub fn pool(&self) -> &Arc<SqlitePool> {
        &self.pool
    }
}

impl RunStore for SqliteLedger {
    fn start_run(&self, config_hash: &str) -> StorageResult<i64> {
        let mut conn = self.pool.get()?;
        let now = Utc::now().to_rfc3339();

        let run_id = with_transaction(&mut conn, |tx| {
            tx.execute(
                "INSERT INTO scraper_runs (started_at, status, config_hash) VALUES (?1, ?2, ?3)",
                params![now, RunStatus::Running.to_db_string(), config_hash],
            )?;
            Ok::<_, StorageError>(tx.last_insert_rowid())
        })?;

        tracing::debug!(run_id, "run started");
        Ok(run_id)
    }

    fn record_failure(
        &self,
        run_id: i64,
        url: &str,
        message: &str,
        level: FailureLevel,
    ) -> StorageResult<()> {
        let mut conn = self.pool.get()?;
        let now = Utc::now().to_rfc3339();

        with_transaction(&mut conn, |tx| {
            tx.execute(
                "INSERT INTO scraper_failures (run_id, url, error_message, level, occurred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id, url, message, level.to_db_string(), now],
            )?;
            Ok(())
        })
    }

    fn finish_run(&self, run_id: i64, status: RunStatus, items_count: u64) -> StorageResult<()> {
        let mut conn = self.pool.get()?;
        let now = Utc::now().to_rfc3339();
        let items = i64::try_from(items_count).unwrap_or(i64::MAX);

        with_transaction(&mut conn, |tx| {
            let updated = tx.execute(
                "UPDATE scraper_runs SET ended_at = ?1, status = ?2, items_count = ?3 WHERE id = ?4",
                params![now, status.to_db_string(), items, run_id],
            )?;
            if updated == 0 {
                return Err(StorageError::RunNotFound(run_id));
            }
            Ok(())
        })?;

        tracing::debug!(run_id, status = status.to_db_string(), items_count, "run finished");
        Ok(())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!("SELECT {} FROM scraper_runs WHERE id = ?1", RUN_COLUMNS),
            params![run_id],
            run_from_row,
        )
        .optional()?
        .ok_or(StorageError::RunNotFound(run_id))
    }

    fn latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let conn = self.pool.get()?;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM scraper_runs ORDER BY id DESC LIMIT 1", RUN_COLUMNS),
                [],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    fn failures_for_run(&self, run_id: i64) -> StorageResult<Vec<FailureRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, url, error_message, level, occurred_at
             FROM scraper_failures WHERE run_id = ?1 ORDER BY id",
        )?;

        let failures = stmt
            .query_map(params![run_id], |row| {
                Ok(FailureRecord {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    url: row.get(2)?,
                    error_message: row.get(3)?,
                    level: FailureLevel::from_db_string(&row.get::<_, String>(4)?)
                        .unwrap_or(FailureLevel::Error),
                    occurred_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(failures)
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        ended_at: row.get(2)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(3)?).unwrap_or(RunStatus::Running),
        config_hash: row.get(4)?,
        items_count: row.get::<_, i64>(5)?.max(0) as u64,
    })
}
