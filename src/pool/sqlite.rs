//! SQLite resource manager for [`ConnectionPool`]

use super::{ConnectionPool, ManageResource, PoolError};
use rusqlite::{Connection, Transaction};
use std::path::{Path, PathBuf};

/// Pool of SQLite connections to one database file
pub type SqlitePool = ConnectionPool<SqliteManager>;

/// Opens SQLite connections to a database file
#[derive(Debug, Clone)]
pub struct SqliteManager {
    path: PathBuf,
    target: String,
}

impl SqliteManager {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let target = path.display().to_string();
        Self { path, target }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates a pool of at most `max_connections` connections to this database
    pub fn into_pool(self, max_connections: usize) -> SqlitePool {
        ConnectionPool::new(self, max_connections)
    }

    fn connect_error(&self, err: impl std::fmt::Display) -> PoolError {
        PoolError::Connect {
            target: self.target.clone(),
            message: err.to_string(),
        }
    }
}

impl ManageResource for SqliteManager {
    type Resource = Connection;

    fn target(&self) -> &str {
        &self.target
    }

    fn connect(&self) -> Result<Connection, PoolError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.connect_error(e))?;
        }

        let conn = Connection::open(&self.path).map_err(|e| self.connect_error(e))?;

        // Several pooled connections share the file, so writers wait on the
        // lock instead of failing with SQLITE_BUSY.
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
        ",
        )
        .map_err(|e| self.connect_error(e))?;

        Ok(conn)
    }

    fn close(&self, resource: Connection) {
        if let Err((_, e)) = resource.close() {
            tracing::warn!(database = %self.target, error = %e, "failed to close SQLite connection");
        }
    }
}

/// Runs `f` inside a transaction
///
/// The transaction commits when `f` returns `Ok`. On `Err`, or if `f`
/// panics, it is rolled back when dropped.
pub fn with_transaction<T, E, F>(conn: &mut Connection, f: F) -> Result<T, E>
where
    F: FnOnce(&Transaction<'_>) -> Result<T, E>,
    E: From<rusqlite::Error>,
{
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}
