//! Durable snapshot storage
//!
//! Snapshots are written to a temporary file next to the target and renamed
//! over it, so a reader only ever sees the previous or the new snapshot.

use super::ProgressSnapshot;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;

const APP_DIR: &str = "sumi-harvest";
const SNAPSHOT_FILE: &str = "progress.json";

/// Errors raised while saving or loading progress
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("progress file I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("progress file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialise progress: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Callback that persists the current progress on an abnormal exit path
pub type StateSaver = Arc<dyn Fn() -> Result<(), PersistenceError> + Send + Sync>;

/// Reads and writes the progress snapshot file
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<user state dir>/sumi-harvest/progress.json`
    ///
    /// Falls back to the local data directory on platforms without a state
    /// directory, then to the working directory.
    pub fn default_path() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join(SNAPSHOT_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replaces the snapshot file
    ///
    /// Missing parent directories are created.
    pub fn save(&self, snapshot: &ProgressSnapshot) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(PersistenceError::Serialize)?;
        self.write_atomic(|file| {
            let mut writer = BufWriter::new(file);
            writer.write_all(&bytes)?;
            writer.flush()
        })?;

        tracing::debug!(
            path = %self.path.display(),
            pending = snapshot.pending_urls.len(),
            completed = snapshot.completed_urls.len(),
            "progress saved"
        );
        Ok(())
    }

    /// Loads the snapshot
    ///
    /// A missing file yields an empty snapshot. A persisted `OPEN` circuit is
    /// loaded as `HALF_OPEN`.
    ///
    /// # Errors
    ///
    /// * `PersistenceError::Corrupt` - the file exists but is not a valid snapshot
    /// * `PersistenceError::Io` - the file could not be read
    pub fn load(&self) -> Result<ProgressSnapshot, PersistenceError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no saved progress");
                return Ok(ProgressSnapshot::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut snapshot: ProgressSnapshot =
            serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        snapshot.circuit_state = snapshot.circuit_state.demote_open();

        let dropped = snapshot.drop_completed_from_pending();
        if dropped > 0 {
            tracing::warn!(
                path = %self.path.display(),
                dropped,
                "saved progress listed URLs as both pending and completed; keeping them completed"
            );
        }

        tracing::info!(
            path = %self.path.display(),
            pending = snapshot.pending_urls.len(),
            completed = snapshot.completed_urls.len(),
            circuit = %snapshot.circuit_state.state,
            "loaded saved progress"
        );
        Ok(snapshot)
    }

    /// Deletes the snapshot file, if any
    pub fn clear(&self) -> Result<(), PersistenceError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Installs a panic hook that runs `saver` before the previous hook
    ///
    /// Errors from `saver` are logged and swallowed. `saver` must not panic
    /// or block on a lock that the panicking code may hold.
    pub fn register_for_crash_save(saver: StateSaver) {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            match saver() {
                Ok(()) => tracing::warn!("progress saved after panic"),
                Err(e) => tracing::error!(error = %e, "failed to save progress after panic"),
            }
            previous(info);
        }));
    }

    fn write_atomic<F>(&self, write: F) -> io::Result<()>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        // Dropping the temp file on any error path removes it.
        let mut tmp = NamedTempFile::new_in(&dir)?;
        write(tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
