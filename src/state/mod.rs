//! Persistent batch progress
//!
//! # Components
//!
//! - `ProgressSnapshot`: pending and completed URLs plus the breaker record
//! - `ProgressStore`: atomic JSON persistence of the snapshot and the panic-path crash-save

mod snapshot;
mod store;

pub use snapshot::{from_unix_seconds, unix_seconds, ProgressSnapshot};
pub use store::{PersistenceError, ProgressStore, StateSaver};
