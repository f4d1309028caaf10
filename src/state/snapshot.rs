//! Batch progress snapshot

use crate::resilience::CircuitRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, negative for times before it
pub fn unix_seconds(at: SystemTime) -> f64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Inverse of [`unix_seconds`]; `None` for negative or non-finite input
pub fn from_unix_seconds(secs: f64) -> Option<SystemTime> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let offset = Duration::try_from_secs_f64(secs).ok()?;
    UNIX_EPOCH.checked_add(offset)
}

/// Progress of a URL batch, as written to disk after every URL
///
/// A URL is in at most one of `pending_urls` and `completed_urls`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// URLs still to fetch, in batch order
    #[serde(default)]
    pub pending_urls: Vec<String>,

    #[serde(default)]
    pub completed_urls: BTreeSet<String>,

    #[serde(default)]
    pub circuit_state: CircuitRecord,

    /// When the snapshot was last updated, in Unix seconds
    #[serde(default)]
    pub timestamp: f64,
}

impl ProgressSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends URLs that are neither pending nor completed
    ///
    /// Returns the number of URLs added.
    pub fn enqueue<I, S>(&mut self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for url in urls {
            let url = url.as_ref();
            if self.completed_urls.contains(url) || self.pending_urls.iter().any(|p| p == url) {
                continue;
            }
            self.pending_urls.push(url.to_string());
            added += 1;
        }
        added
    }

    /// Moves a URL from pending to completed
    ///
    /// Returns false when the URL was already completed.
    pub fn mark_completed(&mut self, url: &str) -> bool {
        self.pending_urls.retain(|p| p != url);
        self.completed_urls.insert(url.to_string())
    }

    /// Removes pending entries that are already completed or repeated
    ///
    /// Returns how many entries were dropped.
    pub fn drop_completed_from_pending(&mut self) -> usize {
        let before = self.pending_urls.len();
        let completed = &self.completed_urls;
        let mut seen = std::collections::HashSet::new();
        self.pending_urls
            .retain(|url| !completed.contains(url) && seen.insert(url.clone()));
        before - self.pending_urls.len()
    }

    pub fn is_completed(&self, url: &str) -> bool {
        self.completed_urls.contains(url)
    }

    /// Pending plus completed URLs
    pub fn total(&self) -> usize {
        self.pending_urls.len() + self.completed_urls.len()
    }

    /// Stamps the snapshot with the current time
    pub fn touch(&mut self) {
        self.timestamp = unix_seconds(SystemTime::now());
    }
}
