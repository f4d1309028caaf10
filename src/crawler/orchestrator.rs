//! Batch orchestration
//!
//! The orchestrator walks the pending URLs in order. Every fetch runs inside
//! the retry executor, which in turn runs inside the circuit breaker, so one
//! exhausted retry sequence counts as one breaker failure. Progress is
//! persisted after every URL.

use crate::crawler::fetcher::Fetch;
use crate::resilience::{BreakerError, CircuitBreaker, CircuitOpenError, CircuitState, RetryExecutor};
use crate::state::{PersistenceError, ProgressSnapshot, ProgressStore, StateSaver};
use crate::storage::{FailureLevel, RunStatus, RunStore};
use crate::HarvestError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use tokio_util::sync::CancellationToken;

/// A successfully fetched URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedPage {
    pub url: String,
    pub content: String,
}

/// A URL whose fetch failed terminally in this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUrl {
    pub url: String,
    pub error: String,
}

/// Outcome of [`ScrapeOrchestrator::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeReport {
    /// Pages fetched in this run, in batch order
    pub results: Vec<ScrapedPage>,

    pub failed: Vec<FailedUrl>,

    /// Completed URLs including those completed by earlier runs
    pub completed_count: usize,

    /// Pending plus completed URLs when the run started
    pub total_count: usize,

    pub circuit_state: CircuitState,

    pub failure_count: u32,

    /// True when a shutdown request stopped the batch early
    pub interrupted: bool,
}

/// Drives a URL batch through the breaker, the retry executor, and the
/// progress store
pub struct ScrapeOrchestrator<F: Fetch> {
    fetcher: F,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
    store: ProgressStore,
    shutdown: CancellationToken,
    ledger: Option<Arc<dyn RunStore>>,
    config_hash: String,
    progress: Arc<Mutex<ProgressSnapshot>>,
}

impl<F: Fetch> ScrapeOrchestrator<F> {
    pub fn new(
        fetcher: F,
        breaker: Arc<CircuitBreaker>,
        retry: RetryExecutor,
        store: ProgressStore,
    ) -> Self {
        Self {
            fetcher,
            breaker,
            retry,
            store,
            shutdown: CancellationToken::new(),
            ledger: None,
            config_hash: String::new(),
            progress: Arc::new(Mutex::new(ProgressSnapshot::default())),
        }
    }

    /// Stops the batch between URLs once `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Records runs and failures in `ledger`
    pub fn with_ledger(mut self, ledger: Arc<dyn RunStore>, config_hash: impl Into<String>) -> Self {
        self.ledger = Some(ledger);
        self.config_hash = config_hash.into();
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Copy of the in-memory progress
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock_progress().clone()
    }

    /// Loads saved progress and restores the breaker from it
    pub fn resume(&self) -> Result<(), PersistenceError> {
        let snapshot = self.store.load()?;
        self.breaker.restore(&snapshot.circuit_state);
        *self.lock_progress() = snapshot;
        Ok(())
    }

    /// Discards saved progress and resets the breaker
    pub fn fresh(&self) -> Result<(), PersistenceError> {
        self.store.clear()?;
        self.breaker.reset();
        *self.lock_progress() = ProgressSnapshot::default();
        tracing::info!(path = %self.store.path().display(), "starting from a clean slate");
        Ok(())
    }

    /// Callback that saves the current progress from a signal or panic path
    ///
    /// The callback skips the save rather than wait when the batch loop holds
    /// the progress lock; the loop persists after every URL on its own.
    pub fn state_saver(&self) -> StateSaver {
        let progress = self.progress.clone();
        let breaker = self.breaker.clone();
        let store = self.store.clone();

        Arc::new(move || {
            let mut snapshot = match progress.try_lock() {
                Ok(guard) => guard.clone(),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().clone(),
                Err(TryLockError::WouldBlock) => {
                    tracing::debug!("progress busy; skipping out-of-band save");
                    return Ok(());
                }
            };
            snapshot.circuit_state = breaker.to_record();
            snapshot.touch();
            store.save(&snapshot)
        })
    }

    /// Writes the current progress and breaker state to disk
    pub fn persist(&self) -> Result<(), PersistenceError> {
        let snapshot = {
            let mut progress = self.lock_progress();
            progress.circuit_state = self.breaker.to_record();
            progress.touch();
            progress.clone()
        };
        self.store.save(&snapshot)
    }

    /// Runs the batch
    ///
    /// `urls` are appended to any pending URLs carried over from a resumed
    /// run; URLs already completed are skipped. A failed URL stays pending so
    /// that a later run retries it.
    ///
    /// # Errors
    ///
    /// * `HarvestError::CircuitOpen` - the breaker was open and cooling down;
    ///   the remaining URLs stay pending
    /// * `HarvestError::Persistence` - progress could not be saved
    pub async fn run(&self, urls: &[String]) -> crate::Result<ScrapeReport> {
        let (queue, total_count) = {
            let mut progress = self.lock_progress();
            let added = progress.enqueue(urls);
            tracing::info!(
                pending = progress.pending_urls.len(),
                completed = progress.completed_urls.len(),
                added,
                "starting batch"
            );
            (progress.pending_urls.clone(), progress.total())
        };

        let run_id = self.start_run();
        let mut results = Vec::new();
        let mut failed = Vec::new();
        let mut interrupted = false;

        for url in queue {
            if self.shutdown.is_cancelled() {
                tracing::info!(next = %url, "shutdown requested; leaving remaining URLs pending");
                interrupted = true;
                break;
            }

            if self.breaker.is_open_and_cooling() {
                let err = CircuitOpenError {
                    name: self.breaker.name().to_string(),
                    state: CircuitState::Open,
                };
                return Err(self.abort(run_id, &url, err, results.len()));
            }

            let outcome = self
                .breaker
                .call(|| self.retry.run(|_attempt| self.fetcher.fetch(&url)))
                .await;

            match outcome {
                Ok(content) => {
                    self.lock_progress().mark_completed(&url);
                    tracing::info!(url = %url, bytes = content.len(), "fetched");
                    results.push(ScrapedPage { url, content });
                }
                Err(BreakerError::Open(err)) => {
                    return Err(self.abort(run_id, &url, err, results.len()));
                }
                Err(BreakerError::Inner(err)) => {
                    tracing::warn!(
                        url = %url,
                        error = %err,
                        breaker_failures = self.breaker.failure_count(),
                        "fetch failed; URL stays pending"
                    );
                    let message = err.to_string();
                    self.record_failure(run_id, &url, &message, FailureLevel::Error);
                    failed.push(FailedUrl { url, error: message });
                }
            }

            if let Err(e) = self.persist() {
                self.finish_run(run_id, RunStatus::Failed, results.len());
                return Err(e.into());
            }
        }

        self.persist()?;

        let status = if interrupted {
            RunStatus::Interrupted
        } else {
            RunStatus::Completed
        };
        self.finish_run(run_id, status, results.len());

        let report = ScrapeReport {
            completed_count: self.lock_progress().completed_urls.len(),
            total_count,
            circuit_state: self.breaker.state(),
            failure_count: self.breaker.failure_count(),
            interrupted,
            results,
            failed,
        };

        tracing::info!(
            completed = report.completed_count,
            total = report.total_count,
            failed = report.failed.len(),
            circuit = %report.circuit_state,
            interrupted,
            "batch finished"
        );
        Ok(report)
    }

    /// Persists, records the abort, and converts it into the batch error
    fn abort(
        &self,
        run_id: Option<i64>,
        url: &str,
        err: CircuitOpenError,
        items: usize,
    ) -> HarvestError {
        tracing::error!(
            breaker = %err.name,
            next = %url,
            failure_count = self.breaker.failure_count(),
            "circuit open; aborting batch"
        );

        if let Err(e) = self.persist() {
            tracing::error!(error = %e, "failed to save progress before aborting");
        }
        self.record_failure(run_id, url, &err.to_string(), FailureLevel::Critical);
        self.finish_run(run_id, RunStatus::Failed, items);
        err.into()
    }

    fn start_run(&self) -> Option<i64> {
        let ledger = self.ledger.as_ref()?;
        match ledger.start_run(&self.config_hash) {
            Ok(run_id) => Some(run_id),
            Err(e) => {
                tracing::warn!(error = %e, "failed to record run start; continuing without ledger");
                None
            }
        }
    }

    fn record_failure(&self, run_id: Option<i64>, url: &str, message: &str, level: FailureLevel) {
        let (Some(ledger), Some(run_id)) = (self.ledger.as_ref(), run_id) else {
            return;
        };
        if let Err(e) = ledger.record_failure(run_id, url, message, level) {
            tracing::warn!(run_id, url, error = %e, "failed to record failure");
        }
    }

    fn finish_run(&self, run_id: Option<i64>, status: RunStatus, items: usize) {
        let (Some(ledger), Some(run_id)) = (self.ledger.as_ref(), run_id) else {
            return;
        };
        if let Err(e) = ledger.finish_run(run_id, status, items as u64) {
            tracing::warn!(run_id, error = %e, "failed to record run end");
        }
    }

    fn lock_progress(&self) -> MutexGuard<'_, ProgressSnapshot> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::FetchError;
    use crate::resilience::RetryPolicy;
    use crate::storage::SqliteLedger;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Serves a canned body unless a status code is queued for the URL
    #[derive(Default)]
    struct ScriptedFetcher {
        queued: Mutex<HashMap<String, VecDeque<u16>>>,
        always: HashMap<String, u16>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn always_failing(url: &str, status: u16) -> Self {
            let mut fetcher = Self::default();
            fetcher.always.insert(url.to_string(), status);
            fetcher
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetch for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<String, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());

            let queued = self
                .queued
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(|q| q.pop_front());
            if let Some(status) = queued.or_else(|| self.always.get(url).copied()) {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status,
                });
            }
            Ok(format!("<html>{}</html>", url))
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(RetryPolicy {
            max_attempts,
            initial_delay: Duration::ZERO,
            backoff_multiplier: 2.0,
            max_delay: Duration::ZERO,
        })
    }

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|u| u.to_string()).collect()
    }

    fn orchestrator(
        dir: &TempDir,
        fetcher: ScriptedFetcher,
        threshold: u32,
        max_attempts: u32,
    ) -> ScrapeOrchestrator<ScriptedFetcher> {
        ScrapeOrchestrator::new(
            fetcher,
            Arc::new(CircuitBreaker::new("test", threshold, Duration::from_secs(60))),
            fast_retry(max_attempts),
            ProgressStore::new(dir.path().join("progress.json")),
        )
    }

    #[tokio::test]
    async fn test_all_urls_complete() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, ScriptedFetcher::default(), 5, 3);

        let report = orch.run(&urls(&["u1", "u2"])).await.unwrap();

        assert_eq!(report.completed_count, 2);
        assert_eq!(report.total_count, 2);
        assert!(report.failed.is_empty());
        assert_eq!(report.results[1].content, "<html>u2</html>");
        assert_eq!(report.circuit_state, CircuitState::Closed);

        let saved = ProgressStore::new(dir.path().join("progress.json")).load().unwrap();
        assert!(saved.pending_urls.is_empty());
        assert_eq!(saved.completed_urls.len(), 2);
    }

    #[tokio::test]
    async fn test_unwritable_progress_file_stops_batch() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let orch = ScrapeOrchestrator::new(
            ScriptedFetcher::default(),
            Arc::new(CircuitBreaker::new("test", 5, Duration::from_secs(60))),
            fast_retry(1),
            ProgressStore::new(blocker.join("progress.json")),
        );

        let err = orch.run(&urls(&["u1", "u2"])).await.unwrap_err();

        assert!(matches!(err, HarvestError::Persistence(_)));
        assert_eq!(orch.fetcher.calls(), vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_url_is_reported_and_stays_pending() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::always_failing("u2", 500);
        let orch = orchestrator(&dir, fetcher, 5, 3);

        let report = orch.run(&urls(&["u1", "u2", "u3"])).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].url, "u2");
        assert_eq!(report.completed_count, 2);
        assert_eq!(report.total_count, 3);
        assert_eq!(report.failure_count, 0);
        assert_eq!(
            orch.fetcher.calls(),
            vec!["u1", "u2", "u2", "u2", "u3"]
        );

        let saved = ProgressStore::new(dir.path().join("progress.json")).load().unwrap();
        assert_eq!(saved.pending_urls, vec!["u2"]);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_within_retries() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::default();
        fetcher
            .queued
            .lock()
            .unwrap()
            .insert("u1".to_string(), VecDeque::from([503, 429]));
        let orch = orchestrator(&dir, fetcher, 1, 3);

        let report = orch.run(&urls(&["u1"])).await.unwrap();

        assert_eq!(report.completed_count, 1);
        assert_eq!(report.circuit_state, CircuitState::Closed);
        assert_eq!(orch.fetcher.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_open_circuit_aborts_batch() {
        let dir = TempDir::new().unwrap();
        let mut fetcher = ScriptedFetcher::default();
        for url in ["u1", "u2", "u3", "u4"] {
            fetcher.always.insert(url.to_string(), 503);
        }
        let orch = orchestrator(&dir, fetcher, 2, 1);

        let err = orch.run(&urls(&["u1", "u2", "u3", "u4"])).await.unwrap_err();

        assert!(matches!(err, HarvestError::CircuitOpen(_)));
        assert_eq!(orch.fetcher.calls(), vec!["u1", "u2"]);
        assert_eq!(orch.breaker().state(), CircuitState::Open);

        let raw = std::fs::read_to_string(dir.path().join("progress.json")).unwrap();
        let on_disk: ProgressSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk.circuit_state.state, CircuitState::Open);
        assert_eq!(on_disk.pending_urls.len(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_urls_pending() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let orch = orchestrator(&dir, ScriptedFetcher::default(), 5, 1).with_shutdown(token.clone());
        token.cancel();

        let report = orch.run(&urls(&["u1", "u2"])).await.unwrap();

        assert!(report.interrupted);
        assert!(report.results.is_empty());
        assert!(orch.fetcher.calls().is_empty());
        assert_eq!(orch.snapshot().pending_urls, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_urls() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path().join("progress.json"));
        let mut saved = ProgressSnapshot::new();
        saved.enqueue(["u2"]);
        saved.completed_urls.insert("u1".to_string());
        store.save(&saved).unwrap();

        let orch = orchestrator(&dir, ScriptedFetcher::default(), 5, 1);
        orch.resume().unwrap();
        let report = orch.run(&urls(&["u1", "u2", "u3"])).await.unwrap();

        assert_eq!(orch.fetcher.calls(), vec!["u2", "u3"]);
        assert_eq!(report.completed_count, 3);
        assert_eq!(report.total_count, 3);
    }

    #[tokio::test]
    async fn test_resume_demotes_open_breaker_to_trial_call() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path().join("progress.json"));
        let mut saved = ProgressSnapshot::new();
        saved.circuit_state.state = CircuitState::Open;
        saved.circuit_state.failure_count = 9;
        saved.circuit_state.last_failure_time = Some(crate::state::unix_seconds(
            std::time::SystemTime::now(),
        ));
        store.save(&saved).unwrap();

        let orch = orchestrator(&dir, ScriptedFetcher::default(), 10, 1);
        orch.resume().unwrap();
        assert_eq!(orch.breaker().state(), CircuitState::HalfOpen);

        let report = orch.run(&urls(&["u1"])).await.unwrap();
        assert_eq!(report.circuit_state, CircuitState::Closed);
        assert_eq!(report.failure_count, 0);
    }

    #[tokio::test]
    async fn test_fresh_discards_saved_progress() {
        let dir = TempDir::new().unwrap();
        let store = ProgressStore::new(dir.path().join("progress.json"));
        let mut saved = ProgressSnapshot::new();
        saved.completed_urls.insert("u1".to_string());
        store.save(&saved).unwrap();

        let orch = orchestrator(&dir, ScriptedFetcher::default(), 5, 1);
        orch.fresh().unwrap();
        orch.run(&urls(&["u1"])).await.unwrap();

        assert_eq!(orch.fetcher.calls(), vec!["u1"]);
    }

    #[tokio::test]
    async fn test_state_saver_writes_current_progress() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, ScriptedFetcher::default(), 5, 1);
        orch.lock_progress().enqueue(["u9"]);
        orch.breaker().record_failure();

        (orch.state_saver())().unwrap();

        let saved = ProgressStore::new(dir.path().join("progress.json")).load().unwrap();
        assert_eq!(saved.pending_urls, vec!["u9"]);
        assert_eq!(saved.circuit_state.failure_count, 1);
        assert!(saved.timestamp > 0.0);
    }

    #[tokio::test]
    async fn test_ledger_records_run_and_failures() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(SqliteLedger::open(&dir.path().join("ledger.db"), 2).unwrap());
        let orch = orchestrator(&dir, ScriptedFetcher::always_failing("u2", 404), 5, 3)
            .with_ledger(ledger.clone(), "cfg-hash");

        orch.run(&urls(&["u1", "u2"])).await.unwrap();

        let run = ledger.latest_run().unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.items_count, 1);
        assert_eq!(run.config_hash, "cfg-hash");

        let failures = ledger.failures_for_run(run.id).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].url, "u2");
        assert!(failures[0].error_message.contains("404"));
        assert_eq!(orch.fetcher.calls(), vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_ledger_failure_does_not_abort_batch() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(SqliteLedger::open(&dir.path().join("ledger.db"), 1).unwrap());
        ledger.pool().close();

        let orch = orchestrator(&dir, ScriptedFetcher::default(), 5, 1)
            .with_ledger(ledger, "cfg-hash");

        let report = orch.run(&urls(&["u1"])).await.unwrap();
        assert_eq!(report.completed_count, 1);
    }
}
