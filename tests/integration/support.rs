//! Shared fixtures for the integration tests

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sumi_harvest::config::FetchConfig;
use sumi_harvest::crawler::{HttpFetcher, ScrapeOrchestrator};
use sumi_harvest::resilience::{CircuitBreaker, RetryExecutor, RetryPolicy};
use sumi_harvest::state::ProgressStore;

/// Retry policy with millisecond backoff so failing URLs do not slow tests down
pub fn fast_retry(max_attempts: u32) -> RetryExecutor {
    RetryExecutor::new(RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        backoff_multiplier: 2.0,
        max_delay: Duration::from_millis(4),
    })
}

pub fn test_fetcher() -> HttpFetcher {
    let config = FetchConfig {
        timeout_secs: 5,
        connect_timeout_secs: 2,
        user_agent: "TestHarvester/1.0".to_string(),
    };
    HttpFetcher::new(&config).unwrap()
}

pub fn orchestrator(
    state_path: &Path,
    failure_threshold: u32,
    max_attempts: u32,
) -> ScrapeOrchestrator<HttpFetcher> {
    ScrapeOrchestrator::new(
        test_fetcher(),
        Arc::new(CircuitBreaker::new(
            "integration",
            failure_threshold,
            Duration::from_secs(60),
        )),
        fast_retry(max_attempts),
        ProgressStore::new(state_path),
    )
}

pub fn urls(base: &str, paths: &[&str]) -> Vec<String> {
    paths.iter().map(|p| format!("{}{}", base, p)).collect()
}
