//! End-to-end batches against a mock HTTP server

use crate::support::{orchestrator, urls};
use std::sync::Arc;
use sumi_harvest::config::parse_config;
use sumi_harvest::crawler::{HttpFetcher, ScrapeOrchestrator};
use sumi_harvest::resilience::{CircuitBreaker, CircuitState, RetryExecutor, RetryPolicy};
use sumi_harvest::state::ProgressStore;
use sumi_harvest::storage::{FailureLevel, RunStatus, RunStore, SqliteLedger};
use sumi_harvest::HarvestError;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_page(server: &MockServer, page: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(page))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_server_error_on_one_url_does_not_stop_batch() {
    let server = MockServer::start().await;
    mount_page(&server, "/a", "page a").await;
    mount_page(&server, "/c", "page c").await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("progress.json");
    let orch = orchestrator(&state_path, 5, 3);
    let batch = urls(&server.uri(), &["/a", "/b", "/c"]);

    let report = orch.run(&batch).await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].url, batch[1]);
    assert!(report.failed[0].error.contains("500"));
    assert_eq!(report.completed_count, 2);
    assert_eq!(report.total_count, 3);
    assert_eq!(report.results[0].content, "page a");
    assert_eq!(report.results[1].content, "page c");
    assert_eq!(report.circuit_state, CircuitState::Closed);

    let saved = ProgressStore::new(&state_path).load().unwrap();
    assert_eq!(saved.pending_urls, vec![batch[1].clone()]);
    assert!(saved.completed_urls.contains(&batch[0]));
    assert!(saved.completed_urls.contains(&batch[2]));
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let orch = orchestrator(&dir.path().join("progress.json"), 5, 5);

    let report = orch
        .run(&urls(&server.uri(), &["/missing"]))
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.completed_count, 0);
    assert_eq!(report.failure_count, 1);
}

#[tokio::test]
async fn test_rate_limited_url_succeeds_after_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    mount_page(&server, "/busy", "finally").await;

    let dir = TempDir::new().unwrap();
    let orch = orchestrator(&dir.path().join("progress.json"), 1, 3);

    let report = orch.run(&urls(&server.uri(), &["/busy"])).await.unwrap();

    assert_eq!(report.results[0].content, "finally");
    assert_eq!(report.circuit_state, CircuitState::Closed);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_dead_dependency_opens_circuit_and_aborts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("progress.json");
    let orch = orchestrator(&state_path, 2, 2);
    let batch = urls(&server.uri(), &["/1", "/2", "/3", "/4"]);

    let err = orch.run(&batch).await.unwrap_err();

    match err {
        HarvestError::CircuitOpen(open) => {
            assert_eq!(open.name, "integration");
            assert_eq!(open.state, CircuitState::Open);
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    // Two URLs, two attempts each; the rest were never requested.
    assert_eq!(server.received_requests().await.unwrap().len(), 4);

    let saved = ProgressStore::new(&state_path).load().unwrap();
    assert_eq!(saved.pending_urls.len(), 4);
    assert_eq!(saved.circuit_state.state, CircuitState::HalfOpen);
}

#[tokio::test]
async fn test_configured_batch_is_recorded_in_ledger() {
    let server = MockServer::start().await;
    mount_page(&server, "/ok", "fine").await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let toml = format!(
        r#"
urls = ["{base}/ok", "{base}/gone"]

[breaker]
name = "ledger-test"
failure-threshold = 3

[retry]
max-attempts = 2
initial-delay-ms = 1
max-delay-ms = 2

[database]
path = "{db}"
max-connections = 2
"#,
        base = server.uri(),
        db = dir.path().join("ledger.db").display(),
    );
    let config = parse_config(&toml).unwrap();

    let ledger = Arc::new(
        SqliteLedger::open(
            std::path::Path::new(&config.database.path),
            config.database.max_connections as usize,
        )
        .unwrap(),
    );
    let orch = ScrapeOrchestrator::new(
        HttpFetcher::new(&config.fetch).unwrap(),
        Arc::new(CircuitBreaker::from_config(&config.breaker)),
        RetryExecutor::new(RetryPolicy::from(&config.retry)),
        ProgressStore::new(dir.path().join("progress.json")),
    )
    .with_ledger(ledger.clone(), "hash-1");

    let report = orch.run(&config.urls).await.unwrap();
    assert_eq!(report.completed_count, 1);

    let run = ledger.latest_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.items_count, 1);

    let failures = ledger.failures_for_run(run.id).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].url, config.urls[1]);
    assert_eq!(failures[0].level, FailureLevel::Error);
    assert_eq!(ledger.pool().active_count(), 0);
}
