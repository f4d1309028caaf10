//! Interrupting and resuming batches

use crate::support::{orchestrator, urls};
use sumi_harvest::resilience::CircuitState;
use sumi_harvest::state::ProgressStore;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_resume_retries_only_failed_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    for page in ["/a", "/b", "/c"] {
        Mock::given(method("GET"))
            .and(path(page))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("progress.json");
    let batch = urls(&server.uri(), &["/a", "/b", "/c"]);

    let first = orchestrator(&state_path, 5, 2);
    let report = first.run(&batch).await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.completed_count, 2);
    drop(first);

    let requests_before = server.received_requests().await.unwrap().len();

    let second = orchestrator(&state_path, 5, 2);
    second.resume().unwrap();
    let report = second.run(&batch).await.unwrap();

    assert!(report.failed.is_empty());
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].url, batch[1]);
    assert_eq!(report.completed_count, 3);
    assert_eq!(report.total_count, 3);

    let requests_after = server.received_requests().await.unwrap().len();
    assert_eq!(requests_after - requests_before, 1);

    let saved = ProgressStore::new(&state_path).load().unwrap();
    assert!(saved.pending_urls.is_empty());
}

#[tokio::test]
async fn test_shutdown_then_resume_completes_batch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("progress.json");
    let batch = urls(&server.uri(), &["/1", "/2", "/3"]);

    let token = CancellationToken::new();
    token.cancel();
    let interrupted = orchestrator(&state_path, 5, 1).with_shutdown(token);
    let report = interrupted.run(&batch).await.unwrap();
    assert!(report.interrupted);
    assert_eq!(report.completed_count, 0);

    let saved = ProgressStore::new(&state_path).load().unwrap();
    assert_eq!(saved.pending_urls, batch);

    let resumed = orchestrator(&state_path, 5, 1);
    resumed.resume().unwrap();
    let report = resumed.run(&[]).await.unwrap();

    assert!(!report.interrupted);
    assert_eq!(report.completed_count, 3);
    assert_eq!(report.circuit_state, CircuitState::Closed);
}

#[tokio::test]
async fn test_fresh_start_ignores_saved_progress() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("progress.json");
    let batch = urls(&server.uri(), &["/x"]);

    let first = orchestrator(&state_path, 5, 1);
    first.run(&batch).await.unwrap();

    let second = orchestrator(&state_path, 5, 1);
    second.fresh().unwrap();
    let report = second.run(&batch).await.unwrap();

    assert_eq!(report.results.len(), 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_corrupt_progress_file_refuses_to_resume() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("progress.json");
    std::fs::write(&state_path, "not json").unwrap();

    let orch = orchestrator(&state_path, 5, 1);
    assert!(orch.resume().is_err());
}
