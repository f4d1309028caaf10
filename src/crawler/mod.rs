//! Crawler module for batch URL harvesting
//!
//! This module contains the fetching side of a harvest:
//! - HTTP fetching and failure classification
//! - Batch orchestration through the circuit breaker and retry executor
//! - Progress persistence and resume

mod fetcher;
mod orchestrator;

pub use fetcher::{build_http_client, Fetch, FetchError, HttpFetcher};
pub use orchestrator::{FailedUrl, ScrapeOrchestrator, ScrapeReport, ScrapedPage};
