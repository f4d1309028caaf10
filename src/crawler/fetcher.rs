//! HTTP fetcher implementation
//!
//! This module handles the HTTP side of a harvest:
//! - Building the HTTP client with the configured user agent and timeouts
//! - GET requests returning the page body
//! - Error classification into transient and permanent failures

use crate::config::FetchConfig;
use crate::resilience::{classify_status, RetryDisposition, Retryable};
use async_trait::async_trait;
use reqwest::{redirect::Policy, Client};
use std::time::Duration;
use thiserror::Error;

/// Errors produced while fetching a single URL
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("could not connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to read body of {url}: {message}")]
    Body { url: String, message: String },

    #[error("invalid URL '{0}'")]
    InvalidUrl(String),

    #[error("request to {url} failed: {message}")]
    Other { url: String, message: String },
}

impl FetchError {
    /// The URL the failed request was for
    pub fn url(&self) -> &str {
        match self {
            Self::Connect { url, .. }
            | Self::Timeout { url }
            | Self::Status { url, .. }
            | Self::Body { url, .. }
            | Self::Other { url, .. } => url,
            Self::InvalidUrl(url) => url,
        }
    }
}

/// # Retry Logic
///
/// | Condition | Action |
/// |-----------|--------|
/// | Connection failure | Retry |
/// | Timeout | Retry |
/// | Body interrupted | Retry |
/// | HTTP 5xx / 429 | Retry |
/// | Other HTTP status | Abort |
/// | Invalid URL / other | Abort |
impl Retryable for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Connect { .. } | Self::Timeout { .. } | Self::Body { .. } => {
                RetryDisposition::Retry
            }
            Self::Status { status, .. } => classify_status(*status),
            Self::InvalidUrl(_) | Self::Other { .. } => RetryDisposition::Abort,
        }
    }
}

/// Source of page content for the orchestrator
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Fetches `url` and returns the response body
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The fetch configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &FetchConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.as_str())
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// [`Fetch`] implementation backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        Ok(Self::with_client(build_http_client(config)?))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let parsed = url::Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                }
            } else {
                FetchError::Body {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        })
    }
}

fn classify_reqwest_error(url: &str, e: &reqwest::Error) -> FetchError {
    let url = url.to_string();
    if e.is_timeout() {
        FetchError::Timeout { url }
    } else if e.is_connect() || e.is_request() {
        FetchError::Connect {
            url,
            message: e.to_string(),
        }
    } else if e.is_builder() {
        FetchError::InvalidUrl(url)
    } else {
        FetchError::Other {
            url,
            message: e.to_string(),
        }
    }
}
