//! HTTP fetcher implementation
//!
//! This module handles all page requests for the crawler, including:
//! - Building HTTP clients with the configured user agent
//! - Single-attempt GET requests behind the `PageFetcher` seam
//! - Classifying a loaded page as ready, empty or not yet fully rendered
//! - The retry loop: transport failures and incomplete pages are retried
//!   with a fixed delay, forever unless an attempt cap is configured
//! - Client errors (4xx other than 408 and 429) are terminal and never retried

use crate::config::{CrawlerConfig, FetchConfig};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while fetching a page
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport failure or unusable response; retried by `RetryingFetcher`
    #[error("Transient failure fetching {url}: {message}")]
    Transient { url: String, message: String },

    /// The server refused the page for good (404, 410, 403, ...)
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    /// The configured attempt cap ran out
    #[error("Gave up on {url} after {attempts} attempts")]
    GaveUp { url: String, attempts: u32 },
}

impl FetchError {
    /// True for a page the server says no longer exists
    pub fn is_gone(&self) -> bool {
        matches!(self, FetchError::Status { status: 404 | 410, .. })
    }
}

/// Whether a non-success status is worth another attempt
///
/// Server errors, request timeouts and rate limiting pass; any other client
/// error will not change on retry.
fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    !status.is_client_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// One attempt at loading a page
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Returns the raw body, `FetchError::Status` for a terminal client error,
    /// or `FetchError::Transient` on any other failure
    async fn fetch_once(&self, url: &str) -> Result<String, FetchError>;
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `user_agent` - User-Agent header value
/// * `timeout` - Whole-request timeout
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(user_agent: &str, timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Plain HTTP page fetcher
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(crawler: &CrawlerConfig, fetch: &FetchConfig) -> Result<Self, reqwest::Error> {
        let client = build_http_client(
            &crawler.user_agent,
            Duration::from_secs(fetch.request_timeout_secs),
        )?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_once(&self, url: &str) -> Result<String, FetchError> {
        let transient = |message: String| FetchError::Transient {
            url: url.to_string(),
            message,
        };

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                transient("request timeout".to_string())
            } else if e.is_connect() {
                transient(format!("connection failed: {}", e))
            } else {
                transient(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            if !is_retryable_status(status) {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            return Err(transient(format!("HTTP {}", status.as_u16())));
        }

        // A body cut off mid-stream surfaces here
        response
            .text()
            .await
            .map_err(|e| transient(format!("truncated body: {}", e)))
    }
}

/// What a page is expected to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// A numbered page of listing links
    Listing,
    /// A single listing's detail page
    Detail,
}

/// Structural state of a loaded page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCondition {
    /// Fully rendered, ready for extraction
    Ready,
    /// A listing page with no listings: the end of the paginated range
    Empty,
    /// Loaded without its structural landmarks; worth another try
    Incomplete,
}

/// Decides whether a loaded page body is complete
pub trait PageInspector: Send + Sync {
    fn inspect(&self, kind: PageKind, body: &str) -> PageCondition;
}

/// A page that passed inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedPage {
    Ready(String),
    /// The listing range is exhausted
    Empty,
}

/// Retry timing for `RetryingFetcher`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay after a transport failure
    pub retry_delay: Duration,

    /// Delay after a page loaded without its landmarks
    pub incomplete_delay: Duration,

    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(config: &FetchConfig) -> Self {
        Self {
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            incomplete_delay: Duration::from_millis(config.incomplete_delay_ms),
            max_attempts: (config.max_attempts > 0).then_some(config.max_attempts),
        }
    }
}

/// Fetcher that keeps going until a page is usable
///
/// Transient conditions never reach the caller unless an attempt cap is set.
/// Every retry waits the same fixed delay.
#[derive(Clone)]
pub struct RetryingFetcher {
    fetcher: Arc<dyn PageFetcher>,
    inspector: Arc<dyn PageInspector>,
    policy: RetryPolicy,
}

impl RetryingFetcher {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        inspector: Arc<dyn PageInspector>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            fetcher,
            inspector,
            policy,
        }
    }

    /// Fetches `url` and classifies it as `kind`
    ///
    /// # Returns
    ///
    /// * `Ok(FetchedPage::Ready(body))` - A fully rendered page
    /// * `Ok(FetchedPage::Empty)` - A listing page with no listings left
    /// * `Err(FetchError::Status)` - The server answered with a terminal client error
    /// * `Err(FetchError::GaveUp)` - Only when `max_attempts` is set and exhausted
    pub async fn fetch(&self, url: &str, kind: PageKind) -> Result<FetchedPage, FetchError> {
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let delay = match self.fetcher.fetch_once(url).await {
                Ok(body) => match self.inspector.inspect(kind, &body) {
                    PageCondition::Ready => return Ok(FetchedPage::Ready(body)),
                    PageCondition::Empty => return Ok(FetchedPage::Empty),
                    PageCondition::Incomplete => {
                        tracing::debug!("Page not fully rendered, retrying: {}", url);
                        self.policy.incomplete_delay
                    }
                },
                Err(e @ FetchError::Status { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!("{} (attempt {})", e, attempts);
                    self.policy.retry_delay
                }
            };

            if let Some(max) = self.policy.max_attempts {
                if attempts >= max {
                    return Err(FetchError::GaveUp {
                        url: url.to_string(),
                        attempts,
                    });
                }
            }

            tokio::time::sleep(delay).await;
        }
    }
}
