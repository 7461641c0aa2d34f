use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use tabsync_core::SyncError;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// Retries inside one request only; a request that still fails aborts the caller's cycle.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Doubling delay before retry number `retry` (zero based), capped at `max_delay`.
    pub fn delay(&self, retry: usize) -> Duration {
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

fn transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl From<FetchError> for SyncError {
    fn from(err: FetchError) -> Self {
        SyncError::FeedUnavailable(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(&self, request_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %request_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, (bool, FetchError)> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| (transient_error(&err), FetchError::from(err)))?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err((
                transient_status(status),
                FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                },
            ));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|err| (transient_error(&err), FetchError::from(err)))?;
        Ok(FetchedResponse {
            final_url,
            body: body.to_vec(),
        })
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0usize;
        loop {
            match self.fetch_once(url).await {
                Ok(resp) => {
                    debug!(bytes = resp.body.len(), retry, "fetched");
                    return Ok(resp);
                }
                Err((true, err)) if retry < self.retry.max_retries => {
                    debug!(retry, error = %err, "transient fetch failure");
                    tokio::time::sleep(self.retry.delay(retry)).await;
                    retry += 1;
                }
                Err((_, err)) => return Err(err),
            }
        }
    }
}
