//! Media download with retry and bounded concurrency.

use crate::config::{FetchFailurePolicy, PipelineConfig};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, instrument, warn};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Media server returned {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Giving up on {url} after {attempts} attempts: {last_error}")]
    Exhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Download pool closed")]
    PoolClosed,
}

/// Source of media bytes. Fetches must be idempotent so they can be retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

/// Fetches media over plain HTTP GET
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?)
    }
}

/// Retry schedule for a single media file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.fetch_max_attempts.max(1),
            initial_delay: config.fetch_initial_delay(),
        }
    }

    /// Doubling backoff without jitter or an elapsed-time cap
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: Duration::from_secs(60 * 60),
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Sleeps taken between attempts
    pub fn delays(&self) -> Vec<Duration> {
        let mut backoff = self.backoff();
        (1..self.max_attempts)
            .filter_map(|_| backoff.next_backoff())
            .collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// Fetch `url`, retrying failures on the policy's exponential schedule
#[instrument(skip(fetcher, policy), fields(max_attempts = policy.max_attempts))]
pub async fn fetch_with_retry(
    fetcher: &dyn MediaFetcher,
    url: &str,
    policy: &RetryPolicy,
) -> Result<Bytes, FetchError> {
    let mut backoff = policy.backoff();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match fetcher.fetch(url).await {
            Ok(bytes) => {
                debug!(url, attempt, size_bytes = bytes.len(), "Fetched media");
                return Ok(bytes);
            }
            Err(e) if attempt >= policy.max_attempts => {
                return Err(FetchError::Exhausted {
                    url: url.to_string(),
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                let delay = backoff.next_backoff().unwrap_or(policy.initial_delay);
                warn!(
                    url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Media fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// One media file to download and where it lands in the export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub url: String,
    pub path: String,
}

/// Downloads batches of media under a shared concurrency limit.
///
/// The semaphore is shared by every batch of an export, so the number of
/// in-flight downloads never exceeds `fetch_concurrency`.
pub struct BatchDownloader {
    fetcher: Arc<dyn MediaFetcher>,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
    failure_policy: FetchFailurePolicy,
    dropped: AtomicU64,
}

impl BatchDownloader {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, config: &PipelineConfig) -> Self {
        Self {
            fetcher,
            semaphore: Arc::new(Semaphore::new(config.fetch_concurrency.max(1))),
            policy: RetryPolicy::from_config(config),
            failure_policy: config.fetch_failure_policy,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Media files dropped after exhausting retries so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn download(&self, request: MediaRequest) -> Result<(Bytes, MediaRequest), FetchError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| FetchError::PoolClosed)?;
        let bytes = fetch_with_retry(self.fetcher.as_ref(), &request.url, &self.policy).await?;
        Ok((bytes, request))
    }

    /// Download a batch concurrently.
    ///
    /// Results keep request order, minus the dropped files. Under
    /// [`FetchFailurePolicy::FailJob`] the first exhausted download fails the
    /// whole batch.
    #[instrument(skip(self, requests), fields(count = requests.len()))]
    pub async fn download_batch(
        &self,
        requests: Vec<MediaRequest>,
    ) -> Result<Vec<(Bytes, MediaRequest)>, FetchError> {
        let downloads: Vec<_> = requests
            .into_iter()
            .map(|request| self.download(request))
            .collect();
        let results = futures::future::join_all(downloads).await;

        let mut fetched = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(item) => fetched.push(item),
                Err(e) => {
                    if self.failure_policy == FetchFailurePolicy::FailJob {
                        error!(error = %e, "Media file unavailable, failing export");
                        return Err(e);
                    }
                    error!(error = %e, "Dropping media file");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(fetched)
    }
}
