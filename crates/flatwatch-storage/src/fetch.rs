//! Page fetching: the [`PageFetcher`] seam, a reqwest-backed implementation and retry timing.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use flatwatch_core::Source;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Raw outcome of one fetch. Transport detail beyond status and body is not exposed.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

impl FetchedPage {
    pub fn status_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("blocking indicator {indicator:?} on {url}")]
    Blocked { indicator: String, url: String },
    #[error("suspiciously short body ({len} bytes) for {url}")]
    TooShort { len: usize, url: String },
    #[error("no supported marketplace serves {url}")]
    Unsupported { url: String },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// Exponential waits between attempts on the same target: `first_delay`, doubled per retry,
/// capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: usize,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            first_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (zero-based), or `None` once the retries are spent.
    pub fn delay_before_retry(&self, retry: usize) -> Option<Duration> {
        if retry >= self.retries {
            return None;
        }
        let factor = u32::try_from(retry)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        Some(self.first_delay.saturating_mul(factor).min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub per_source_in_flight: usize,
    /// Minimum gap between two requests to the same marketplace.
    pub request_spacing: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 8,
            per_source_in_flight: 1,
            request_spacing: Duration::from_secs(2),
        }
    }
}

/// Hands out request slots per marketplace, at least `spacing` apart.
#[derive(Debug)]
pub struct SourcePacer {
    spacing: Duration,
    next_slot: Mutex<HashMap<Source, Instant>>,
}

impl SourcePacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the next free slot for `source` and sleep until it arrives.
    pub async fn wait(&self, source: Source) {
        let slot = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots.get(&source).copied().filter(|at| *at > now).unwrap_or(now);
            slots.insert(source, slot + self.spacing);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// One attempt per call; retries and health checks belong to the caller.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_source: HashMap<Source, Semaphore>,
    pacer: SourcePacer,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("de-DE,de;q=0.9,en;q=0.7"),
        );

        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .user_agent(user_agent)
            .build()
            .context("building reqwest client")?;

        let per_source = Source::ALL
            .into_iter()
            .map(|source| (source, Semaphore::new(config.per_source_in_flight.max(1))))
            .collect();
        Ok(Self {
            client,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_source,
            pacer: SourcePacer::new(config.request_spacing),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let source = Source::from_url(url).ok_or_else(|| FetchError::Unsupported {
            url: url.to_string(),
        })?;
        let limit = self
            .per_source
            .get(&source)
            .ok_or(FetchError::LimiterClosed)?;

        let _in_flight = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let _source = limit.acquire().await.map_err(|_| FetchError::LimiterClosed)?;
        self.pacer.wait(source).await;

        let span = info_span!("http_fetch", %source, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status().as_u16();
            let final_url = resp.url().to_string();
            let body = resp.text().await?;
            debug!(status, bytes = body.len(), "fetched page");
            Ok::<_, FetchError>(FetchedPage {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
