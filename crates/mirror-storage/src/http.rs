//! Outbound JSON requests for source adapters. Rate-limit handling lives here,
//! below the sync core: bounded timeouts, global and per-source concurrency
//! caps, an optional request-rate limiter and retries that honour `Retry-After`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mirror_core::JobId;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again, waiting at least the server's hint when it sent one.
    Retry { hint: Option<Duration> },
    GiveUp,
}

fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub fn decide_for_status(status: StatusCode, headers: &HeaderMap) -> RetryDecision {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => RetryDecision::Retry {
            hint: retry_after_hint(headers),
        },
        s if s.is_server_error() => RetryDecision::Retry { hint: None },
        _ => RetryDecision::GiveUp,
    }
}

pub fn decide_for_transport(err: &reqwest::Error) -> RetryDecision {
    if err.is_timeout() || err.is_connect() {
        RetryDecision::Retry { hint: None }
    } else {
        RetryDecision::GiveUp
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl BackoffPolicy {
    /// Exponential delay for retry number `retry` (0-based), raised to the
    /// server hint, never above `max_delay`.
    pub fn wait(&self, retry: usize, hint: Option<Duration>) -> Duration {
        let exponent = u32::try_from(retry).unwrap_or(u32::MAX).min(16);
        let computed = self.base_delay.saturating_mul(1u32 << exponent);
        computed.max(hint.unwrap_or_default()).min(self.max_delay)
    }
}

/// Steady request rate with a burst allowance.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub per_second: f64,
    pub burst: u32,
}

/// Continuous-refill limiter shared by every request of one fetcher.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    bucket: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            bucket: Mutex::new((f64::from(limit.burst.max(1)), Instant::now())),
        }
    }

    pub async fn acquire(&self) {
        let capacity = f64::from(self.limit.burst.max(1));
        let rate = self.limit.per_second.max(f64::EPSILON);
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let (tokens, refilled_at) = &mut *bucket;
                let now = Instant::now();
                *tokens = (*tokens + now.duration_since(*refilled_at).as_secs_f64() * rate).min(capacity);
                *refilled_at = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - *tokens) / rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

impl HttpClientConfig {
    /// Upper bound on one `get_json` call: every attempt timing out plus the
    /// longest wait between attempts. Rate-limiter pacing is not included.
    pub fn worst_case(&self) -> Duration {
        let retries = u32::try_from(self.backoff.max_retries).unwrap_or(u32::MAX);
        self.timeout
            .saturating_mul(retries.saturating_add(1))
            .saturating_add(self.backoff.max_delay.saturating_mul(retries))
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {message}")]
    Decode { url: String, message: String },
    #[error("fetcher is shutting down")]
    Closed,
}

/// Shared client used by every HTTP-backed adapter.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global: Arc<Semaphore>,
    per_source_limit: usize,
    // Keyed by registry source id, so it is bounded by the connector registry.
    sources: Mutex<HashMap<String, Arc<Semaphore>>>,
    limiter: Option<RateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build()?,
            global: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            sources: Mutex::new(HashMap::new()),
            limiter: config.rate_limit.map(RateLimiter::new),
            backoff: config.backoff,
        })
    }

    /// GETs `url` and decodes the body as JSON.
    pub async fn get_json(
        &self,
        job_id: JobId,
        source_id: &str,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<Value, FetchError> {
        let source_slot = {
            let mut sources = self.sources.lock().await;
            Arc::clone(
                sources
                    .entry(source_id.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit))),
            )
        };
        let _global = self.global.acquire().await.map_err(|_| FetchError::Closed)?;
        let _source = source_slot.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %job_id, source_id, url);
        self.get_with_retries(url, bearer_token).instrument(span).await
    }

    async fn get_with_retries(
        &self,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<Value, FetchError> {
        let mut retry = 0;
        loop {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }

            let mut request = self.client.get(url).header("accept", "application/json");
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            let (decision, err) = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?;
                    debug!(bytes = body.len(), "response received");
                    return serde_json::from_slice(&body).map_err(|err| FetchError::Decode {
                        url: final_url,
                        message: err.to_string(),
                    });
                }
                Ok(resp) => (
                    decide_for_status(resp.status(), resp.headers()),
                    FetchError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: resp.url().to_string(),
                    },
                ),
                Err(err) => (decide_for_transport(&err), FetchError::Request(err)),
            };

            match decision {
                RetryDecision::Retry { hint } if retry < self.backoff.max_retries => {
                    let wait = self.backoff.wait(retry, hint);
                    warn!(retry, wait_ms = wait.as_millis() as u64, error = %err, "retrying source request");
                    tokio::time::sleep(wait).await;
                    retry += 1;
                }
                _ => return Err(err),
            }
        }
    }
}
