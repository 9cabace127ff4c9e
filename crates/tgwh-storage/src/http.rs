//! Shared HTTP client for the history gateway: bounded concurrency (overall
//! and per channel), optional request pacing, capped exponential retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// Longest pause honoured from a server `Retry-After` header.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): doubles each time, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.ceiling)
    }

    pub fn retryable_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    pub fn retryable_error(err: &reqwest::Error) -> bool {
        err.is_connect() || err.is_timeout()
    }
}

fn server_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER))
}

/// Spaces requests at least `interval` apart across the whole client.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_channel: usize,
    pub min_request_interval: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            max_in_flight: 4,
            max_in_flight_per_channel: 1,
            min_request_interval: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    Status { status: StatusCode, url: String },
    #[error("http client closed")]
    Closed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(status.as_u16()),
            FetchError::Transport(err) => err.status().map(|s| s.as_u16()),
            FetchError::Closed => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_channel_limit: usize,
    per_channel: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("gateway token contains characters not allowed in a header")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true)
            .default_headers(headers);
        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.as_str());
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_channel_limit: config.max_in_flight_per_channel.max(1),
            per_channel: Mutex::new(HashMap::new()),
            pacer: config.min_request_interval.map(RequestPacer::new),
            retry: config.retry,
        })
    }

    async fn channel_gate(&self, scope: &str) -> Arc<Semaphore> {
        let mut gates = self.per_channel.lock().await;
        if let Some(gate) = gates.get(scope) {
            return gate.clone();
        }
        let gate = Arc::new(Semaphore::new(self.per_channel_limit));
        gates.insert(scope.to_string(), gate.clone());
        gate
    }

    /// GET `url` and return the whole body. `scope` is the channel the
    /// request belongs to and bounds its own concurrency.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        scope: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let gate = self.channel_gate(scope).await;
        let _channel_permit = gate.acquire().await.map_err(|_| FetchError::Closed)?;
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;

        self.get_with_retry(url)
            .instrument(info_span!("http_fetch", %run_id, channel = scope, url))
            .await
    }

    async fn get_with_retry(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.wait_turn().await;
            }
            let out_of_retries = retry >= self.retry.retries;

            let delay = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if out_of_retries || !RetryPolicy::retryable_status(status) {
                        return Err(FetchError::Status {
                            status,
                            url: resp.url().to_string(),
                        });
                    }
                    let ours = self.retry.backoff(retry);
                    let delay = server_retry_after(resp.headers()).map_or(ours, |theirs| theirs.max(ours));
                    debug!(status = status.as_u16(), retry, ?delay, "retrying after status");
                    delay
                }
                Err(err) => {
                    if out_of_retries || !RetryPolicy::retryable_error(&err) {
                        return Err(FetchError::Transport(err));
                    }
                    let delay = self.retry.backoff(retry);
                    debug!(error = %err, retry, ?delay, "retrying after transport error");
                    delay
                }
            };
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let policy = RetryPolicy {
            retries: 6,
            initial_delay: Duration::from_millis(100),
            ceiling: Duration::from_millis(350),
        };
        let delays: Vec<_> = (0..4).map(|r| policy.backoff(r).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn only_throttling_and_server_errors_are_retried() {
        assert!(RetryPolicy::retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(RetryPolicy::retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!RetryPolicy::retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!RetryPolicy::retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn server_retry_after_is_capped() {
        let mut headers = HeaderMap::new();
        assert_eq!(server_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static(" 12 "));
        assert_eq!(server_retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("3600"));
        assert_eq!(server_retry_after(&headers), Some(MAX_RETRY_AFTER));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(server_retry_after(&headers), None);
    }

    #[test]
    fn status_is_exposed_for_callers() {
        let err = FetchError::Status {
            status: StatusCode::FORBIDDEN,
            url: "http://gateway/v1/auth/check".into(),
        };
        assert_eq!(err.status(), Some(403));
        assert_eq!(FetchError::Closed.status(), None);
    }

    #[tokio::test]
    async fn pacer_spaces_consecutive_requests() {
        let pacer = RequestPacer::new(Duration::from_millis(40));
        let started = Instant::now();
        pacer.wait_turn().await;
        assert!(started.elapsed() < Duration::from_millis(40));
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn invalid_token_is_rejected() {
        let err = HttpFetcher::new(HttpClientConfig {
            bearer_token: Some("line\nbreak".into()),
            ..Default::default()
        })
        .expect_err("must fail");
        assert!(err.to_string().contains("gateway token"));
    }
}
