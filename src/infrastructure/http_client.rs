//! HTTP client for bulletin fetching with rate limiting and retries
//!
//! All failures are reified as values; the client never panics into the
//! pipeline. Retries apply to transport errors and 5xx responses only.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::HttpConfig;

/// Terminal outcome of fetching one URL.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// 404 means the bulletin does not exist. Not retried.
    #[error("bulletin not found (404)")]
    NotFound,

    /// Any other non-retryable status.
    #[error("terminal HTTP status {status}")]
    Terminal { status: u16 },

    /// Transport errors and 5xx responses after all retries.
    #[error("retries exhausted after {retries} attempts: {last_error}")]
    Exhausted { retries: u32, last_error: String },

    #[error("request cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_retry_exhaustion(&self) -> bool {
        matches!(self, FetchError::Exhausted { .. })
    }
}

/// Shared HTTP client. One instance per process; the underlying reqwest
/// client pools connections across workers.
pub struct HttpClient {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    config: HttpConfig,
}

impl HttpClient {
    pub fn new(config: HttpConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|_| anyhow::anyhow!("invalid user agent '{}'", config.user_agent))?,
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .connect_timeout(Duration::from_secs(config.timeout_seconds))
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;

        let quota = Quota::per_second(
            NonZeroU32::new(config.max_requests_per_second)
                .ok_or_else(|| anyhow::anyhow!("max_requests_per_second must be greater than 0"))?,
        );
        let rate_limiter = RateLimiter::direct(quota);

        Ok(Self {
            client,
            rate_limiter,
            config,
        })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Fetch a URL body with bounded retries, exponential backoff and
    /// cooperative cancellation.
    pub async fn fetch_with_retries(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let max_attempts = self.config.retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            tokio::select! {
                _ = self.rate_limiter.until_ready() => {}
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            }

            debug!(url, attempt, "fetching bulletin page");

            let response = tokio::select! {
                result = self.client.get(url).send() => result,
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            };

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = tokio::select! {
                            result = response.text() => result,
                            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        };
                        match body {
                            Ok(text) => {
                                debug!(url, bytes = text.len(), "fetched");
                                return Ok(text);
                            }
                            Err(e) => last_error = format!("body read failed: {e}"),
                        }
                    } else if status == StatusCode::NOT_FOUND {
                        return Err(FetchError::NotFound);
                    } else if status.is_client_error() {
                        return Err(FetchError::Terminal {
                            status: status.as_u16(),
                        });
                    } else {
                        last_error = format!("server returned {status}");
                    }
                }
                Err(e) => last_error = e.to_string(),
            }

            if attempt < max_attempts {
                let delay = backoff_delay(attempt);
                warn!(url, attempt, delay_ms = delay.as_millis() as u64, error = %last_error,
                    "retrying after transient failure");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                }
            }
        }

        Err(FetchError::Exhausted {
            retries: self.config.retries,
            last_error,
        })
    }

    /// Cheap reachability probe. Reports whether the URL answers without
    /// downloading the body.
    pub async fn verify_url(&self, url: &str) -> bool {
        self.rate_limiter.until_ready().await;
        match self.client.head(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url, error = %e, "verification probe failed");
                false
            }
        }
    }
}

/// Exponential backoff with jitter: base 1 s, factor 2, jitter within ±20%.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1000u64;
    let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let capped = exponential.min(30_000);
    let jitter_factor = 0.8 + fastrand::f64() * 0.4;
    Duration::from_millis((capped as f64 * jitter_factor) as u64)
}
