//! Bounded retry transport for non-streaming calls.
//!
//! Streaming calls never go through here: a retried partial stream would
//! deliver duplicated tokens.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::warn;

use crate::config::Config;
use crate::error::PipeError;

/// Statuses that trigger a retry.
pub const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Upper bound for any single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Retry count plus exponential backoff.
///
/// Applies to every HTTP method, POST included.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Seconds; delay before retry `n` is `factor * 2^(n-1)`, except the
    /// first retry which is immediate.
    pub backoff_factor: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            backoff_factor: backoff_factor.max(0.0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.retries_non_stream, config.retry_backoff_factor)
    }

    /// A policy that sends exactly once.
    pub fn none() -> Self {
        Self::new(0, 0.0)
    }

    pub fn is_retryable_status(status: StatusCode) -> bool {
        RETRY_STATUSES.contains(&status.as_u16())
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry <= 1 || self.backoff_factor <= 0.0 {
            return Duration::ZERO;
        }
        let secs = self.backoff_factor * 2f64.powi(retry as i32 - 1);
        if !secs.is_finite() || secs >= MAX_BACKOFF.as_secs_f64() {
            MAX_BACKOFF
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Send the request built by `build`, retrying transient failures.
    ///
    /// `build` is invoked once per attempt. When retries run out on a
    /// retryable status, the last response is returned as-is so the caller
    /// can report it.
    pub async fn send<F>(&self, build: F) -> Result<Response, PipeError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retry = 0u32;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if retry >= self.max_retries || !Self::is_retryable_status(status) {
                        return Ok(resp);
                    }
                    retry += 1;
                    let delay = retry_after(&resp).unwrap_or_else(|| self.backoff(retry));
                    warn!(
                        status = status.as_u16(),
                        retry,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "retryable gateway status"
                    );
                    drop(resp);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if retry >= self.max_retries || err.is_builder() {
                        return Err(PipeError::network(&err));
                    }
                    retry += 1;
                    let delay = self.backoff(retry);
                    warn!(
                        error = %err,
                        retry,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "gateway request failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn retry_after(resp: &Response) -> Option<Duration> {
    retry_after_delay(resp.status(), resp.headers())
}

/// `Retry-After` in whole seconds, honoured for 429 and 503 only and
/// capped at [`MAX_BACKOFF`].
pub fn retry_after_delay(status: StatusCode, headers: &HeaderMap) -> Option<Duration> {
    if !matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
    ) {
        return None;
    }
    let secs: u64 = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    Some(Duration::from_secs(secs).min(MAX_BACKOFF))
}
