//! Retry of remote-store calls
//!
//! Transient errors (network, rate limiting, server errors) are retried with
//! exponential backoff: 1s, 2s, 4s, 8s, 16s by default. Anything else is
//! returned to the caller immediately.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

/// Default maximum number of retries for transient errors
pub const MAX_RETRIES: u32 = 5;

/// Default base delay for exponential backoff
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Backoff parameters for [`with_retry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// A policy that never retries
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: BASE_DELAY,
        }
    }
}

/// Determines whether an error is transient (retryable)
///
/// Transient errors include:
/// - Network errors (connection refused, timeout, DNS)
/// - Rate limiting (HTTP 429)
/// - Server errors (HTTP 5xx)
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    let err_str = format!("{err:#}").to_lowercase();

    let network = [
        "network",
        "connection",
        "timed out",
        "timeout",
        "dns",
        "reset by peer",
        "broken pipe",
    ];
    let throttled = ["429", "too many requests", "rate limit"];
    let server = ["500", "502", "503", "504", "server error"];

    network
        .iter()
        .chain(throttled.iter())
        .chain(server.iter())
        .any(|needle| err_str.contains(needle))
}

/// Runs `f` until it succeeds, fails permanently or the policy is exhausted
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation_name: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_retries && is_transient_error(&err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
