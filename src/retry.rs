//! Caller-side retry with a fixed delay.
//!
//! The API client never retries on its own; the controller wraps calls in
//! [`with_retry`]. Only transient failures are retried (see
//! [`ApiError::is_transient`]): timeouts, transport errors, HTTP 429 and
//! 5xx. Validation errors and other 4xx responses fail on the first attempt.

use std::future::Future;
use std::time::Duration;

use crate::config::ApiConfig;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn from_config(api: &ApiConfig) -> Self {
        Self::new(api.retry_attempts, api.retry_delay())
    }

    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                tracing::warn!(
                    operation = label,
                    attempt,
                    max_attempts = policy.attempts,
                    error = %e,
                    "attempt failed, retrying in {}ms",
                    policy.delay.as_millis()
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
