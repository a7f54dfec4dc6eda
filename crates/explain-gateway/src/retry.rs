//! Bounded retry with fixed backoff

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Anything carrying an HTTP status code
pub trait ResponseStatus {
    fn status_code(&self) -> u16;
}

impl ResponseStatus for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }
}

/// How often and when to repeat a request.
///
/// An attempt is repeated when it fails at the transport level or answers
/// one of `retryable_statuses`. Any other response ends the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; never less than one
    pub max_attempts: u32,
    /// Pause between attempts
    pub backoff: Duration,
    pub retryable_statuses: Vec<u16>,
}

impl RetryPolicy {
    /// One retry after 500 ms on transport failure, 429 or 5xx gateway errors
    pub fn gateway() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_millis(500),
            retryable_statuses: vec![429, 500, 502, 503, 504],
        }
    }

    /// Policy for the local HTTP client: up to three retries on 502/503/504
    pub fn api_client() -> Self {
        Self {
            max_attempts: 4,
            backoff: Duration::from_millis(300),
            retryable_statuses: vec![502, 503, 504],
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Run `op` until it succeeds with a final status or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. The last outcome is returned
    /// as is, so a caller still sees the status or error that ended the loop.
    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: ResponseStatus,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = op(attempt).await;
            let reason = match &outcome {
                Ok(response) if self.is_retryable(response.status_code()) => {
                    format!("HTTP {}", response.status_code())
                }
                Ok(_) => return outcome,
                Err(e) => e.to_string(),
            };

            if attempt >= attempts {
                debug!("Giving up after {} attempts: {}", attempt, reason);
                return outcome;
            }

            warn!(
                attempt,
                max_attempts = attempts,
                "Request failed ({}), retrying in {:?}",
                reason,
                self.backoff
            );
            tokio::time::sleep(self.backoff).await;
            attempt += 1;
        }
    }
}
