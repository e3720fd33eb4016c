//! Retry Helper
//!
//! Bounded exponential-backoff wrapper for idempotent venue calls and ledger
//! commits. Only transient failure classes retry (timeouts, connection
//! errors, DNS, 5xx, file I/O); anything else fails immediately. The
//! outcome is always a value, never a propagated error, so callers treat an
//! exhausted retry as "no update" and move on.

use std::future::Future;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Retry schedule: `base * 2^(attempt-1)`, capped at `max_delay_ms`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 300,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Result of a retried operation. `data` is present iff `success`.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub attempts: u32,
    pub total_time_ms: u64,
}

impl<T> RetryOutcome<T> {
    /// Collapse the outcome to its payload; exhausted retries become `None`.
    pub fn into_data(self) -> Option<T> {
        self.data
    }
}

/// Whether an error belongs to a transient class worth retrying: request
/// timeouts, connection/DNS failures, HTTP 5xx, and file I/O hiccups.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(req) = cause.downcast_ref::<reqwest::Error>() {
            if req.is_timeout() || req.is_connect() || req.is_request() {
                return true;
            }
            if let Some(status) = req.status() {
                if status.is_server_error() {
                    return true;
                }
            }
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
    }
    false
}

/// Drive `op` until it succeeds, fails non-retryably, or exhausts the
/// policy. `what` labels the operation in logs.
pub async fn run<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let started = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match op().await {
            Ok(data) => {
                return RetryOutcome {
                    success: true,
                    data: Some(data),
                    error: None,
                    attempts,
                    total_time_ms: started.elapsed().as_millis() as u64,
                };
            }
            Err(e) => {
                let retryable = is_retryable(&e);
                if !retryable || attempts >= policy.max_attempts {
                    if retryable {
                        warn!(what, attempts, error = %e, "Retries exhausted");
                    } else {
                        debug!(what, error = %e, "Non-retryable failure");
                    }
                    return RetryOutcome {
                        success: false,
                        data: None,
                        error: Some(format!("{e:#}")),
                        attempts,
                        total_time_ms: started.elapsed().as_millis() as u64,
                    };
                }
                let delay = policy.delay_for(attempts);
                debug!(
                    what,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, backing off"
                );
                sleep(delay).await;
            }
        }
    }
}
