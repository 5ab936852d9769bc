use std::{future::Future, time::Duration};
use tracing::{debug, warn};

use crate::error::LookupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Upper bound on time spent sleeping between attempts. Every wait,
    /// including one requested by `Retry-After`, is capped at `max_backoff`.
    pub fn max_total_backoff(&self) -> Duration {
        self.max_backoff * self.max_attempts.max(1).saturating_sub(1)
    }

    fn wait_for(&self, err: &LookupError, backoff: Duration) -> Duration {
        err.retry_after().unwrap_or(backoff).min(self.max_backoff)
    }
}

#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, LookupError>,
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up. Waits double after each transient failure
/// unless the server asked for a specific delay. No single wait exceeds
/// `max_backoff`.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LookupError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut backoff = policy.initial_backoff;

    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "lookup succeeded after retry");
                }
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(err) if err.is_retryable() && attempt < attempts => {
                let wait = policy.wait_for(&err, backoff);
                warn!(
                    label,
                    attempt,
                    max_attempts = attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "transient lookup failure, retrying"
                );
                tokio::time::sleep(wait).await;
                backoff = (backoff + backoff).min(policy.max_backoff);
                attempt += 1;
            }
            Err(err) => {
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                };
            }
        }
    }
}
