use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{ReaderError, ReaderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(1_000),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: the wait after attempt `n` (1-based) is `n × backoff`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

/// Runs `op` until it succeeds or the policy's attempts are used up.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> ReaderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(attempt, attempts, %label, error = %err, "persistence attempt failed");
                last_error = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
            }
        }
    }
    Err(ReaderError::SaveFailed {
        attempts,
        message: last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "unknown error".to_owned()),
    })
}
