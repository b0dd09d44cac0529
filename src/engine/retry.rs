//! Backoff loop for store and rail calls that fail transiently.
//!
//! Only errors classed `Concurrency` or `External` are retried; anything
//! else comes straight back. Each attempt is bounded by `attempt_timeout`
//! and the delay between attempts doubles up to `max_backoff`.

use std::future::Future;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tracing::warn;

use crate::types::Classified;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first; `None` retries until success or a
    /// non-retryable error.
    pub max_attempts: Option<u32>,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(2u32.pow(exp))
            .min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable class, or the
/// policy's attempts run out. A timed-out final attempt is reported through
/// `E: From<Elapsed>`.
pub async fn retry_transient<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classified + From<Elapsed>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        let failure = match tokio::time::timeout(policy.attempt_timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.class().is_retryable() => return Err(e),
            Ok(Err(e)) => {
                warn!(what, attempt, code = e.code(), error = %e, "Transient failure");
                e
            }
            Err(elapsed) => {
                warn!(
                    what,
                    attempt,
                    timeout_ms = policy.attempt_timeout.as_millis() as u64,
                    "Attempt timed out"
                );
                E::from(elapsed)
            }
        };
        if policy.max_attempts.is_some_and(|max| attempt >= max.max(1)) {
            return Err(failure);
        }
        tokio::time::sleep(policy.backoff(attempt)).await;
    }
}
