//! Retry with exponential backoff for transient collaborator failures.

use std::future::Future;
use std::time::Duration;

use driftwatch_core::Classify;
use tracing::warn;

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 5000,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            base_backoff_ms,
            max_backoff_ms,
            use_jitter: true,
        }
    }

    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponential_delay = self
            .base_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)));
        let capped_delay = exponential_delay.min(self.max_backoff_ms);

        if self.use_jitter {
            let jitter_range = (capped_delay / 4).max(1);
            let jitter = rand::random::<u64>() % (2 * jitter_range);
            Duration::from_millis(capped_delay.saturating_add(jitter))
        } else {
            Duration::from_millis(capped_delay)
        }
    }

    #[must_use]
    pub const fn is_retryable(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Run `op`, retrying transient failures per `policy`.
///
/// Non-retryable errors and the last transient error are returned as-is.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.class().is_retryable() && policy.is_retryable(attempt) => {
                let delay = policy.calculate_backoff(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
