//! Retry logic for listener binds.
//!
//! The default policy retries forever with a fixed delay. A ceiling on the
//! number of attempts, exponential growth and jitter can each be turned on.
//! Every wait observes a [`CancellationToken`] so a stopping server never
//! waits out a retry delay.

use crate::cancel::CancellationToken;
use crate::config::duration_ms;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts including the first one; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Maximum delay cap.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Growth factor per attempt; 1.0 keeps the delay fixed.
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(crate::config::RpcDefaults::POLL_DELAY)
    }
}

impl RetryConfig {
    /// Unbounded retries with a fixed delay.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            base_delay: delay,
            max_delay: delay,
            exponential_base: 1.0,
            jitter: false,
        }
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Grow the delay by `base` per attempt up to `max_delay`.
    pub fn with_backoff(mut self, base: f64, max_delay: Duration) -> Self {
        self.exponential_base = base;
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay after a given failed attempt (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if self.exponential_base == 1.0 && !self.jitter {
            return self.base_delay;
        }

        let multiplier = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let cap = self.max_delay.max(self.base_delay).as_secs_f64();
        let capped_secs = delay_secs.min(cap);

        let final_secs = if self.jitter {
            // Scale by 0.5..1.5 so the mean delay is unchanged.
            let mut rng = rand::rng();
            let jitter_factor = rng.random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(cap)
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }

    fn attempts_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Outcome of a retried operation that was not a success.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with a non-retryable error or ran out of attempts.
    Failed(E),
    /// Cancellation was requested while waiting to retry.
    Cancelled,
}

/// Statistics about a retry operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Total delay accumulated.
    pub total_delay: Duration,
    /// Last error message if any attempt failed.
    pub last_error: Option<String>,
}

/// Retry an async operation until it succeeds, fails permanently, exhausts
/// its attempts or `cancel` fires.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (std::result::Result<T, RetryError<E>>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return (Err(RetryError::Cancelled), stats);
        }

        stats.attempts = attempt.saturating_add(1);

        let error = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", stats.attempts);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };

        stats.last_error = Some(error.to_string());

        if !should_retry(&error) {
            debug!("Error is not retryable: {}", error);
            return (Err(RetryError::Failed(error)), stats);
        }

        if config.attempts_exhausted(stats.attempts) {
            warn!(
                "All {} retry attempts exhausted. Last error: {}",
                stats.attempts, error
            );
            return (Err(RetryError::Failed(error)), stats);
        }

        let delay = config.calculate_delay(attempt);
        stats.total_delay += delay;

        warn!(
            "Attempt {} failed: {}. Retrying in {:?}",
            stats.attempts, error, delay
        );

        if !cancel.sleep(delay).await {
            return (Err(RetryError::Cancelled), stats);
        }

        attempt = attempt.saturating_add(1);
    }
}
