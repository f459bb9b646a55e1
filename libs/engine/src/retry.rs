//! Exponential backoff retry executor.
//!
//! `delay(attempt) = min(max_delay, base_delay * multiplier^attempt) ± jitter`
//!
//! Transient failures are retried up to `max_retries` times. Cancellation is
//! re-raised immediately and permanent failures are returned as-is.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::FetchError;

/// Observer invoked before each retry with `(error, attempt, next_delay)`.
///
/// `attempt` is 1 for the first retry.
pub type RetryObserver = Arc<dyn Fn(&FetchError, u32, Duration) + Send + Sync>;

/// Exponential backoff configuration.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Growth factor per retry.
    pub multiplier: f64,

    /// Maximum delay.
    pub max_delay: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,

    /// Diagnostics hook called before each retry.
    pub observer: Option<RetryObserver>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(30),
            jitter: 0.5,
            observer: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt + 1` (0-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Calculate delay for the given attempt number, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::from_secs_f64(delay);
        }

        let spread = delay * jitter;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((delay + offset).max(0.0))
    }

    /// Runs `op` until it succeeds, fails permanently, is cancelled, or the
    /// retry budget is spent.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0u32;

        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if error.is_cancelled() {
                debug!(attempt, "Operation cancelled, not retrying");
                return Err(error);
            }

            if !error.is_retryable() || attempt >= self.max_retries {
                return Err(error);
            }

            let delay = self.delay(attempt);
            attempt += 1;

            warn!(
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis(),
                error = %error,
                "Operation failed, scheduling retry"
            );

            if let Some(observer) = &self.observer {
                observer(&error, attempt, delay);
            }

            tokio::time::sleep(delay).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
