//! Retry utilities for calls to external collaborators.
//!
//! Provides a configurable retry policy with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Classification hooks an error type must provide for retry decisions.
pub trait Retryable {
    /// Whether the failure is transient and worth retrying.
    fn is_retryable(&self) -> bool;

    /// Server-suggested wait before the next attempt, if any.
    ///
    /// When present it replaces the computed backoff and acts as a floor:
    /// jitter never shortens the wait below it.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial backoff duration before first retry.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff duration.
    pub add_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1500),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy with the specified max retries.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy for quick retries (smaller backoffs).
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Calculate backoff duration for a given attempt.
    ///
    /// A server-suggested `floor` replaces the exponential value and is the
    /// minimum wait even with jitter applied.
    fn backoff_duration(&self, attempt: u32, floor: Option<Duration>) -> Duration {
        let computed =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let base_ms = match floor {
            Some(floor) => floor.as_millis() as u64,
            None => computed.min(self.max_backoff.as_millis() as f64) as u64,
        };

        let mut backoff_ms = base_ms;
        if self.add_jitter {
            // Jitter in [0.5x, 1.5x] of the base delay
            let jittered = (base_ms as f64 * (0.5 + rand_jitter())) as u64;
            backoff_ms = if floor.is_some() {
                jittered.max(base_ms)
            } else {
                jittered
            };
        }

        Duration::from_millis(backoff_ms)
    }

    /// Execute an operation with retry logic.
    ///
    /// # Example
    /// ```ignore
    /// let invoice = policy
    ///     .execute("create_invoice", || async {
    ///         api.create_invoice(request.clone()).await
    ///     })
    ///     .await?;
    /// ```
    pub async fn execute<F, Fut, T, E>(&self, operation_name: &str, f: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(result) => {
                    if attempt > 0 {
                        info!(
                            operation = operation_name,
                            attempt = attempt + 1,
                            "Call succeeded after retry"
                        );
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !error.is_retryable() {
                        warn!(
                            operation = operation_name,
                            error = %error,
                            "Call failed with non-retryable error"
                        );
                        return Err(error);
                    }

                    if attempt >= self.max_retries {
                        warn!(
                            operation = operation_name,
                            attempt = attempt + 1,
                            error = %error,
                            "Call failed after max retries"
                        );
                        return Err(error);
                    }

                    let backoff = self.backoff_duration(attempt, error.retry_after());
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %error,
                        backoff_ms = backoff.as_millis(),
                        "Call failed, retrying after backoff"
                    );

                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external dependencies.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}
