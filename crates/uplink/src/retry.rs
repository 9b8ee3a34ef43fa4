//! Generic retry loop with exponential backoff.
//!
//! The pipeline never retries on its own; callers opt in by wrapping an
//! operation in [`with_retry`], usually together with
//! [`classify::is_retryable`](crate::classify::is_retryable):
//!
//! ```rust,no_run
//! use uplink::{ApiClient, AppError, RetryConfig, classify::is_retryable, retry::with_retry};
//!
//! # async fn run(client: ApiClient) -> Result<(), AppError> {
//! let config = RetryConfig::default();
//! let user: serde_json::Value = with_retry(
//!     || client.get("/users/me"),
//!     &config,
//!     Some(&is_retryable),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::{fmt, future::Future, time::Duration};

use tokio::time::sleep;

use crate::{
    error::{TransportError, TransportResult},
    reconnect::{BackoffConfig, calculate_backoff},
};

/// Retry parameters. Consumed per call, never mutated mid-sequence.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Base of the exponential growth per attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a configuration with the given attempt budget and default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> TransportResult<()> {
        self.backoff().validate().map_err(TransportError::config)
    }

    fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            factor: self.backoff_multiplier,
        }
    }
}

/// Delay to wait after the failure of attempt `attempt` (zero-based).
pub fn compute_delay(attempt: u32, config: &RetryConfig) -> Duration {
    calculate_backoff(config.backoff(), attempt)
}

/// Run `operation` until it succeeds, the predicate rejects an error, or the
/// attempt budget is spent.
///
/// The last error is returned unchanged. With `max_attempts == 0` the
/// operation is never invoked and a configuration error is returned instead.
pub async fn with_retry<T, E, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
    is_retryable: Option<&(dyn Fn(&E) -> bool + Send + Sync)>,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<TransportError> + fmt::Display,
{
    if config.max_attempts == 0 {
        return Err(E::from(TransportError::config(
            "no retry attempts configured",
        )));
    }

    let mut attempt = 0;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if let Some(predicate) = is_retryable
            && !predicate(&error)
        {
            tracing::debug!(attempt, %error, "Error is not retryable");
            return Err(error);
        }

        attempt += 1;
        if attempt >= config.max_attempts {
            tracing::warn!(attempts = attempt, %error, "Retry attempts exhausted");
            return Err(error);
        }

        let delay = compute_delay(attempt - 1, config);
        tracing::info!(
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            %error,
            "Retrying operation"
        );
        sleep(delay).await;
    }
}
