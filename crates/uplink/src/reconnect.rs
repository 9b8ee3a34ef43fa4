use std::time::Duration;

/// Shared exponential backoff parameters used by retries and stream
/// reconnection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct BackoffConfig {
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) factor: f64,
}

impl BackoffConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.max_delay < self.initial_delay {
            return Err("Max delay must be >= initial delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        Ok(())
    }
}

/// `min(initial * factor^attempt, max)`, without jitter.
pub(crate) fn calculate_backoff(config: BackoffConfig, attempt: u32) -> Duration {
    let initial = config.initial_delay.as_secs_f64();
    let max = config.max_delay.as_secs_f64();
    let exponent = config.factor.powf(f64::from(attempt));
    let base = (initial * exponent).min(max);

    if !base.is_finite() || base < 0.0 {
        return config.max_delay;
    }
    Duration::from_secs_f64(base)
}
