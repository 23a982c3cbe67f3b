//! Retry policy shared by every remote call site

use std::time::Duration;

/// Exponential backoff with a ceiling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Attempts after which failures are reported (retries continue at the cap)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Growth factor per consecutive failure, clamped to at least 1.0
    pub multiplier: f64,
    /// Ceiling for any single delay
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the `attempt`-th consecutive failure (1-based)
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.max_delay.as_millis() as f64;
        let base = (self.base_delay.as_millis() as f64).min(ceiling);
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = if self.multiplier.is_finite() {
            self.multiplier.max(1.0).powi(exponent)
        } else {
            1.0
        };

        let millis = (base * factor).min(ceiling);
        if millis.is_finite() {
            Duration::from_millis(millis as u64)
        } else {
            self.max_delay
        }
    }

    /// Whether `attempt` failures reach the reporting ceiling
    pub const fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
