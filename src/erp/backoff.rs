/// Exponential backoff with jitter for in-strategy retries.
///
/// Used between exchange-config attempts while the firmware reports its
/// host connection as still initializing. Jitter avoids hammering a
/// firmware that is mid-reset on a fixed cadence.
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Jitter factor (0.0 - 1.0) - adds randomness to delay.
    jitter_factor: f64,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor: 0.3,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Calculate exponential delay with jitter: base * 2^attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential_ms = self
            .base_delay
            .as_millis()
            .saturating_mul(2_u128.saturating_pow(attempt.min(32)));
        let capped_ms = exponential_ms.min(self.max_delay.as_millis());

        let jitter_range = capped_ms as f64 * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
        let final_ms = (capped_ms as f64 + jitter).max(0.0);

        Duration::from_millis(final_ms as u64)
    }
}
