use std::time::Duration;

/// Exponential backoff sequence.
///
/// `get(1)` is `min`, each following try multiplies the delay by `multiplier`, capped at `max`.
/// Try index `0` means "no failure yet" and yields zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDelays {
    /// Delay after the first failure.
    pub min: Duration,
    /// Upper bound of the delay.
    pub max: Duration,
    /// Growth factor between consecutive tries.
    pub multiplier: f64,
}

impl RetryDelays {
    /// Create a new exponential sequence.
    pub fn exponential(min: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            min,
            max,
            multiplier,
        }
    }

    /// A sequence that always yields `delay`.
    pub fn fixed(delay: Duration) -> Self {
        Self::exponential(delay, delay, 1.0)
    }

    /// Delay for the given try index.
    pub fn get(&self, try_index: u32) -> Duration {
        if try_index == 0 {
            return Duration::ZERO;
        }
        let exponent = try_index.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.min.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs).max(self.min)
    }
}

impl Default for RetryDelays {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(10), 1.5)
    }
}
