use std::time::Duration;

use rand::Rng;

/// Bounded retry budget with jittered exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter_pct: f64) -> Self {
        let base_delay = base_delay.max(Duration::from_millis(1));
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// A policy that never retries.
    pub fn once() -> Self {
        Self::new(1, Duration::from_millis(1), Duration::from_millis(1), 0.0)
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped, then jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2_u32.saturating_pow(attempt);
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        if self.jitter_pct <= 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter_pct;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(5), Duration::from_millis(100), 0.2)
    }
}
