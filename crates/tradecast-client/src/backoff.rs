use std::time::Duration;

use rand::Rng;

use crate::options::{Backoff, SessionOptions};

const MIN_DELAY: Duration = Duration::from_millis(100);

/// Computes the wait before reconnect attempt `n` (1-based).
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    interval: Duration,
    backoff: Backoff,
}

impl ReconnectPolicy {
    pub fn new(interval: Duration, backoff: Backoff) -> Self {
        Self { interval, backoff }
    }

    pub fn from_options(options: &SessionOptions) -> Self {
        Self::new(options.reconnect_interval, options.backoff.clone())
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { max, jitter } => {
                let exp = attempt.saturating_sub(1).min(31) as i32;
                let base_ms = self.interval.as_millis() as f64 * 2.0_f64.powi(exp);
                let capped = base_ms.min(max.as_millis() as f64);

                let spread = capped * jitter.clamp(0.0, 1.0);
                let offset = if spread > 0.0 {
                    rand::rng().random_range(-spread..=spread)
                } else {
                    0.0
                };
                Duration::from_millis((capped + offset) as u64).max(MIN_DELAY)
            }
        }
    }
}
