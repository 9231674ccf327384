//! Retry budgeting with exponential backoff and jitter

use std::time::Duration;

/// How to space repeated attempts at a failing operation
///
/// Delays grow geometrically from `initial_delay` up to `max_delay`. With the
/// `rand` feature, each computed delay is additionally jittered down to a
/// uniform value in `(0, delay]` to spread out competing retriers.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first (default: 3)
    pub max_attempts: u32,
    /// Delay after the first failure (default: 500 ms)
    pub initial_delay: Duration,
    /// Ceiling on any single delay (default: 15 seconds)
    pub max_delay: Duration,
    /// Growth factor between failures (default: 2)
    pub multiplier: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `completed` failed attempts
    pub fn allows_retry(&self, completed: u32) -> bool {
        completed + 1 < self.max_attempts
    }

    /// The delay to wait after the failure of attempt `completed` (zero-based)
    ///
    /// The returned delay is already jittered when the `rand` feature is
    /// enabled.
    pub fn delay_after(&self, completed: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(completed);
        let raw = Duration::from_millis(
            (self.initial_delay.as_millis() as u64).saturating_mul(factor),
        )
        .min(self.max_delay);
        jitter(raw)
    }
}

#[cfg(feature = "rand")]
fn jitter(delay: Duration) -> Duration {
    use rand::Rng;

    let millis = delay.as_millis() as u64;
    if millis == 0 {
        return delay;
    }
    Duration::from_millis(rand::thread_rng().gen_range(1..=millis))
}

#[cfg(not(feature = "rand"))]
fn jitter(delay: Duration) -> Duration {
    delay
}
