//! Exponential backoff with full jitter.

use std::time::Duration;

use rand::Rng;

/// Retry settings for one send chain.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// First delay.
    pub min_backoff: Duration,
    /// Delay ceiling.
    pub max_backoff: Duration,
    /// Delivery attempts before the batch is parked for a later cycle.
    pub max_retries: usize,
}

/// An iterator of capped, doubling delays.
///
/// Each yielded delay is jittered across its full range so synchronized
/// chains do not hammer a recovering backend in lockstep.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    current: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at `min` and doubling up to `max`.
    pub fn new(min: Duration, max: Duration) -> Self {
        ExponentialBackoff {
            current: min.max(Duration::from_millis(1)),
            max: max.max(min),
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let millis = base.as_millis() as u64;
        let jittered = rand::rng().random_range(millis / 2..=millis);
        Some(Duration::from_millis(jittered))
    }
}
