//! Token-bucket throttling decorator.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use super::{HandleOutcome, LogClient};
use crate::entry::Entry;
use crate::error::ForwardError;

/// Gates an inner chain behind a token bucket with burst 1.
///
/// When no token is available the record is refused with
/// [`ForwardError::Throttled`] without touching the inner chain; the host
/// retries the flush.
pub struct Throttler {
    inner: Arc<dyn LogClient>,
    limiter: DefaultDirectRateLimiter,
}

impl Throttler {
    /// Wraps `inner` with a bucket refilling `requests_per_sec` tokens.
    pub fn new(inner: Arc<dyn LogClient>, requests_per_sec: NonZeroU32) -> Self {
        let quota = Quota::per_second(requests_per_sec)
            .allow_burst(NonZeroU32::new(1).expect("one is non-zero"));
        Throttler {
            inner,
            limiter: RateLimiter::direct(quota),
        }
    }
}

impl LogClient for Throttler {
    fn handle(&self, entry: Entry) -> Result<HandleOutcome, ForwardError> {
        self.limiter
            .check()
            .map_err(|_| ForwardError::Throttled)?;
        self.inner.handle(entry)
    }

    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn stop_wait(&self) {
        self.inner.stop_wait();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::entry::Labels;

    struct CountingClient {
        handled: AtomicUsize,
    }

    impl LogClient for CountingClient {
        fn handle(&self, _entry: Entry) -> Result<HandleOutcome, ForwardError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(HandleOutcome::Accepted)
        }

        fn endpoint(&self) -> &str {
            "counting"
        }

        fn stop(&self) {}

        fn stop_wait(&self) {}
    }

    fn entry() -> Entry {
        Entry {
            labels: Labels::new(),
            timestamp: Utc::now(),
            line: "x".into(),
        }
    }

    #[test]
    fn excess_records_are_throttled_without_reaching_the_inner_chain() {
        let inner = Arc::new(CountingClient {
            handled: AtomicUsize::new(0),
        });
        let throttler = Throttler::new(
            Arc::clone(&inner) as Arc<dyn LogClient>,
            NonZeroU32::new(1).unwrap(),
        );

        assert!(matches!(
            throttler.handle(entry()),
            Ok(HandleOutcome::Accepted)
        ));
        // Burst is one; the second record in the same second is refused.
        assert!(matches!(
            throttler.handle(entry()),
            Err(ForwardError::Throttled)
        ));
        assert_eq!(inner.handled.load(Ordering::SeqCst), 1);
    }
}
