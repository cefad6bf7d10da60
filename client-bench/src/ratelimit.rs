//! Shared token-bucket rate limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A coarse token bucket refilled from elapsed wall time.
///
/// Workers call `try_acquire` before each operation and spin briefly when it
/// returns false.
pub struct RateLimiter {
    ops_per_sec: u64,
    start: Instant,
    issued: AtomicU64,
}

impl RateLimiter {
    pub fn new(ops_per_sec: u64) -> Self {
        RateLimiter {
            ops_per_sec,
            start: Instant::now(),
            issued: AtomicU64::new(0),
        }
    }

    /// Take one token if the bucket allows it.
    pub fn try_acquire(&self) -> bool {
        let budget = (self.start.elapsed().as_secs_f64() * self.ops_per_sec as f64) as u64;
        let issued = self.issued.load(Ordering::Relaxed);
        if issued >= budget {
            return false;
        }
        self.issued
            .compare_exchange(issued, issued + 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn respects_budget() {
        let limiter = RateLimiter::new(100);
        std::thread::sleep(Duration::from_millis(100));
        let mut acquired = 0;
        while limiter.try_acquire() {
            acquired += 1;
        }
        // ~10 tokens after 100ms at 100 ops/sec, with generous slack for
        // scheduler jitter.
        assert!(acquired >= 5 && acquired <= 100, "acquired {acquired}");
    }
}
