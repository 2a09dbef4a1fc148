use std::time::{Duration, Instant};

/// Fixed-window rate limiter: at most `permits` acquisitions per `period`
///
/// Not thread-safe: owned by the single thread whose actions it throttles
/// (the housekeeper uses it to keep a failing maintenance loop from flooding
/// the log).
#[derive(Debug)]
pub struct RateLimiter {
    permits: u32,
    period: Duration,
    window_start: Option<Instant>,
    used: u32,
    suppressed: u64,
}

impl RateLimiter {
    pub fn new(permits: u32, period: Duration) -> Self {
        assert!(permits > 0, "permits must be > 0");
        Self {
            permits,
            period,
            window_start: None,
            used: 0,
            suppressed: 0,
        }
    }

    /// Try to take a permit now
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Try to take a permit at the given instant
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        let window_expired = match self.window_start {
            Some(start) => now.saturating_duration_since(start) >= self.period,
            None => true,
        };
        if window_expired {
            self.window_start = Some(now);
            self.used = 0;
        }

        if self.used < self.permits {
            self.used += 1;
            true
        } else {
            self.suppressed += 1;
            false
        }
    }

    /// Number of acquisitions refused since the last call
    pub fn take_suppressed(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed)
    }
}
