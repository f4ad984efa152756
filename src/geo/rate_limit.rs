//! Fixed-window rate limiting for geolocation providers
//!
//! Advisory, process-local throttling only. Each provider gets its own
//! limiter instance; state is never persisted across restarts.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Time source, injectable so tests can move the clock
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct WindowState {
    count: u32,
    window_start: DateTime<Utc>,
}

/// Token counter over a fixed reset window
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        let window_start = clock.now();
        Self {
            limit,
            window,
            clock,
            state: Mutex::new(WindowState {
                count: 0,
                window_start,
            }),
        }
    }

    /// Request a permit. Resets the counter when the window has elapsed,
    /// then grants while under the limit.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if now - state.window_start >= self.window {
            state.count = 0;
            state.window_start = now;
        }

        if state.count < self.limit {
            state.count += 1;
            true
        } else {
            false
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_clock::ManualClock;
    use super::*;

    #[test]
    fn grants_exactly_limit_within_one_window() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = RateLimiter::new(3, Duration::minutes(1), clock);

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn window_elapse_resets_counter() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = RateLimiter::new(2, Duration::minutes(1), clock.clone());

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        clock.advance(Duration::minutes(1));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn partial_window_does_not_reset() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = RateLimiter::new(1, Duration::hours(1), clock.clone());

        assert!(limiter.try_acquire());
        clock.advance(Duration::minutes(59));
        assert!(!limiter.try_acquire());
        clock.advance(Duration::minutes(1));
        assert!(limiter.try_acquire());
    }
}
