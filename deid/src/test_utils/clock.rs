use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use crate::lease::Clock;

#[derive(Debug)]
enum Mode {
    Manual,
    /// Follows the tokio clock, so paused-time tests move lease expiry along with timers.
    FollowingTokio(tokio::time::Instant),
}

/// Clock whose time only moves when a test says so.
#[derive(Debug)]
pub struct TestClock {
    base: DateTime<Utc>,
    offset: Mutex<Duration>,
    mode: Mode,
}

impl TestClock {
    /// Creates a clock frozen at a fixed instant until [`TestClock::advance`] is called.
    pub fn new() -> Self {
        Self {
            base: Self::base(),
            offset: Mutex::new(Duration::ZERO),
            mode: Mode::Manual,
        }
    }

    /// Creates a clock that advances with `tokio::time`, which includes auto-advancing paused
    /// time.
    pub fn following_tokio() -> Self {
        Self {
            base: Self::base(),
            offset: Mutex::new(Duration::ZERO),
            mode: Mode::FollowingTokio(tokio::time::Instant::now()),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += by;
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let mut elapsed = *self.offset.lock().unwrap();
        if let Mode::FollowingTokio(start) = &self.mode {
            elapsed += tokio::time::Instant::now().duration_since(*start);
        }

        self.base + TimeDelta::from_std(elapsed).unwrap()
    }
}
