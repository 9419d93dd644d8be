//! Clock abstraction
//!
//! Every time-dependent billing decision (trial end, next billing date, payment
//! expiry, sweep selection) reads the time through [`Clock`] so schedulers and
//! state machines can be driven deterministically in tests.

use std::sync::Mutex;
use time::{Duration, OffsetDateTime};

/// Source of "now" for billing logic
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock (UTC)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Manually driven clock for tests and replay tooling
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<OffsetDateTime>,
}

impl FakeClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jump to an absolute instant
    pub fn set(&self, instant: OffsetDateTime) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = instant;
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_fake_clock_advances() {
        let clock = FakeClock::new(datetime!(2026-01-01 00:00 UTC));
        clock.advance(Duration::hours(2));
        assert_eq!(clock.now(), datetime!(2026-01-01 02:00 UTC));

        clock.set(datetime!(2026-03-01 12:00 UTC));
        assert_eq!(clock.now(), datetime!(2026-03-01 12:00 UTC));
    }
}
