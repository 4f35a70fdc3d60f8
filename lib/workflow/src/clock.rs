//! Time sources for the engine.
//!
//! The dispatcher, queues and stores never call `Utc::now()` directly; they
//! read time through a [`Clock`] so tests can drive visibility timeouts,
//! backoff and timers deterministically with a [`ManualClock`].

use crate::sandbox;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// A source of wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
///
/// Reads go through the sandbox, so a system clock smuggled into workflow
/// code is reported as a determinism violation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        sandbox::wall_clock_now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Creates a manual clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current += to_chrono(by);
    }

    /// Sets the clock to `to`. Moving backwards is ignored.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if to > *current {
            *current = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Converts a std duration into a chrono duration, saturating at a century.
#[must_use]
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Returns how long from `now` until `at`, or zero if `at` has passed.
#[must_use]
pub fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(5));
    }

    #[test]
    fn manual_clock_never_moves_backwards() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.set(start - chrono::Duration::seconds(10));
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn until_saturates_at_zero() {
        let now = Utc::now();
        assert_eq!(until(now, now - chrono::Duration::seconds(1)), Duration::ZERO);
        assert_eq!(
            until(now, now + chrono::Duration::milliseconds(1500)),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn clones_share_time() {
        let clock = ManualClock::new(Utc::now());
        let other = clock.clone();
        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now(), other.now());
    }
}
