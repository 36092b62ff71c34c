//! Monotonic time source
//!
//! Components never read the system clock directly. `SystemClock` backs the
//! daemon; `ManualClock` lets tests drive day rollovers and interval checks
//! deterministically.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Time source for the core. `now` is monotonic (non-decreasing); `now_utc`
/// is the wall clock used for day boundaries and record timestamps.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Duration;
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Production clock: monotonic `Instant` anchored at construction.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock advanced by hand. Advancing moves both the monotonic reading
/// and the wall clock by the same amount.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(Duration, DateTime<Utc>)>,
}

impl ManualClock {
    pub fn new(start_utc: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new((Duration::ZERO, start_utc)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap();
        state.0 += by;
        state.1 += chrono::Duration::from_std(by).expect("advance fits chrono range");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.state.lock().unwrap().0
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().1
    }
}

/// Time remaining until the next 00:00 UTC boundary.
pub(crate) fn until_next_utc_midnight(clock: &dyn Clock) -> Duration {
    let now = clock.now_utc();
    let tomorrow = now
        .date_naive()
        .succ_opt()
        .expect("date range")
        .and_hms_opt(0, 0, 0)
        .expect("valid midnight");
    (tomorrow - now.naive_utc())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), Duration::ZERO);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), Duration::from_secs(90));
        assert_eq!(
            clock.now_utc(),
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 1, 30).unwrap()
        );
    }
}
