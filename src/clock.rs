//! Wall-clock source shared by the repositories and the freshness gate.

use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> OffsetDateTime;

    fn unix_seconds(&self) -> i64 {
        self.now().unix_timestamp()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn manual_clock_advances_by_duration() {
        let clock = ManualClock::new(datetime!(2026-01-11 12:00:00 UTC));

        clock.advance(Duration::from_secs(601));

        assert_eq!(clock.now(), datetime!(2026-01-11 12:10:01 UTC));
        assert_eq!(
            clock.unix_seconds(),
            datetime!(2026-01-11 12:10:01 UTC).unix_timestamp()
        );
    }
}
