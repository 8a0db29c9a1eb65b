use std::time::{Duration, Instant};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Monotonic clock with a wall-clock correlation taken at construction.
///
/// Every timestamp in the bridge (frame capture, tick wall time) is a
/// `Duration` since `origin`, so values from different components compare
/// directly as long as they share one clock.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
    wall_origin: OffsetDateTime,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now(), wall_origin: OffsetDateTime::now_utc() }
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    pub fn since_origin(&self, t: Instant) -> Duration {
        t.saturating_duration_since(self.origin)
    }

    pub fn instant_at(&self, offset: Duration) -> Instant {
        self.origin + offset
    }

    pub fn to_wall_time(&self, offset: Duration) -> OffsetDateTime {
        self.wall_origin + offset
    }

    pub fn format_wall_time(&self, offset: Duration) -> String {
        self.to_wall_time(offset).format(&Rfc3339).unwrap_or_default()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_monotonic() {
        let clock = MonotonicClock::new();
        let a = clock.elapsed();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.since_origin(clock.now());
        assert!(b > a);
        assert_eq!(clock.since_origin(clock.instant_at(Duration::from_millis(5))), Duration::from_millis(5));
    }

    #[test]
    fn test_wall_time_formatting() {
        let clock = MonotonicClock::new();
        let w0 = clock.to_wall_time(Duration::ZERO);
        let w1 = clock.to_wall_time(Duration::from_secs(2));
        assert_eq!((w1 - w0).whole_seconds(), 2);
        assert!(clock.format_wall_time(Duration::ZERO).contains('T'));
    }
}
