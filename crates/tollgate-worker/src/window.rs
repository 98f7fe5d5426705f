use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tollgate_core::Clock;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    minute: i64,
    count: u32,
}

/// Per-key event counter over a trailing window of one-minute buckets.
///
/// Buckets are reused ring-style: a bucket whose minute fell out of the window
/// is reset before it is written, and ignored when summing.
pub struct SlidingWindowCounter {
    window_minutes: usize,
    clock: Arc<dyn Clock>,
    rings: Mutex<HashMap<String, Vec<Bucket>>>,
}

impl SlidingWindowCounter {
    /// A counter over the trailing `window_minutes` minutes (at least one).
    pub fn new(window_minutes: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_minutes: window_minutes.max(1) as usize,
            clock,
            rings: Mutex::new(HashMap::new()),
        }
    }

    /// Width of the window in minutes.
    pub fn window_minutes(&self) -> u32 {
        self.window_minutes as u32
    }

    fn current_minute(&self) -> i64 {
        self.clock.now().timestamp().div_euclid(60)
    }

    fn sum(&self, ring: &[Bucket], minute: i64) -> u32 {
        let oldest = minute - self.window_minutes as i64;
        ring.iter()
            .filter(|b| b.minute > oldest && b.minute <= minute)
            .map(|b| b.count)
            .sum()
    }

    /// Record one event for `key`. Returns the count before and after.
    pub fn increment(&self, key: &str) -> (u32, u32) {
        let minute = self.current_minute();
        let mut rings = self.rings.lock();
        let ring = rings
            .entry(key.to_string())
            .or_insert_with(|| vec![Bucket::default(); self.window_minutes]);
        let before = self.sum(ring, minute);

        let slot = minute.rem_euclid(self.window_minutes as i64) as usize;
        let bucket = &mut ring[slot];
        if bucket.minute != minute {
            *bucket = Bucket { minute, count: 0 };
        }
        bucket.count += 1;

        (before, before + 1)
    }

    /// Events recorded for `key` within the window.
    pub fn count(&self, key: &str) -> u32 {
        let minute = self.current_minute();
        self.rings
            .lock()
            .get(key)
            .map_or(0, |ring| self.sum(ring, minute))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use tollgate_core::ManualClock;

    fn counter(window: u32) -> (SlidingWindowCounter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        ));
        (SlidingWindowCounter::new(window, clock.clone()), clock)
    }

    #[test]
    fn test_counts_per_key() {
        let (c, _) = counter(60);
        assert_eq!(c.increment("a"), (0, 1));
        assert_eq!(c.increment("a"), (1, 2));
        assert_eq!(c.increment("b"), (0, 1));
        assert_eq!(c.count("a"), 2);
        assert_eq!(c.count("missing"), 0);
    }

    #[test]
    fn test_events_expire_individually() {
        let (c, clock) = counter(60);
        c.increment("a");
        clock.advance(Duration::minutes(30));
        c.increment("a");
        assert_eq!(c.count("a"), 2);

        // The first event leaves the window; the second stays.
        clock.advance(Duration::minutes(31));
        assert_eq!(c.count("a"), 1);

        clock.advance(Duration::minutes(30));
        assert_eq!(c.count("a"), 0);
    }

    #[test]
    fn test_reused_slot_is_reset() {
        let (c, clock) = counter(5);
        c.increment("a");
        c.increment("a");
        clock.advance(Duration::minutes(5));
        assert_eq!(c.increment("a"), (0, 1));
        assert_eq!(c.count("a"), 1);
    }
}
