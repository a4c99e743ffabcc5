//! Monotonic wall clock in milliseconds
//!
//! Evaluation time handed to sketch engines must never run backwards, even
//! if the host clock is stepped by NTP.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// A clock source that never returns a smaller millisecond timestamp than it
/// returned before.
pub struct BoundedClock {
    /// High-water mark: the largest timestamp we've ever returned (millis)
    high_water_ms: AtomicI64,
}

impl BoundedClock {
    pub fn new() -> Self {
        Self {
            high_water_ms: AtomicI64::new(0),
        }
    }

    /// Returns a non-decreasing millisecond timestamp.
    ///
    /// If the wall clock has gone backward, the previous high-water mark is
    /// returned instead.
    pub fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        let prev = self.high_water_ms.fetch_max(wall, Ordering::AcqRel);
        wall.max(prev)
    }
}

impl Default for BoundedClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_decreasing() {
        let clock = BoundedClock::default();
        let mut prev = 0i64;
        for _ in 0..1000 {
            let ts = clock.now_millis();
            assert!(ts >= prev, "timestamps must never go backwards");
            prev = ts;
        }
    }

    #[test]
    fn test_high_water_mark_wins_over_wall_clock() {
        let clock = BoundedClock::default();
        let future = Utc::now().timestamp_millis() + 3_600_000;
        clock.high_water_ms.store(future, Ordering::Release);
        assert_eq!(clock.now_millis(), future);
    }

    #[test]
    fn test_reasonable_epoch() {
        let clock = BoundedClock::default();
        // after 2020-01-01
        assert!(clock.now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_concurrent_monotonicity() {
        use std::sync::Arc;
        let clock = Arc::new(BoundedClock::default());
        let mut handles = vec![];

        for _ in 0..4 {
            let c = clock.clone();
            handles.push(std::thread::spawn(move || {
                let mut prev = 0i64;
                for _ in 0..1000 {
                    let ts = c.now_millis();
                    assert!(ts >= prev);
                    prev = ts;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
    }
}
