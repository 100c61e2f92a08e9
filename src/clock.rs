//! Strictly-monotonic microsecond clock.
//!
//! The stream invariants require `us` to strictly increase across every
//! publish and head-update, even across threads racing to grab "now". Plain
//! wall-clock time can return the same microsecond twice (or go backwards on
//! an NTP step); this wraps a [`quanta::Clock`] (already anchored to wall
//! time, monotonic per-thread) with a compare-and-swap "last returned"
//! counter so `now()` is guaranteed greater than every value it has already
//! handed out.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of strictly-increasing epoch-microsecond timestamps.
pub trait Clock: Send + Sync + 'static {
    /// Returns a timestamp guaranteed to be greater than every value
    /// previously returned by this clock instance.
    fn now_us(&self) -> i64;
}

/// The default clock: wall time anchored via `quanta`, forced strictly
/// monotonic with an atomic ratchet.
pub struct MonotonicClock {
    quanta: quanta::Clock,
    start_wall_us: i64,
    start_instant: quanta::Instant,
    last_returned: AtomicI64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        let quanta = quanta::Clock::new();
        let start_instant = quanta.now();
        let start_wall_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch")
            .as_micros() as i64;
        Self {
            quanta,
            start_wall_us,
            start_instant,
            last_returned: AtomicI64::new(-1),
        }
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn raw_wall_us(&self) -> i64 {
        let delta = self.quanta.now().duration_since(self.start_instant);
        self.start_wall_us + delta.as_micros() as i64
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> i64 {
        let mut prev = self.last_returned.load(Ordering::Acquire);
        loop {
            let candidate = self.raw_wall_us().max(prev + 1);
            match self.last_returned.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing_even_under_contention() {
        let clock = std::sync::Arc::new(MonotonicClock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let clock = std::sync::Arc::clone(&clock);
            handles.push(std::thread::spawn(move || {
                let mut values = Vec::with_capacity(1000);
                for _ in 0..1000 {
                    values.push(clock.now_us());
                }
                values
            }));
        }
        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        for w in all.windows(2) {
            assert!(w[1] > w[0], "clock produced non-increasing values: {:?}", w);
        }
    }
}
