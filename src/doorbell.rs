//! A generation-counter doorbell: the wakeup signal subscriber threads wait
//! on for "state advanced" or "stream shutting down". Deliberately not the
//! same `Mutex` the persister guards its metadata with — that mutex is
//! private to each backend — but a generation counter means a subscriber
//! that snapshots state, then waits, never misses a ring that happened in
//! between: it only blocks while the generation still matches what it last
//! observed.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub(crate) struct Doorbell {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl Doorbell {
    pub(crate) fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        *self.generation.lock().unwrap()
    }

    pub(crate) fn ring(&self) {
        let mut gen = self.generation.lock().unwrap();
        *gen = gen.wrapping_add(1);
        self.cv.notify_all();
    }

    /// Blocks until the generation differs from `last_seen` or `timeout`
    /// elapses, whichever comes first. Returns the generation observed on
    /// wakeup.
    pub(crate) fn wait_for_change(&self, last_seen: u64, timeout: Duration) -> u64 {
        let guard = self.generation.lock().unwrap();
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |gen| *gen == last_seen)
            .unwrap();
        *guard
    }
}
