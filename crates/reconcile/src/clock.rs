//! Blocking waits used for backoff.

use std::thread;
use std::time::Duration;

/// Source of blocking waits.
///
/// Every delay in this crate goes through a `Clock` so tests can count
/// sleeps instead of waiting for them.
pub trait Clock {
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`std::thread::sleep`].
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
