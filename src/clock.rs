//! Time source for the poll loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::constants::SHUTDOWN_POLL_SLICE;

/// Wall clock plus an interruptible sleep.
pub trait Clock {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Waits for `duration` or until `shutdown` is set.
    ///
    /// Returns `false` if the wait was cut short by shutdown.
    fn sleep(&self, duration: Duration, shutdown: &AtomicBool) -> bool;
}

/// The real clock; sleeps in short slices so shutdown stays responsive.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration, shutdown: &AtomicBool) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(remaining.min(SHUTDOWN_POLL_SLICE));
        }
    }
}
