//! Time source abstraction so tests can control time advancement.
//!
//! All time *reads* (timestamps on packets, RTT samples, retry deadlines) go through
//!  [`Clock::now`]. Task *scheduling* uses the tokio timer wheel, which tests freeze with a
//!  paused runtime - the two advance together under the real clock, and the tests that need
//!  exact arithmetic drive a [`SimClock`] directly.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of "now", in nanoseconds since the Unix epoch.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> i64;
}

/// Passes through to the system clock.
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_nanos() as i64
    }
}

/// Simulated time. Starts at an arbitrary positive offset and moves only when the test
///  calls [`SimClock::advance`] or [`SimClock::set`].
pub struct SimClock {
    when: AtomicI64,
}

impl SimClock {
    pub fn new() -> Arc<SimClock> {
        Arc::new(SimClock {
            when: AtomicI64::new(1),
        })
    }

    /// advances the simulated clock by `d` and returns the new "now"
    pub fn advance(&self, d: Duration) -> i64 {
        self.when.fetch_add(d.as_nanos() as i64, Ordering::SeqCst) + d.as_nanos() as i64
    }

    pub fn set(&self, nanos: i64) {
        self.when.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now(&self) -> i64 {
        self.when.load(Ordering::SeqCst)
    }
}
