//! Time source.
//!
//! Everything that reads the wall clock or sleeps goes through [`Clock`], so
//! the executor and the scheduler can be driven by a virtual clock in tests.

use chrono::{Local, NaiveDateTime};
use std::time::Duration;

use crate::wait::{WaitGate, WaitOutcome};

pub trait Clock: Send + Sync {
    /// Milliseconds since the unix epoch.
    fn now_ms(&self) -> i64;

    /// Local wall-clock time, used for daily windows.
    fn local_now(&self) -> NaiveDateTime;

    /// Sleeps for `duration`, returning early when `gate` is released.
    fn wait(&self, duration: Duration, gate: &WaitGate) -> WaitOutcome;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn local_now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn wait(&self, duration: Duration, gate: &WaitGate) -> WaitOutcome {
        gate.wait_timeout(duration)
    }
}

/// Epoch milliseconds at which local time `target` occurs, measured from the
/// clock's current reading.
pub fn epoch_ms_at(clock: &dyn Clock, target: NaiveDateTime) -> i64 {
    let delta = target - clock.local_now();
    clock.now_ms() + delta.num_milliseconds()
}
