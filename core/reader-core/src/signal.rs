//! Stop-signal fencing.
//!
//! A single, strictly increasing timestamp acts as a broadcast "stop
//! everything" token. Each executor remembers the last value it applied and
//! only reacts to larger ones, so duplicate or stale signals never stop a run
//! twice.

use serde::{Deserialize, Serialize};

use crate::session::SessionState;
use crate::store::{keys, load_record, save_record, DurableStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopSignal {
    /// Zero means no stop has ever been issued.
    pub at: i64,
}

pub fn load_signal(store: &dyn DurableStore) -> StopSignal {
    load_record(store, keys::STOP_SIGNAL)
}

/// Publishes a new stop token and returns it. Always larger than the previous one.
pub fn issue_stop(store: &dyn DurableStore, now: i64) -> i64 {
    let previous = load_signal(store);
    let next = now.max(previous.at + 1);
    save_record(store, keys::STOP_SIGNAL, &StopSignal { at: next });
    tracing::info!(at = next, "Stop signal issued");
    next
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopFence {
    applied: i64,
}

impl StopFence {
    pub fn new(applied: i64) -> Self {
        Self { applied }
    }

    pub fn applied(&self) -> i64 {
        self.applied
    }

    /// True when `signal` is newer than anything applied so far.
    pub fn observe(&mut self, signal: &StopSignal) -> bool {
        if signal.at > self.applied {
            self.applied = signal.at;
            true
        } else {
            false
        }
    }
}

/// A running session whose start predates the latest stop must not resume.
pub fn stale_resume(session: &SessionState, signal: &StopSignal) -> bool {
    if !session.is_running || signal.at <= 0 {
        return false;
    }
    match session.last_start_time {
        Some(started) => signal.at >= started,
        None => true,
    }
}
