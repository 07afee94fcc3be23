//! Reading session state.
//!
//! `SessionState` is the only thing an executor carries across navigations.
//! It is created on first load, mutated after every transition, persisted
//! fire-and-forget, and cleared only by an explicit reset.

use autoread_protocol::{ReaderConfig, StatsSnapshot};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::store::{keys, load_record, save_record, DurableStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStats {
    pub total_items: u64,
    pub start_time: Option<i64>,
    pub errors: u64,
}

/// Executor-side wait before a daily run starts reading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleGateState {
    pub last_action_at: Option<i64>,
    pub wait_until: Option<i64>,
    pub pending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub is_running: bool,
    pub visited_items: BTreeSet<String>,
    /// High-water mark of the traversal inside `current_item`.
    #[serde(deserialize_with = "deserialize_sub_item_key")]
    pub last_sub_item_key: Option<u64>,
    /// Item the traversal key belongs to; cleared once the item completes.
    pub current_item: Option<String>,
    pub stats: SessionStats,
    pub accumulated_run_ms: i64,
    pub last_start_time: Option<i64>,
    pub config: ReaderConfig,
    pub idle_gate: IdleGateState,
}

/// Older records stored the key as a string (`"120"`).
fn deserialize_sub_item_key<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Some(Value::String(text)) => text.trim().parse::<u64>().ok(),
        _ => None,
    })
}

impl SessionState {
    pub fn load(store: &dyn DurableStore) -> Self {
        let mut state: SessionState = load_record(store, keys::SESSION);
        state.config = state.config.normalized();
        state
    }

    pub fn save(&self, store: &dyn DurableStore) {
        save_record(store, keys::SESSION, self);
    }

    /// Returns false when the session was already running.
    pub fn mark_started(&mut self, now: i64) -> bool {
        if self.is_running {
            return false;
        }
        self.is_running = true;
        self.last_start_time = Some(now);
        if self.stats.start_time.is_none() {
            self.stats.start_time = Some(now);
        }
        true
    }

    /// Folds the current run into `accumulated_run_ms`. Returns false when the
    /// session was already stopped, in which case nothing changes.
    pub fn mark_stopped(&mut self, now: i64) -> bool {
        if !self.is_running {
            return false;
        }
        if let Some(started) = self.last_start_time {
            self.accumulated_run_ms += (now - started).max(0);
        }
        self.is_running = false;
        self.idle_gate = IdleGateState::default();
        true
    }

    /// Forgets which items were read. Run state and config are kept.
    pub fn reset_history(&mut self) {
        self.visited_items.clear();
        self.last_sub_item_key = None;
        self.current_item = None;
        self.stats.total_items = 0;
    }

    /// Clears history, stats and run time, then starts a fresh run.
    pub fn reset_for_new_run(&mut self, now: i64) {
        self.reset_history();
        self.stats = SessionStats {
            total_items: 0,
            start_time: Some(now),
            errors: 0,
        };
        self.accumulated_run_ms = 0;
        self.idle_gate = IdleGateState::default();
        self.is_running = true;
        self.last_start_time = Some(now);
    }

    pub fn run_time_ms(&self, now: i64) -> i64 {
        let live = match (self.is_running, self.last_start_time) {
            (true, Some(started)) => (now - started).max(0),
            _ => 0,
        };
        self.accumulated_run_ms + live
    }

    pub fn stats_snapshot(&self, now: i64, current_item: Option<String>) -> StatsSnapshot {
        StatsSnapshot {
            total_items: self.stats.total_items,
            start_time: self.stats.start_time,
            errors: self.stats.errors,
            accumulated_run_ms: self.run_time_ms(now),
            current_item,
        }
    }
}
