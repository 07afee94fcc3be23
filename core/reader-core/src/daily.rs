//! Daily-auto configuration.
//!
//! The record is shared between the scheduler and every executor, so it is
//! normalised on every load rather than trusted: malformed times fall back to
//! 09:00, the window end is always recomputed from the start, and yesterday's
//! counters are reset unless yesterday's run is still inside its window.

use autoread_protocol::DailyAutoPatch;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::store::{keys, load_record, remove_record, save_record, DurableStore};

pub const DEFAULT_WINDOW_START: &str = "09:00";
pub const DEFAULT_TARGET: i64 = 50;
pub const WINDOW_MINUTES: u32 = 600;
const MINUTES_PER_DAY: u32 = 24 * 60;
const DATE_FORMAT: &str = "%Y-%m-%d";

static DAILY_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d{1,2}):(\d{2})\s*$").expect("valid daily time regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DailyAutoConfig {
    pub enabled: bool,
    pub target: i64,
    pub window_start: String,
    pub window_end: String,
    pub date: String,
    pub count: u32,
    pub running: bool,
    pub require_hidden: bool,
}

impl Default for DailyAutoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: DEFAULT_TARGET,
            window_start: DEFAULT_WINDOW_START.to_string(),
            window_end: window_end_for(DEFAULT_WINDOW_START),
            date: String::new(),
            count: 0,
            running: false,
            require_hidden: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    NotRunning,
    Counted { count: u32, target: i64 },
    TargetReached { count: u32, target: i64 },
}

/// Idempotent marker saying a launch is waiting on the idle gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingIdleMarker {
    pub pending: bool,
    pub requested_at: i64,
}

impl PendingIdleMarker {
    pub fn load(store: &dyn DurableStore) -> Self {
        load_record(store, keys::DAILY_PENDING)
    }

    pub fn save(&self, store: &dyn DurableStore) {
        save_record(store, keys::DAILY_PENDING, self);
    }

    pub fn clear(store: &dyn DurableStore) {
        remove_record(store, keys::DAILY_PENDING);
    }

    pub fn is_armed(&self) -> bool {
        self.pending && self.requested_at > 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Time strings
// ─────────────────────────────────────────────────────────────────────────────

/// Parses `HH:MM`. Anything else is 09:00.
pub fn parse_daily_time(value: &str) -> (u32, u32) {
    DAILY_TIME
        .captures(value)
        .and_then(|caps| {
            let hour: u32 = caps.get(1)?.as_str().parse().ok()?;
            let minute: u32 = caps.get(2)?.as_str().parse().ok()?;
            (hour < 24 && minute < 60).then_some((hour, minute))
        })
        .unwrap_or((9, 0))
}

pub fn format_daily_time(hour: u32, minute: u32) -> String {
    format!("{:02}:{:02}", hour, minute)
}

pub fn window_end_for(start: &str) -> String {
    let (hour, minute) = parse_daily_time(start);
    let total = (hour * 60 + minute + WINDOW_MINUTES) % MINUTES_PER_DAY;
    format_daily_time(total / 60, total % 60)
}

fn start_time_of(value: &str) -> NaiveTime {
    let (hour, minute) = parse_daily_time(value);
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

pub fn today_string(now: NaiveDateTime) -> String {
    now.date().format(DATE_FORMAT).to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Normalisation and scheduling
// ─────────────────────────────────────────────────────────────────────────────

/// End of the run window that began on `config.date`. Crosses midnight when
/// the window does.
pub fn deadline(config: &DailyAutoConfig) -> Option<NaiveDateTime> {
    let date = NaiveDate::parse_from_str(&config.date, DATE_FORMAT).ok()?;
    let start = date.and_time(start_time_of(&config.window_start));
    Some(start + Duration::minutes(i64::from(WINDOW_MINUTES)))
}

pub fn normalize(raw: DailyAutoConfig, now: NaiveDateTime) -> DailyAutoConfig {
    let mut config = raw;
    let (hour, minute) = parse_daily_time(&config.window_start);
    config.window_start = format_daily_time(hour, minute);
    config.window_end = window_end_for(&config.window_start);
    if config.target < 1 {
        config.target = DEFAULT_TARGET;
    }

    let today = today_string(now);
    if config.date != today {
        let window_over = deadline(&config).map_or(true, |end| now >= end);
        if !config.running || window_over {
            config.date = today;
            config.count = 0;
            config.running = false;
        }
    }
    config
}

/// Next occurrence of `window_start`: today if still ahead, otherwise tomorrow.
pub fn next_run_at(window_start: &str, now: NaiveDateTime) -> NaiveDateTime {
    let today = now.date().and_time(start_time_of(window_start));
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

pub fn load_daily(store: &dyn DurableStore, now: NaiveDateTime) -> DailyAutoConfig {
    let raw: DailyAutoConfig = load_record(store, keys::DAILY_AUTO);
    normalize(raw, now)
}

pub fn save_daily(store: &dyn DurableStore, config: &DailyAutoConfig) {
    save_record(store, keys::DAILY_AUTO, config);
}

pub fn apply_patch(config: &DailyAutoConfig, patch: &DailyAutoPatch) -> DailyAutoConfig {
    let mut next = config.clone();
    if let Some(enabled) = patch.enabled {
        next.enabled = enabled;
    }
    if let Some(target) = patch.target {
        next.target = i64::from(target);
    }
    if let Some(start) = &patch.window_start {
        let (hour, minute) = parse_daily_time(start);
        next.window_start = format_daily_time(hour, minute);
    }
    if let Some(require_hidden) = patch.require_hidden {
        next.require_hidden = require_hidden;
    }
    next.window_end = window_end_for(&next.window_start);
    if next.target < 1 {
        next.target = DEFAULT_TARGET;
    }
    next
}

// ─────────────────────────────────────────────────────────────────────────────
// Run transitions
// ─────────────────────────────────────────────────────────────────────────────

/// Counts one completed item against today's run.
pub fn record_progress(store: &dyn DurableStore, now: NaiveDateTime) -> ProgressOutcome {
    let mut config = load_daily(store, now);
    if !config.running {
        return ProgressOutcome::NotRunning;
    }

    config.count += 1;
    let count = config.count;
    let target = config.target;
    if i64::from(count) >= target {
        config.running = false;
        save_daily(store, &config);
        tracing::info!(count, target, "Daily target reached");
        return ProgressOutcome::TargetReached { count, target };
    }

    save_daily(store, &config);
    ProgressOutcome::Counted { count, target }
}

/// Force-finishes a run that outlived its window. True only for the call that
/// actually flips `running`.
pub fn enforce_deadline(store: &dyn DurableStore, now: NaiveDateTime) -> bool {
    let raw: DailyAutoConfig = load_record(store, keys::DAILY_AUTO);
    if !raw.running {
        return false;
    }
    let Some(end) = deadline(&raw) else {
        return false;
    };
    if now < end {
        return false;
    }

    let mut config = normalize(raw, now);
    config.running = false;
    save_daily(store, &config);
    tracing::info!(count = config.count, target = config.target, "Daily window closed");
    true
}
