//! Activity Tracker.
//!
//! Per-surface visibility and input pings folded into one question: has the
//! site been left alone long enough for a hidden run to start?

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::store::{keys, load_record, save_record, DurableStore};

pub const ACTIVITY_TTL_MS: i64 = 24 * 60 * 60 * 1000;
pub const ACTIVITY_THROTTLE_MS: i64 = 15_000;
pub const DEFAULT_QUIET_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceActivity {
    pub visible: bool,
    pub last_visible_at: Option<i64>,
    pub last_hidden_at: Option<i64>,
    pub last_activity_at: Option<i64>,
    pub last_seen_at: Option<i64>,
}

impl SurfaceActivity {
    fn last_interaction(&self) -> Option<i64> {
        [self.last_visible_at, self.last_activity_at, self.last_seen_at]
            .into_iter()
            .flatten()
            .max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IdleReason {
    Visible,
    NoData,
    RecentActivity,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdleVerdict {
    pub ready: bool,
    pub ready_at: Option<i64>,
    pub reason: IdleReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityLedger {
    pub surfaces: BTreeMap<String, SurfaceActivity>,
}

impl ActivityLedger {
    pub fn record_visibility(&mut self, surface_id: &str, visible: bool, at: i64) {
        let entry = self.surfaces.entry(surface_id.to_string()).or_default();
        entry.visible = visible;
        if visible {
            entry.last_visible_at = Some(at);
            entry.last_activity_at = Some(at);
        } else {
            entry.last_hidden_at = Some(at);
        }
        entry.last_seen_at = Some(at);
    }

    pub fn record_activity(&mut self, surface_id: &str, at: i64) {
        let entry = self.surfaces.entry(surface_id.to_string()).or_default();
        entry.last_activity_at = Some(at);
        entry.last_seen_at = Some(at);
    }

    pub fn remove_surface(&mut self, surface_id: &str) -> bool {
        self.surfaces.remove(surface_id).is_some()
    }

    /// Drops entries never seen or not seen for a day.
    pub fn prune(&mut self, now: i64) {
        self.surfaces.retain(|_, entry| {
            entry
                .last_seen_at
                .is_some_and(|seen| now - seen <= ACTIVITY_TTL_MS)
        });
    }

    pub fn any_visible(&self) -> bool {
        self.surfaces.values().any(|entry| entry.visible)
    }

    pub fn last_interaction(&self) -> Option<i64> {
        self.surfaces
            .values()
            .filter_map(SurfaceActivity::last_interaction)
            .max()
    }

    pub fn background_info(&self, now: i64, quiet_ms: i64) -> IdleVerdict {
        if self.any_visible() {
            return IdleVerdict {
                ready: false,
                ready_at: None,
                reason: IdleReason::Visible,
            };
        }

        let Some(last) = self.last_interaction() else {
            return IdleVerdict {
                ready: false,
                ready_at: None,
                reason: IdleReason::NoData,
            };
        };

        let ready_at = last + quiet_ms;
        if now < ready_at {
            IdleVerdict {
                ready: false,
                ready_at: Some(ready_at),
                reason: IdleReason::RecentActivity,
            }
        } else {
            IdleVerdict {
                ready: true,
                ready_at: Some(ready_at),
                reason: IdleReason::Ready,
            }
        }
    }

    /// With no surfaces on record the answer stays "not yet" until `quiet_ms`
    /// of observation (counted from `observed_since`) has passed.
    pub fn is_unattended(&self, now: i64, quiet_ms: i64, observed_since: i64) -> bool {
        let verdict = self.background_info(now, quiet_ms);
        match verdict.reason {
            IdleReason::Ready => true,
            IdleReason::NoData => now - observed_since >= quiet_ms,
            IdleReason::Visible | IdleReason::RecentActivity => false,
        }
    }
}

/// Load, prune, mutate, persist.
pub struct TrackedLedger;

impl TrackedLedger {
    pub fn read(store: &dyn DurableStore, now: i64) -> ActivityLedger {
        let mut ledger: ActivityLedger = load_record(store, keys::SITE_ACTIVITY);
        ledger.prune(now);
        ledger
    }

    pub fn with<R>(
        store: &dyn DurableStore,
        now: i64,
        update: impl FnOnce(&mut ActivityLedger) -> R,
    ) -> R {
        let mut ledger = Self::read(store, now);
        let result = update(&mut ledger);
        save_record(store, keys::SITE_ACTIVITY, &ledger);
        result
    }
}

/// Lets through at most one activity ping per interval.
#[derive(Debug, Clone, Copy)]
pub struct ActivityThrottle {
    interval_ms: i64,
    last_recorded: Option<i64>,
}

impl Default for ActivityThrottle {
    fn default() -> Self {
        Self::new(ACTIVITY_THROTTLE_MS)
    }
}

impl ActivityThrottle {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            last_recorded: None,
        }
    }

    pub fn should_record(&mut self, at: i64) -> bool {
        match self.last_recorded {
            Some(last) if at - last < self.interval_ms => false,
            _ => {
                self.last_recorded = Some(at);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const QUIET: i64 = 10 * 60 * 1000;

    #[test]
    fn visible_surface_is_never_unattended() {
        let mut ledger = ActivityLedger::default();
        ledger.record_visibility("a", true, 1_000);
        let far_future = 1_000 + 10 * QUIET;
        assert!(!ledger.is_unattended(far_future, QUIET, 0));
        assert_eq!(
            ledger.background_info(far_future, QUIET).reason,
            IdleReason::Visible
        );
    }

    #[test]
    fn unattended_after_quiet_period() {
        let mut ledger = ActivityLedger::default();
        ledger.record_visibility("a", true, 1_000);
        ledger.record_visibility("a", false, 2_000);
        ledger.record_activity("b", 5_000);

        assert!(!ledger.is_unattended(5_000 + QUIET - 1, QUIET, 0));
        let verdict = ledger.background_info(5_000 + QUIET - 1, QUIET);
        assert_eq!(verdict.reason, IdleReason::RecentActivity);
        assert_eq!(verdict.ready_at, Some(5_000 + QUIET));

        assert!(ledger.is_unattended(5_000 + QUIET, QUIET, 0));
    }

    #[test]
    fn no_data_defers_until_observed_long_enough() {
        let ledger = ActivityLedger::default();
        assert_eq!(ledger.background_info(50, QUIET).reason, IdleReason::NoData);
        assert!(!ledger.is_unattended(QUIET - 1, QUIET, 0));
        assert!(ledger.is_unattended(QUIET, QUIET, 0));
    }

    #[test]
    fn prune_drops_old_and_unseen_entries() {
        let mut ledger = ActivityLedger::default();
        ledger.record_activity("old", 0);
        ledger.record_activity("fresh", ACTIVITY_TTL_MS);
        ledger.surfaces.insert("ghost".to_string(), SurfaceActivity::default());

        ledger.prune(ACTIVITY_TTL_MS + 1);
        let ids: Vec<&String> = ledger.surfaces.keys().collect();
        assert_eq!(ids, vec!["fresh"]);
    }

    #[test]
    fn tracked_ledger_persists_updates() {
        let store = MemoryStore::new();
        TrackedLedger::with(&store, 100, |ledger| {
            ledger.record_visibility("tab-1", true, 100)
        });
        let ledger = TrackedLedger::read(&store, 200);
        assert!(ledger.any_visible());

        let removed = TrackedLedger::with(&store, 300, |ledger| ledger.remove_surface("tab-1"));
        assert!(removed);
        assert!(TrackedLedger::read(&store, 400).surfaces.is_empty());
    }

    #[test]
    fn throttle_allows_one_ping_per_interval() {
        let mut throttle = ActivityThrottle::default();
        assert!(throttle.should_record(0));
        assert!(!throttle.should_record(14_999));
        assert!(throttle.should_record(15_000));
        assert!(!throttle.should_record(20_000));
    }
}
