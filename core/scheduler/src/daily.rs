//! Daily-auto launcher.
//!
//! The daily alarm, the pending wake alarm, the periodic tick and qualifying
//! visibility events all funnel into [`DailyRunner::run_daily`]. Each attempt
//! re-reads the config under the launch lock and bails out when a run is
//! already going, so however many of them race there is one launch.

use autoread_core::activity::{IdleReason, TrackedLedger};
use autoread_core::clock::epoch_ms_at;
use autoread_core::daily::{self, DailyAutoConfig, PendingIdleMarker, DEFAULT_TARGET};
use autoread_core::{
    deliver_with_retry, signal, Alarms, Clock, Diagnostics, DurableStore, RetryPolicy,
    SurfaceHost, WaitGate,
};
use autoread_protocol::{Command, DailyAutoPatch};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DAILY_ALARM: &str = "daily-auto";
pub const PENDING_ALARM: &str = "daily-auto-pending";
const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const MIN_PENDING_DELAY_MS: i64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LaunchOutcome {
    Disabled,
    AlreadyRunning,
    /// Waiting for the site to go unattended; a wake alarm is armed.
    Deferred { ready_at: i64 },
    Launched { date: String, target: i64 },
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub listing_url: String,
    pub quiet_ms: i64,
    pub load_timeout: Duration,
    pub delivery: RetryPolicy,
}

pub struct DailyRunner {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    alarms: Arc<dyn Alarms>,
    host: Arc<dyn SurfaceHost>,
    diagnostics: Arc<Diagnostics>,
    settings: RunnerSettings,
    observed_since: i64,
    launch_lock: Mutex<()>,
    gate: WaitGate,
    background_launch: bool,
}

impl DailyRunner {
    pub fn new(
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
        alarms: Arc<dyn Alarms>,
        host: Arc<dyn SurfaceHost>,
        diagnostics: Arc<Diagnostics>,
        settings: RunnerSettings,
    ) -> Self {
        let observed_since = clock.now_ms();
        Self {
            store,
            clock,
            alarms,
            host,
            diagnostics,
            settings,
            observed_since,
            launch_lock: Mutex::new(()),
            gate: WaitGate::new(),
            background_launch: true,
        }
    }

    /// Opens surfaces on the calling thread instead of a worker.
    pub fn with_inline_launch(mut self) -> Self {
        self.background_launch = false;
        self
    }

    pub fn quiet_ms(&self) -> i64 {
        self.settings.quiet_ms
    }

    pub fn observed_since(&self) -> i64 {
        self.observed_since
    }

    pub fn config(&self) -> DailyAutoConfig {
        daily::load_daily(&*self.store, self.clock.local_now())
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────────

    /// Normalises and re-persists the stored config, then re-arms the daily alarm.
    pub fn startup(&self) -> DailyAutoConfig {
        let config = self.config();
        daily::save_daily(&*self.store, &config);
        self.schedule_daily_alarm(&config);
        info!(
            enabled = config.enabled,
            window_start = %config.window_start,
            window_end = %config.window_end,
            running = config.running,
            "Daily auto loaded"
        );
        config
    }

    pub fn schedule_daily_alarm(&self, config: &DailyAutoConfig) {
        let next = daily::next_run_at(&config.window_start, self.clock.local_now());
        let first = epoch_ms_at(&*self.clock, next);
        self.alarms.schedule_repeating(DAILY_ALARM, first, DAY_MS);
        debug!(next = %next, "Daily alarm scheduled");
    }

    pub fn update(&self, patch: &DailyAutoPatch) -> DailyAutoConfig {
        let _guard = self.lock();
        let config = daily::apply_patch(&self.config(), patch);
        daily::save_daily(&*self.store, &config);
        self.schedule_daily_alarm(&config);
        info!(
            enabled = config.enabled,
            target = config.target,
            window_start = %config.window_start,
            require_hidden = config.require_hidden,
            "Daily auto updated"
        );
        config
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Triggers
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn on_alarm(self: &Arc<Self>, name: &str) {
        match name {
            DAILY_ALARM => {
                let outcome = self.run_daily();
                debug!(outcome = ?outcome, "Daily alarm handled");
            }
            PENDING_ALARM => {
                let outcome = self.run_pending();
                debug!(outcome = ?outcome, "Pending alarm handled");
            }
            other => debug!(alarm = other, "Ignoring unknown alarm"),
        }
    }

    /// Periodic sweep: retries a pending launch and closes overdue runs.
    pub fn on_tick(self: &Arc<Self>) {
        self.run_pending();
        if daily::enforce_deadline(&*self.store, self.clock.local_now()) {
            let at = signal::issue_stop(&*self.store, self.clock.now_ms());
            info!(stop_at = at, "Daily window closed; stop issued");
        }
    }

    /// Finishes a launch that is waiting on the idle gate, if any.
    pub fn run_pending(self: &Arc<Self>) -> Option<LaunchOutcome> {
        if !PendingIdleMarker::load(&*self.store).pending {
            return None;
        }
        Some(self.run_daily())
    }

    pub fn run_daily(self: &Arc<Self>) -> LaunchOutcome {
        let guard = self.lock();
        let now = self.clock.now_ms();
        let mut config = self.config();

        if !config.enabled {
            self.clear_pending();
            return LaunchOutcome::Disabled;
        }
        if config.running {
            self.clear_pending();
            return LaunchOutcome::AlreadyRunning;
        }

        config.date = daily::today_string(self.clock.local_now());
        config.count = 0;

        if config.require_hidden {
            if let Some(ready_at) = self.idle_gate(now) {
                return LaunchOutcome::Deferred { ready_at };
            }
        }

        self.clear_pending();
        config.running = true;
        daily::save_daily(&*self.store, &config);
        info!(date = %config.date, target = config.target, "Daily run starting");

        let outcome = LaunchOutcome::Launched {
            date: config.date.clone(),
            target: config.target,
        };
        // Later attempts now see `running`; the launch itself needs no lock.
        drop(guard);
        if self.background_launch {
            let runner = Arc::clone(self);
            thread::spawn(move || runner.launch(config));
        } else {
            self.launch(config);
        }
        outcome
    }

    /// `None` when the site is unattended; otherwise arms the wake alarm and
    /// returns the time it is set for.
    fn idle_gate(&self, now: i64) -> Option<i64> {
        let quiet = self.settings.quiet_ms;
        let pending = PendingIdleMarker::load(&*self.store);
        let verdict = TrackedLedger::read(&*self.store, now).background_info(now, quiet);

        let mut ready = verdict.ready;
        let mut ready_at = verdict.ready_at.unwrap_or(now + quiet);
        if !ready && verdict.reason == IdleReason::Visible {
            ready_at = now + quiet;
        }
        if !ready && verdict.reason == IdleReason::NoData && pending.is_armed() {
            let no_data_ready_at = pending.requested_at + quiet;
            if now >= no_data_ready_at {
                ready = true;
            } else {
                ready_at = no_data_ready_at;
            }
        }
        if ready {
            return None;
        }

        if !pending.is_armed() {
            PendingIdleMarker {
                pending: true,
                requested_at: now,
            }
            .save(&*self.store);
        }
        let when = ready_at.max(now + MIN_PENDING_DELAY_MS);
        self.alarms.schedule_once_at(PENDING_ALARM, when);
        info!(reason = ?verdict.reason, ready_at = when, "Daily run waiting for the site to go quiet");
        Some(when)
    }

    fn clear_pending(&self) {
        PendingIdleMarker::clear(&*self.store);
        self.alarms.cancel(PENDING_ALARM);
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Launch
    // ─────────────────────────────────────────────────────────────────────────────

    fn launch(&self, config: DailyAutoConfig) {
        let active = !config.require_hidden;
        let surface_id = match self.host.open_surface(&self.settings.listing_url, active) {
            Ok(surface_id) => surface_id,
            Err(err) => {
                warn!(error = %err, "Failed to open a surface for the daily run");
                self.diagnostics
                    .record("daily", format!("open surface failed: {}", err));
                self.abandon(&config.date);
                return;
            }
        };

        if !self
            .host
            .wait_until_loaded(&surface_id, self.settings.load_timeout)
        {
            warn!(surface = %surface_id, "Surface did not report ready in time");
        }

        let command = Command::StartDaily {
            target: u32::try_from(config.target).unwrap_or(DEFAULT_TARGET as u32),
            date: config.date.clone(),
            skip_idle_wait: config.require_hidden,
        };
        let delivered = deliver_with_retry(
            self.settings.delivery,
            &*self.clock,
            &self.gate,
            &self.diagnostics,
            "startDaily",
            |_| self.host.send_command(&surface_id, &command),
        );
        if delivered.is_some() {
            info!(surface = %surface_id, "Daily run handed to surface");
        }
    }

    /// Reverts `running` for a run that never got a surface.
    fn abandon(&self, date: &str) {
        let _guard = self.lock();
        let mut config = self.config();
        if config.running && config.date == date {
            config.running = false;
            daily::save_daily(&*self.store, &config);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Stop
    // ─────────────────────────────────────────────────────────────────────────────

    /// Stops every executor and ends today's daily run, if one is going.
    pub fn issue_stop(&self) -> i64 {
        let _guard = self.lock();
        let mut config = self.config();
        if config.running {
            config.running = false;
            daily::save_daily(&*self.store, &config);
        }
        self.clear_pending();
        signal::issue_stop(&*self.store, self.clock.now_ms())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.launch_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::StoredAlarms;
    use autoread_core::signal::load_signal;
    use autoread_core::test_support::ManualClock;
    use autoread_core::{DeliveryError, MemoryStore};
    use autoread_protocol::Response;
    use chrono::NaiveDateTime;

    #[derive(Default)]
    struct FakeHost {
        opened: Mutex<Vec<(String, bool)>>,
        sent: Mutex<Vec<Command>>,
        refuse_first: Mutex<u32>,
        fail_open: bool,
    }

    impl SurfaceHost for FakeHost {
        fn open_surface(&self, url: &str, active: bool) -> autoread_core::Result<String> {
            if self.fail_open {
                return Err(autoread_core::ReaderError::storage("open", "launcher missing"));
            }
            let mut opened = self.opened.lock().unwrap();
            opened.push((url.to_string(), active));
            Ok(format!("surface-{}", opened.len()))
        }
        fn close_surface(&self, _surface_id: &str) -> autoread_core::Result<()> {
            Ok(())
        }
        fn wait_until_loaded(&self, _surface_id: &str, _timeout: Duration) -> bool {
            true
        }
        fn send_command(
            &self,
            _surface_id: &str,
            command: &Command,
        ) -> Result<Response, DeliveryError> {
            let mut refuse = self.refuse_first.lock().unwrap();
            if *refuse > 0 {
                *refuse -= 1;
                return Err(DeliveryError::NoReceiver("not attached".to_string()));
            }
            self.sent.lock().unwrap().push(command.clone());
            Ok(Response::success(None))
        }
        fn surfaces(&self) -> Vec<String> {
            Vec::new()
        }
    }

    struct Rig {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        alarms: Arc<StoredAlarms>,
        host: Arc<FakeHost>,
        runner: Arc<DailyRunner>,
    }

    fn local(text: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M").unwrap()
    }

    fn rig_with(host: FakeHost, daily: DailyAutoConfig) -> Rig {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at_local(local("2026-03-02 09:00")));
        let alarms = Arc::new(StoredAlarms::new(store.clone()));
        let host = Arc::new(host);
        daily::save_daily(&*store, &daily);
        let runner = DailyRunner::new(
            store.clone(),
            clock.clone(),
            alarms.clone(),
            host.clone(),
            Arc::new(Diagnostics::new()),
            RunnerSettings {
                listing_url: "https://linux.do/latest".to_string(),
                quiet_ms: 10 * 60_000,
                load_timeout: Duration::from_secs(1),
                delivery: RetryPolicy::start_command(),
            },
        )
        .with_inline_launch();
        Rig {
            store,
            clock,
            alarms,
            host,
            runner: Arc::new(runner),
        }
    }

    fn visible_daily() -> DailyAutoConfig {
        DailyAutoConfig {
            target: 3,
            require_hidden: false,
            ..DailyAutoConfig::default()
        }
    }

    fn hidden_daily() -> DailyAutoConfig {
        DailyAutoConfig::default()
    }

    #[test]
    fn launches_immediately_when_hidden_not_required() {
        let rig = rig_with(FakeHost::default(), visible_daily());

        let outcome = rig.runner.run_daily();
        assert_eq!(
            outcome,
            LaunchOutcome::Launched {
                date: "2026-03-02".to_string(),
                target: 3
            }
        );

        let config = rig.runner.config();
        assert!(config.running);
        assert_eq!(config.count, 0);
        assert_eq!(
            rig.host.opened.lock().unwrap().clone(),
            vec![("https://linux.do/latest".to_string(), true)]
        );
        assert_eq!(
            rig.host.sent.lock().unwrap().clone(),
            vec![Command::StartDaily {
                target: 3,
                date: "2026-03-02".to_string(),
                skip_idle_wait: false,
            }]
        );
    }

    #[test]
    fn second_attempt_while_running_is_a_no_op() {
        let rig = rig_with(FakeHost::default(), visible_daily());

        rig.runner.run_daily();
        assert_eq!(rig.runner.run_daily(), LaunchOutcome::AlreadyRunning);
        assert_eq!(rig.host.opened.lock().unwrap().len(), 1);
    }

    #[test]
    fn disabled_config_clears_pending_marker() {
        let rig = rig_with(
            FakeHost::default(),
            DailyAutoConfig {
                enabled: false,
                ..DailyAutoConfig::default()
            },
        );
        PendingIdleMarker {
            pending: true,
            requested_at: 1,
        }
        .save(&*rig.store);

        assert_eq!(rig.runner.run_daily(), LaunchOutcome::Disabled);
        assert!(!PendingIdleMarker::load(&*rig.store).pending);
    }

    #[test]
    fn no_data_defers_then_launches_after_quiet_period() {
        let rig = rig_with(FakeHost::default(), hidden_daily());
        let start = rig.clock.now_ms();

        let outcome = rig.runner.run_daily();
        assert_eq!(
            outcome,
            LaunchOutcome::Deferred {
                ready_at: start + 10 * 60_000
            }
        );
        let marker = PendingIdleMarker::load(&*rig.store);
        assert!(marker.pending);
        assert_eq!(marker.requested_at, start);
        assert_eq!(
            rig.alarms.get(PENDING_ALARM).map(|entry| entry.when_ms),
            Some(start + 10 * 60_000)
        );

        rig.clock.advance(5 * 60_000);
        assert!(matches!(
            rig.runner.run_pending(),
            Some(LaunchOutcome::Deferred { ready_at }) if ready_at == start + 10 * 60_000
        ));
        assert_eq!(PendingIdleMarker::load(&*rig.store).requested_at, start);

        rig.clock.advance(5 * 60_000);
        assert!(matches!(
            rig.runner.run_pending(),
            Some(LaunchOutcome::Launched { .. })
        ));
        assert!(!PendingIdleMarker::load(&*rig.store).pending);
        assert!(rig.alarms.get(PENDING_ALARM).is_none());
        assert_eq!(
            rig.host.opened.lock().unwrap().clone(),
            vec![("https://linux.do/latest".to_string(), false)]
        );
        assert!(matches!(
            rig.host.sent.lock().unwrap()[0],
            Command::StartDaily {
                skip_idle_wait: true,
                ..
            }
        ));
        assert_eq!(rig.runner.run_pending(), None);
    }

    #[test]
    fn visible_surface_keeps_launch_pending() {
        let rig = rig_with(FakeHost::default(), hidden_daily());
        let now = rig.clock.now_ms();
        TrackedLedger::with(&*rig.store, now, |ledger| {
            ledger.record_visibility("surface-9", true, now - 1_000)
        });

        let outcome = rig.runner.run_daily();
        assert_eq!(
            outcome,
            LaunchOutcome::Deferred {
                ready_at: now + 10 * 60_000
            }
        );
        assert!(rig.host.opened.lock().unwrap().is_empty());
    }

    #[test]
    fn stale_activity_is_ready_at_once() {
        let rig = rig_with(FakeHost::default(), hidden_daily());
        let now = rig.clock.now_ms();
        TrackedLedger::with(&*rig.store, now, |ledger| {
            ledger.record_visibility("surface-9", false, now - 20 * 60_000)
        });

        assert!(matches!(
            rig.runner.run_daily(),
            LaunchOutcome::Launched { .. }
        ));
    }

    #[test]
    fn wake_alarm_is_at_least_one_second_out() {
        let rig = rig_with(FakeHost::default(), hidden_daily());
        let now = rig.clock.now_ms();
        TrackedLedger::with(&*rig.store, now, |ledger| {
            ledger.record_activity("surface-9", now - 10 * 60_000 + 200)
        });

        assert_eq!(
            rig.runner.run_daily(),
            LaunchOutcome::Deferred {
                ready_at: now + 1_000
            }
        );
    }

    #[test]
    fn start_command_retries_until_receiver_attaches() {
        let host = FakeHost {
            refuse_first: Mutex::new(3),
            ..FakeHost::default()
        };
        let rig = rig_with(host, visible_daily());

        rig.runner.run_daily();
        assert_eq!(rig.host.sent.lock().unwrap().len(), 1);
        assert_eq!(rig.clock.waits(), vec![1_000, 1_000, 1_000]);
    }

    #[test]
    fn start_command_gives_up_after_bound() {
        let host = FakeHost {
            refuse_first: Mutex::new(50),
            ..FakeHost::default()
        };
        let rig = rig_with(host, visible_daily());

        rig.runner.run_daily();
        assert!(rig.host.sent.lock().unwrap().is_empty());
        assert_eq!(rig.clock.waits().len(), 10);
        assert!(rig.runner.config().running);
    }

    #[test]
    fn failed_open_reverts_running() {
        let host = FakeHost {
            fail_open: true,
            ..FakeHost::default()
        };
        let rig = rig_with(host, visible_daily());

        assert!(matches!(
            rig.runner.run_daily(),
            LaunchOutcome::Launched { .. }
        ));
        assert!(!rig.runner.config().running);
    }

    #[test]
    fn tick_enforces_deadline_and_issues_stop() {
        let rig = rig_with(FakeHost::default(), visible_daily());
        rig.runner.run_daily();

        rig.clock.set_local(local("2026-03-02 18:59"));
        rig.runner.on_tick();
        assert!(rig.runner.config().running);
        assert_eq!(load_signal(&*rig.store).at, 0);

        rig.clock.set_local(local("2026-03-02 19:00"));
        rig.runner.on_tick();
        assert!(!rig.runner.config().running);
        let first = load_signal(&*rig.store).at;
        assert!(first > 0);

        rig.runner.on_tick();
        assert_eq!(load_signal(&*rig.store).at, first);
    }

    #[test]
    fn startup_normalises_and_arms_daily_alarm() {
        let rig = rig_with(
            FakeHost::default(),
            DailyAutoConfig {
                window_start: "7:05".to_string(),
                window_end: "nonsense".to_string(),
                target: -4,
                date: "2026-02-27".to_string(),
                count: 9,
                ..DailyAutoConfig::default()
            },
        );

        let config = rig.runner.startup();
        assert_eq!(config.window_start, "07:05");
        assert_eq!(config.window_end, "17:05");
        assert_eq!(config.target, 50);
        assert_eq!(config.date, "2026-03-02");
        assert_eq!(config.count, 0);

        let alarm = rig.alarms.get(DAILY_ALARM).expect("daily alarm");
        let expected = local("2026-03-03 07:05").and_utc().timestamp_millis();
        assert_eq!(alarm.when_ms, expected);
        assert_eq!(alarm.period_ms, Some(DAY_MS));
    }

    #[test]
    fn update_rearms_alarm_for_new_start() {
        let rig = rig_with(FakeHost::default(), hidden_daily());

        let config = rig.runner.update(&DailyAutoPatch {
            window_start: Some("21:30".to_string()),
            target: Some(12),
            ..DailyAutoPatch::default()
        });
        assert_eq!(config.window_end, "07:30");
        assert_eq!(config.target, 12);
        let alarm = rig.alarms.get(DAILY_ALARM).expect("daily alarm");
        assert_eq!(
            alarm.when_ms,
            local("2026-03-02 21:30").and_utc().timestamp_millis()
        );
    }

    #[test]
    fn issue_stop_ends_daily_run_and_advances_signal() {
        let rig = rig_with(FakeHost::default(), visible_daily());
        rig.runner.run_daily();

        let first = rig.runner.issue_stop();
        let second = rig.runner.issue_stop();
        assert!(second > first);
        assert!(!rig.runner.config().running);
    }

    #[test]
    fn daily_alarm_routes_to_run() {
        let rig = rig_with(FakeHost::default(), visible_daily());
        rig.runner.on_alarm(DAILY_ALARM);
        assert!(rig.runner.config().running);
    }
}
