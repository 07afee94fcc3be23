//! State owned by the scheduler process.
//!
//! Everything durable lives in the store; what is kept here in memory is a
//! cache the scheduler can afford to lose (latest stats per surface, recently
//! seen event ids, the surface registry).

use autoread_core::activity::TrackedLedger;
use autoread_core::daily::{self, PendingIdleMarker};
use autoread_core::signal::load_signal;
use autoread_core::{
    deliver_with_retry, Clock, DeliveryError, Diagnostics, DurableStore, RetryPolicy,
    StoragePaths, SurfaceHost, WaitGate,
};
use autoread_protocol::{Command, EventEnvelope, ExecutorEvent, Response, StatsSnapshot};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::alarms::StoredAlarms;
use crate::daily::{DailyRunner, LaunchOutcome, RunnerSettings};
use crate::settings::SchedulerSettings;
use crate::surfaces::LauncherHost;

const SEEN_EVENT_CAPACITY: usize = 512;

#[derive(Default)]
struct SeenEvents {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenEvents {
    /// False when `event_id` was already seen.
    fn insert(&mut self, event_id: &str) -> bool {
        if self.ids.contains(event_id) {
            return false;
        }
        if self.order.len() >= SEEN_EVENT_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(event_id.to_string());
        self.ids.insert(event_id.to_string());
        true
    }
}

pub struct SharedState {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    host: Arc<LauncherHost>,
    alarms: Arc<StoredAlarms>,
    runner: Arc<DailyRunner>,
    diagnostics: Arc<Diagnostics>,
    settings: SchedulerSettings,
    site_origin: Option<String>,
    gate: WaitGate,
    last_stats: Mutex<BTreeMap<String, StatsSnapshot>>,
    seen_events: Mutex<SeenEvents>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `scheme://host[:port]` of a URL, lowercased.
fn origin_of(url: &str) -> Option<String> {
    let scheme_end = url.find("://")?;
    let rest = &url[scheme_end + 3..];
    let host_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    if host_end == 0 {
        return None;
    }
    Some(url[..scheme_end + 3 + host_end].to_ascii_lowercase())
}

impl SharedState {
    pub fn new(
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
        paths: StoragePaths,
        diagnostics: Arc<Diagnostics>,
        settings: SchedulerSettings,
    ) -> Self {
        let host = Arc::new(LauncherHost::new(paths, settings.launcher.clone()));
        let alarms = Arc::new(StoredAlarms::new(Arc::clone(&store)));
        let runner = DailyRunner::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            alarms.clone(),
            host.clone(),
            Arc::clone(&diagnostics),
            RunnerSettings {
                listing_url: settings.site.listing_url.clone(),
                quiet_ms: settings.quiet_ms(),
                load_timeout: settings.load_timeout(),
                delivery: settings.delivery_policy(),
            },
        );
        Self::with_runner(store, clock, host, alarms, runner, diagnostics, settings)
    }

    pub fn with_runner(
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
        host: Arc<LauncherHost>,
        alarms: Arc<StoredAlarms>,
        runner: DailyRunner,
        diagnostics: Arc<Diagnostics>,
        settings: SchedulerSettings,
    ) -> Self {
        let site_origin = origin_of(&settings.site.listing_url);
        Self {
            store,
            clock,
            host,
            alarms,
            runner: Arc::new(runner),
            diagnostics,
            settings,
            site_origin,
            gate: WaitGate::new(),
            last_stats: Mutex::new(BTreeMap::new()),
            seen_events: Mutex::new(SeenEvents::default()),
        }
    }

    pub fn runner(&self) -> &Arc<DailyRunner> {
        &self.runner
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn startup(&self) {
        self.runner.startup();
        if PendingIdleMarker::load(&*self.store).pending {
            info!("Daily run was waiting on the idle gate before restart");
        }
    }

    /// Fires due alarms, then lets the runner sweep.
    pub fn tick(&self) {
        let now = self.clock.now_ms();
        for name in self.alarms.take_due(now) {
            debug!(alarm = %name, "Alarm due");
            self.runner.on_alarm(&name);
        }
        self.runner.on_tick();
    }

    fn on_site(&self, url: Option<&str>) -> bool {
        match (url, &self.site_origin) {
            (Some(url), Some(site)) => origin_of(url).as_deref() == Some(site.as_str()),
            _ => true,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────────────

    /// Applies one executor event. False when the event id was a duplicate.
    pub fn ingest(&self, envelope: &EventEnvelope) -> bool {
        if !lock(&self.seen_events).insert(&envelope.event_id) {
            debug!(event_id = %envelope.event_id, "Duplicate event ignored");
            return false;
        }

        let surface = envelope.surface_id.as_str();
        let url = envelope.url.as_deref();
        if let Some(url) = url {
            self.host.note_url(surface, url);
        }

        match &envelope.event {
            ExecutorEvent::Ready { endpoint } => {
                self.host
                    .register(surface, endpoint.clone(), envelope.url.clone());
            }
            ExecutorEvent::SiteVisibility { visible, at } => {
                if !self.on_site(url) {
                    self.remove_activity(surface);
                    return true;
                }
                let now = self.clock.now_ms();
                TrackedLedger::with(&*self.store, now, |ledger| {
                    ledger.record_visibility(surface, *visible, *at)
                });
                if let Some(outcome) = self.runner.run_pending() {
                    debug!(outcome = ?outcome, "Pending launch re-attempted");
                }
            }
            ExecutorEvent::SiteActivity { at } => {
                if !self.on_site(url) {
                    self.remove_activity(surface);
                    return true;
                }
                let now = self.clock.now_ms();
                TrackedLedger::with(&*self.store, now, |ledger| {
                    ledger.record_activity(surface, *at)
                });
            }
            ExecutorEvent::Stats { snapshot } => {
                lock(&self.last_stats).insert(surface.to_string(), snapshot.clone());
            }
            ExecutorEvent::Started => info!(surface, "Surface started reading"),
            ExecutorEvent::Stopped => info!(surface, "Surface stopped reading"),
            ExecutorEvent::Log { text } => debug!(surface, "{}", text),
            ExecutorEvent::ConfigUpdated { .. } => debug!(surface, "Surface config updated"),
        }
        true
    }

    fn remove_activity(&self, surface_id: &str) -> bool {
        let now = self.clock.now_ms();
        TrackedLedger::with(&*self.store, now, |ledger| ledger.remove_surface(surface_id))
    }

    /// Forgets a closed surface everywhere. True when anything was removed.
    pub fn forget_surface(&self, surface_id: &str) -> bool {
        let from_ledger = self.remove_activity(surface_id);
        let from_registry = self.host.forget(surface_id);
        lock(&self.last_stats).remove(surface_id);
        info!(surface = surface_id, from_ledger, from_registry, "Surface removed");
        from_ledger || from_registry
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────────

    /// Sends one command to one surface with the interactive retry policy.
    pub fn dispatch(&self, surface_id: &str, command: &Command) -> Response {
        if !self.host.surfaces().iter().any(|known| known == surface_id) {
            return Response::error(
                None,
                "unknown_surface",
                format!("surface {} is not registered", surface_id),
            );
        }

        let mut rejection = None;
        let delivered = deliver_with_retry(
            RetryPolicy::interactive(),
            &*self.clock,
            &self.gate,
            &self.diagnostics,
            command.name(),
            |_| match self.host.send_command(surface_id, command) {
                Err(DeliveryError::Rejected(info)) => {
                    rejection = Some(info.clone());
                    Err(DeliveryError::Rejected(info))
                }
                other => other,
            },
        );

        match (delivered, rejection) {
            (Some(response), _) => response,
            (None, Some(info)) => Response::error_with_info(None, info),
            (None, None) => Response::error(
                None,
                "no_receiver",
                format!("surface {} did not answer", surface_id),
            ),
        }
    }

    /// Sends a command to every registered surface, once each.
    pub fn broadcast(&self, command: &Command) -> Value {
        let mut results = serde_json::Map::new();
        for surface_id in self.host.surfaces() {
            let result = match self.host.send_command(&surface_id, command) {
                Ok(response) => serde_json::json!({ "ok": true, "data": response.data }),
                Err(err) => serde_json::json!({ "ok": false, "error": err.to_string() }),
            };
            results.insert(surface_id, result);
        }
        Value::Object(results)
    }

    pub fn run_daily_now(&self) -> LaunchOutcome {
        self.runner.run_daily()
    }

    /// Publishes a stop token, then tells every registered surface to stop
    /// so executors sleeping through a long wait wake up now.
    pub fn issue_stop(&self) -> Value {
        let at = self.runner.issue_stop();
        let surfaces = self.broadcast(&Command::Stop);
        info!(stop_at = at, "Stop issued");
        serde_json::json!({ "stop_at": at, "surfaces": surfaces })
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Snapshots
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn health(&self) -> Value {
        let surfaces: BTreeMap<String, Option<String>> = self
            .host
            .surfaces()
            .into_iter()
            .map(|surface_id| {
                let url = self.host.url_of(&surface_id);
                (surface_id, url)
            })
            .collect();
        serde_json::json!({
            "surfaces": surfaces,
            "stats": &*lock(&self.last_stats),
            "stop_signal": load_signal(&*self.store).at,
            "tick_secs": self.settings.tick_interval().as_secs(),
        })
    }

    pub fn daily_status(&self) -> Value {
        let now = self.clock.now_ms();
        let local = self.clock.local_now();
        let config = self.runner.config();
        let ledger = TrackedLedger::read(&*self.store, now);
        let quiet = self.runner.quiet_ms();
        let next_run_at = daily::next_run_at(&config.window_start, local)
            .format("%Y-%m-%d %H:%M")
            .to_string();
        serde_json::json!({
            "config": config,
            "pending": PendingIdleMarker::load(&*self.store),
            "next_run_at": next_run_at,
            "idle": ledger.background_info(now, quiet),
            "unattended": ledger.is_unattended(now, quiet, self.runner.observed_since()),
            "surfaces_tracked": ledger.surfaces.len(),
            "alarms": self.alarms.snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::LauncherSettings;
    use autoread_core::daily::DailyAutoConfig;
    use autoread_core::ipc::CommandEndpoint;
    use autoread_core::test_support::ManualClock;
    use autoread_core::MemoryStore;
    use autoread_protocol::ErrorInfo;
    use chrono::NaiveDateTime;
    use std::time::Duration;

    struct Rig {
        _temp: tempfile::TempDir,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        state: SharedState,
    }

    fn rig() -> Rig {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at_local(
            NaiveDateTime::parse_from_str("2026-03-02 09:00", "%Y-%m-%d %H:%M").unwrap(),
        ));
        let paths = StoragePaths::with_root(temp.path().to_path_buf());
        let settings = SchedulerSettings::default();
        let host = Arc::new(LauncherHost::new(paths, LauncherSettings::default()));
        let alarms = Arc::new(StoredAlarms::new(store.clone()));
        let diagnostics = Arc::new(Diagnostics::new());
        let runner = DailyRunner::new(
            store.clone(),
            clock.clone(),
            alarms.clone(),
            host.clone(),
            Arc::clone(&diagnostics),
            RunnerSettings {
                listing_url: settings.site.listing_url.clone(),
                quiet_ms: settings.quiet_ms(),
                load_timeout: Duration::from_millis(10),
                delivery: RetryPolicy::new(2, Duration::from_millis(1)),
            },
        )
        .with_inline_launch();
        let state = SharedState::with_runner(
            store.clone(),
            clock.clone(),
            host,
            alarms,
            runner,
            diagnostics,
            settings,
        );
        Rig {
            _temp: temp,
            store,
            clock,
            state,
        }
    }

    fn envelope(id: &str, surface: &str, url: &str, event: ExecutorEvent) -> EventEnvelope {
        EventEnvelope {
            event_id: id.to_string(),
            recorded_at: "2026-03-02T09:00:00Z".to_string(),
            surface_id: surface.to_string(),
            url: Some(url.to_string()),
            event,
        }
    }

    #[test]
    fn origin_extraction() {
        assert_eq!(
            origin_of("https://Linux.do/latest?x=1").as_deref(),
            Some("https://linux.do")
        );
        assert_eq!(
            origin_of("http://localhost:8080").as_deref(),
            Some("http://localhost:8080")
        );
        assert_eq!(origin_of("/t/topic/1"), None);
    }

    #[test]
    fn visibility_events_feed_the_ledger_once() {
        let rig = rig();
        let at = rig.clock.now_ms();
        let event = envelope(
            "evt-1",
            "surface-a",
            "https://linux.do/t/topic/1",
            ExecutorEvent::SiteVisibility { visible: true, at },
        );

        assert!(rig.state.ingest(&event));
        assert!(!rig.state.ingest(&event));

        let ledger = TrackedLedger::read(&*rig.store, at);
        assert!(ledger.any_visible());
        assert_eq!(rig.state.daily_status()["idle"]["reason"], "visible");
    }

    #[test]
    fn off_site_event_removes_surface_from_ledger() {
        let rig = rig();
        let at = rig.clock.now_ms();
        rig.state.ingest(&envelope(
            "evt-1",
            "surface-a",
            "https://linux.do/latest",
            ExecutorEvent::SiteActivity { at },
        ));
        assert_eq!(TrackedLedger::read(&*rig.store, at).surfaces.len(), 1);

        rig.state.ingest(&envelope(
            "evt-2",
            "surface-a",
            "https://example.com/",
            ExecutorEvent::SiteVisibility { visible: true, at },
        ));
        assert!(TrackedLedger::read(&*rig.store, at).surfaces.is_empty());
    }

    #[test]
    fn hidden_visibility_event_retries_pending_launch() {
        let rig = rig();
        let start = rig.clock.now_ms();
        assert!(matches!(
            rig.state.run_daily_now(),
            LaunchOutcome::Deferred { .. }
        ));

        rig.clock.advance(11 * 60_000);
        rig.state.ingest(&envelope(
            "evt-1",
            "surface-a",
            "https://linux.do/latest",
            ExecutorEvent::SiteVisibility {
                visible: false,
                at: start,
            },
        ));

        // No launcher is configured, so the launch is abandoned right away.
        assert!(!PendingIdleMarker::load(&*rig.store).pending);
        assert!(!rig.state.runner().config().running);
        assert!(!rig.state.diagnostics().snapshot().is_empty());
    }

    #[test]
    fn ready_event_registers_endpoint_and_dispatch_reaches_it() {
        let rig = rig();
        let endpoint_path = rig._temp.path().join("surface-a.sock");
        let endpoint = CommandEndpoint::bind(endpoint_path.clone()).expect("bind");
        let _server = endpoint.serve(Arc::new(|command: Command| match command {
            Command::StartDaily { .. } => {
                Response::error_with_info(None, ErrorInfo::new("stale_daily", "old date"))
            }
            other => Response::ok(None, serde_json::json!({ "action": other.name() })),
        }));

        rig.state.ingest(&envelope(
            "evt-ready",
            "surface-a",
            "https://linux.do/latest",
            ExecutorEvent::Ready {
                endpoint: Some(endpoint_path.to_string_lossy().to_string()),
            },
        ));

        let response = rig.state.dispatch("surface-a", &Command::GetConfig);
        assert!(response.ok);
        assert_eq!(response.data.unwrap()["action"], "getConfig");

        let rejected = rig.state.dispatch(
            "surface-a",
            &Command::StartDaily {
                target: 3,
                date: "2026-03-01".to_string(),
                skip_idle_wait: true,
            },
        );
        assert!(!rejected.ok);
        assert_eq!(rejected.error.unwrap().code, "stale_daily");

        let broadcast = rig.state.broadcast(&Command::Stop);
        assert_eq!(broadcast["surface-a"]["ok"], true);
    }

    #[test]
    fn issue_stop_reaches_registered_surfaces() {
        let rig = rig();
        let endpoint_path = rig._temp.path().join("surface-b.sock");
        let endpoint = CommandEndpoint::bind(endpoint_path.clone()).expect("bind");
        let received = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&received);
        let _server = endpoint.serve(Arc::new(move |command: Command| {
            lock(&seen).push(command);
            Response::success(None)
        }));

        rig.state.ingest(&envelope(
            "evt-ready",
            "surface-b",
            "https://linux.do/t/topic/9",
            ExecutorEvent::Ready {
                endpoint: Some(endpoint_path.to_string_lossy().to_string()),
            },
        ));

        let result = rig.state.issue_stop();
        assert!(result["stop_at"].as_i64().unwrap() > 0);
        assert_eq!(result["surfaces"]["surface-b"]["ok"], true);
        assert_eq!(*lock(&received), vec![Command::Stop]);
        assert_eq!(load_signal(&*rig.store).at, result["stop_at"].as_i64().unwrap());
    }

    #[test]
    fn dispatch_to_unknown_surface_fails_fast() {
        let rig = rig();
        let response = rig.state.dispatch("ghost", &Command::Stop);
        assert_eq!(response.error.unwrap().code, "unknown_surface");
        assert!(rig.clock.waits().is_empty());
    }

    #[test]
    fn forget_surface_clears_registry_ledger_and_stats() {
        let rig = rig();
        let at = rig.clock.now_ms();
        rig.state.ingest(&envelope(
            "evt-1",
            "surface-a",
            "https://linux.do/latest",
            ExecutorEvent::Ready { endpoint: None },
        ));
        rig.state.ingest(&envelope(
            "evt-2",
            "surface-a",
            "https://linux.do/latest",
            ExecutorEvent::SiteActivity { at },
        ));

        assert!(rig.state.forget_surface("surface-a"));
        assert!(rig.state.host.surfaces().is_empty());
        assert!(TrackedLedger::read(&*rig.store, at).surfaces.is_empty());
        assert!(!rig.state.forget_surface("surface-a"));
    }

    #[test]
    fn tick_fires_due_daily_alarm() {
        let rig = rig();
        daily::save_daily(
            &*rig.store,
            &DailyAutoConfig {
                window_start: "09:30".to_string(),
                ..DailyAutoConfig::default()
            },
        );
        rig.state.startup();

        rig.clock.advance(31 * 60_000);
        rig.state.tick();

        // require_hidden with no activity data: the launch waits on the idle gate.
        assert!(PendingIdleMarker::load(&*rig.store).pending);
        let status = rig.state.daily_status();
        assert_eq!(status["idle"]["reason"], "noData");
        assert!(status["alarms"]["daily-auto-pending"].is_object());
    }
}
