//! Foreground Executor.
//!
//! One `Executor` lives exactly as long as one page load. It is rebuilt from
//! the durable session on every navigation, drives that page (listing or
//! item), and either navigates away or stops. Nothing it holds in memory
//! outlives the page; anything the next page needs is persisted first.
//!
//! Commands arrive on another thread through an [`ExecutorHandle`]. They
//! mutate the same session under a mutex and release pending waits, so a
//! stop is seen within one wait rather than at the next natural checkpoint.
//!
//! Every wait goes through a checkpoint on both sides:
//! stop fence, then daily deadline, then the run flag.

use autoread_protocol::{Command, ExecutorEvent, ReaderConfig, Response};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

use crate::activity::ActivityThrottle;
use crate::channel::EventSink;
use crate::clock::Clock;
use crate::daily::{self, ProgressOutcome};
use crate::diagnostics::Diagnostics;
use crate::error::ReaderError;
use crate::location::{classify, resolve_url, ItemLocation, PageKind};
use crate::page::{Page, UnreadPredicate};
use crate::random::Dice;
use crate::session::{IdleGateState, SessionState};
use crate::signal::{issue_stop, load_signal, stale_resume, StopFence, StopSignal};
use crate::store::DurableStore;
use crate::traversal::{run_traversal, AbortReason, TraversalHost, TraversalOutcome};
use crate::wait::{WaitGate, WaitOutcome};

pub const LIST_SETTLE_MS: (u64, u64) = (1_500, 2_500);
pub const ITEM_SETTLE_MS: (u64, u64) = (1_500, 2_500);
pub const NEXT_ITEM_DELAY_MS: (u64, u64) = (1_000, 2_000);
pub const QUICK_DWELL_MS: (u64, u64) = (5_000, 10_000);
pub const LIST_GRACE_STEPS: u32 = 60;
pub const LIST_GRACE_STEP_MS: u64 = 1_000;
/// Local quiet time required before a daily run that asked to wait for idle.
pub const IDLE_GATE_QUIET_MS: i64 = 60_000;
const IDLE_GATE_POLL_MS: i64 = 5_000;

pub struct ExecutorParts {
    pub surface_id: String,
    /// Command endpoint advertised in the `ready` event.
    pub endpoint: Option<String>,
    pub store: Arc<dyn DurableStore>,
    pub clock: Arc<dyn Clock>,
    pub sink: Arc<dyn EventSink>,
    pub diagnostics: Arc<Diagnostics>,
    pub page: Box<dyn Page>,
    pub unread: Box<dyn UnreadPredicate>,
    pub dice: Dice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// Not running; nothing to do on this page.
    Idle,
    Navigated(String),
    Reloaded,
    Stopped,
    /// Traversal gave up on this page; state is persisted, no navigation.
    Aborted(AbortReason),
}

struct Shared {
    surface_id: String,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    diagnostics: Arc<Diagnostics>,
    gate: WaitGate,
    session: Mutex<SessionState>,
    fence: Mutex<StopFence>,
    throttle: Mutex<ActivityThrottle>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.session)
    }

    fn is_running(&self) -> bool {
        self.session().is_running
    }

    fn config(&self) -> ReaderConfig {
        self.session().config.clone()
    }

    fn persist(&self) {
        self.session().save(&*self.store);
    }

    fn log(&self, text: impl Into<String>) {
        let text = text.into();
        info!(surface = %self.surface_id, "{}", text);
        self.sink.emit(&ExecutorEvent::Log { text });
    }

    fn emit_stats(&self) {
        let now = self.clock.now_ms();
        let snapshot = {
            let session = self.session();
            session.stats_snapshot(now, session.current_item.clone())
        };
        self.sink.emit(&ExecutorEvent::Stats { snapshot });
    }

    /// Starts (or, with `fresh`, resets and restarts) the run.
    fn start(&self, fresh: bool) -> bool {
        let now = self.clock.now_ms();
        let signal = load_signal(&*self.store);
        let started = {
            let mut session = self.session();
            let changed = if fresh {
                session.reset_for_new_run(now);
                true
            } else {
                session.mark_started(now)
            };
            if changed {
                // A stop issued in the same instant must not cancel this start.
                if signal.at >= now {
                    session.last_start_time = Some(signal.at + 1);
                }
                session.save(&*self.store);
            }
            changed
        };
        lock(&self.fence).observe(&signal);

        if started {
            self.sink.emit(&ExecutorEvent::Started);
            self.log(if fresh {
                "Started a fresh run"
            } else {
                "Started"
            });
            self.gate.release_all();
        }
        started
    }

    /// Stops the run. Emits `stopped` only on the running → stopped edge.
    fn stop(&self, reason: &str) -> bool {
        let now = self.clock.now_ms();
        let changed = {
            let mut session = self.session();
            let changed = session.mark_stopped(now);
            if changed {
                session.save(&*self.store);
            }
            changed
        };

        if changed {
            self.log(format!("Stopped: {}", reason));
            self.sink.emit(&ExecutorEvent::Stopped);
            self.emit_stats();
        }
        self.gate.release_all();
        changed
    }

    /// Ends the daily run everywhere: publish a stop token, consume it here.
    fn finish_daily(&self, reason: &str) {
        let at = issue_stop(&*self.store, self.clock.now_ms());
        lock(&self.fence).observe(&StopSignal { at });
        self.stop(reason);
    }

    /// True when the flow may continue.
    fn checkpoint(&self) -> bool {
        let signal = load_signal(&*self.store);
        if lock(&self.fence).observe(&signal) {
            self.stop("stop signal received");
            return false;
        }

        if self.is_running() && daily::enforce_deadline(&*self.store, self.clock.local_now()) {
            self.finish_daily("daily window closed");
            return false;
        }

        self.is_running()
    }

    /// Cancellable sleep bracketed by checkpoints.
    fn pause(&self, ms: u64) -> bool {
        if !self.checkpoint() {
            return false;
        }
        self.clock.wait(Duration::from_millis(ms), &self.gate);
        self.checkpoint()
    }

    fn note_visibility(&self, visible: bool, at: i64) {
        self.sink.emit(&ExecutorEvent::SiteVisibility { visible, at });
        if visible {
            self.extend_idle_gate(at);
        }
    }

    fn note_user_activity(&self, at: i64) {
        self.extend_idle_gate(at);
        if lock(&self.throttle).should_record(at) {
            self.sink.emit(&ExecutorEvent::SiteActivity { at });
        }
    }

    fn extend_idle_gate(&self, at: i64) {
        let mut session = self.session();
        if !session.idle_gate.pending {
            return;
        }
        let until = at + IDLE_GATE_QUIET_MS;
        session.idle_gate.last_action_at = Some(at);
        session.idle_gate.wait_until = Some(session.idle_gate.wait_until.map_or(until, |current| current.max(until)));
        session.save(&*self.store);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command handling
// ═══════════════════════════════════════════════════════════════════════════════

/// Thread-safe command entry point for one executor.
#[derive(Clone)]
pub struct ExecutorHandle {
    shared: Arc<Shared>,
}

impl ExecutorHandle {
    /// Applies one command. Every command is idempotent.
    pub fn handle(&self, command: Command) -> Response {
        if let Err(err) = command.validate() {
            return Response::error_with_info(None, err);
        }
        let shared = &self.shared;

        match command {
            Command::Start => {
                let started = shared.start(false);
                Response::ok(None, serde_json::json!({ "success": true, "started": started }))
            }
            Command::StartDaily {
                target,
                date,
                skip_idle_wait,
            } => {
                let today = daily::today_string(shared.clock.local_now());
                if date != today {
                    return Response::error(
                        None,
                        "stale_daily",
                        format!("daily run for {} is not today's ({})", date, today),
                    );
                }
                if shared.is_running() {
                    return Response::ok(
                        None,
                        serde_json::json!({ "success": true, "started": false }),
                    );
                }

                let started = shared.start(false);
                if started && !skip_idle_wait {
                    let now = shared.clock.now_ms();
                    let mut session = shared.session();
                    session.idle_gate = IdleGateState {
                        last_action_at: session.idle_gate.last_action_at,
                        wait_until: Some(now + IDLE_GATE_QUIET_MS),
                        pending: true,
                    };
                    session.save(&*shared.store);
                }
                shared.log(format!("Daily run started (target {})", target));
                Response::ok(
                    None,
                    serde_json::json!({
                        "success": true,
                        "started": started,
                        "idleWait": started && !skip_idle_wait,
                    }),
                )
            }
            Command::Stop => {
                shared.stop("stop requested");
                Response::success(None)
            }
            Command::ResetAndStart => {
                shared.start(true);
                Response::success(None)
            }
            Command::ResetHistory => {
                {
                    let mut session = shared.session();
                    session.reset_history();
                    session.save(&*shared.store);
                }
                shared.log("History cleared");
                shared.emit_stats();
                Response::success(None)
            }
            Command::UpdateConfig { config } => {
                let merged = {
                    let mut session = shared.session();
                    session.config = session.config.merge(&config);
                    session.save(&*shared.store);
                    session.config.clone()
                };
                shared.sink.emit(&ExecutorEvent::ConfigUpdated {
                    config: merged.clone(),
                });
                shared.gate.release_all();
                Response::ok(
                    None,
                    serde_json::json!({ "success": true, "config": merged }),
                )
            }
            Command::GetConfig => {
                Response::ok(None, serde_json::json!({ "config": shared.config() }))
            }
            Command::GetStats => {
                let persisted = SessionState::load(&*shared.store);
                let snapshot = persisted
                    .stats_snapshot(shared.clock.now_ms(), persisted.current_item.clone());
                Response::ok(None, serde_json::json!({ "stats": snapshot }))
            }
        }
    }

    pub fn note_visibility(&self, visible: bool, at: i64) {
        self.shared.note_visibility(visible, at);
    }

    pub fn note_user_activity(&self, at: i64) {
        self.shared.note_user_activity(at);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Page driving
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Executor {
    shared: Arc<Shared>,
    page: Box<dyn Page>,
    unread: Box<dyn UnreadPredicate>,
    dice: Dice,
}

impl Executor {
    /// Rebuilds the executor for a freshly loaded page.
    pub fn load(parts: ExecutorParts) -> Self {
        let session = SessionState::load(&*parts.store);
        let signal = load_signal(&*parts.store);
        let stale = stale_resume(&session, &signal);

        let shared = Arc::new(Shared {
            surface_id: parts.surface_id,
            store: parts.store,
            clock: parts.clock,
            sink: parts.sink,
            diagnostics: parts.diagnostics,
            gate: WaitGate::new(),
            session: Mutex::new(session),
            fence: Mutex::new(StopFence::new(signal.at)),
            throttle: Mutex::new(ActivityThrottle::default()),
        });

        if stale {
            shared.stop("stop was issued before this page loaded");
        }

        shared.sink.emit(&ExecutorEvent::Ready {
            endpoint: parts.endpoint,
        });

        Self {
            shared,
            page: parts.page,
            unread: parts.unread,
            dice: parts.dice,
        }
    }

    pub fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn surface_id(&self) -> &str {
        &self.shared.surface_id
    }

    pub fn session(&self) -> SessionState {
        self.shared.session().clone()
    }

    /// Blocks until a command releases the executor or `timeout` passes.
    pub fn park(&self, timeout: Duration) -> WaitOutcome {
        self.shared.clock.wait(timeout, &self.shared.gate)
    }

    pub fn note_visibility(&self, visible: bool, at: i64) {
        self.shared.note_visibility(visible, at);
    }

    pub fn note_user_activity(&self, at: i64) {
        self.shared.note_user_activity(at);
    }

    /// Persists the session as the page goes away and hands the page back
    /// for the next load.
    pub fn unload(self) -> Box<dyn Page> {
        self.shared.persist();
        self.page
    }

    /// Runs this page to its conclusion.
    pub fn drive(&mut self) -> PageOutcome {
        let was_running = self.shared.is_running();
        if !self.shared.checkpoint() {
            return if was_running {
                PageOutcome::Stopped
            } else {
                PageOutcome::Idle
            };
        }

        if !self.await_idle_gate() {
            return PageOutcome::Stopped;
        }

        let location = self.page.location();
        match classify(&location) {
            PageKind::List => self.drive_list(),
            PageKind::Item(item) => self.drive_item(item),
            PageKind::Other => {
                self.shared
                    .log(format!("{} is not a listing or item page", location));
                self.back_to_listing()
            }
        }
    }

    fn await_idle_gate(&mut self) -> bool {
        let mut announced = false;
        loop {
            let (pending, wait_until) = {
                let session = self.shared.session();
                (session.idle_gate.pending, session.idle_gate.wait_until)
            };
            if !pending {
                return true;
            }

            let now = self.shared.clock.now_ms();
            let until = wait_until.unwrap_or(now);
            if now >= until {
                {
                    let mut session = self.shared.session();
                    session.idle_gate.pending = false;
                    session.idle_gate.wait_until = None;
                    session.save(&*self.shared.store);
                }
                self.shared.log("Idle wait finished");
                return true;
            }

            if !announced {
                self.shared
                    .log(format!("Waiting {} s for the site to go quiet", (until - now) / 1000));
                announced = true;
            }
            let step = (until - now).min(IDLE_GATE_POLL_MS).max(1) as u64;
            if !self.shared.pause(step) {
                return false;
            }
        }
    }

    fn listing_url(&self) -> String {
        self.shared.config().listing_url
    }

    fn back_to_listing(&mut self) -> PageOutcome {
        let url = self.listing_url();
        self.page.navigate(&url);
        PageOutcome::Navigated(url)
    }

    fn unvisited_items(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let session = self.shared.session();
        self.page
            .item_links()
            .iter()
            .filter_map(|link| match classify(link) {
                PageKind::Item(item) => Some(item.item_path),
                _ => None,
            })
            .filter(|path| seen.insert(path.clone()))
            .filter(|path| !session.visited_items.contains(path))
            .collect()
    }

    fn drive_list(&mut self) -> PageOutcome {
        let settle = self.dice.uniform_ms(LIST_SETTLE_MS.0, LIST_SETTLE_MS.1);
        if !self.shared.pause(settle) {
            return PageOutcome::Stopped;
        }

        let candidates = self.unvisited_items();
        let Some(next) = candidates.first() else {
            self.shared.log(format!(
                "Every listed item has been read; refreshing in {} s",
                LIST_GRACE_STEPS
            ));
            for _ in 0..LIST_GRACE_STEPS {
                if !self.shared.pause(LIST_GRACE_STEP_MS) {
                    return PageOutcome::Stopped;
                }
            }
            self.page.reload();
            return PageOutcome::Reloaded;
        };

        let delay = self.dice.uniform_ms(NEXT_ITEM_DELAY_MS.0, NEXT_ITEM_DELAY_MS.1);
        self.shared.log(format!(
            "Opening {} ({} left)",
            next,
            candidates.len() - 1
        ));
        if !self.shared.pause(delay) {
            return PageOutcome::Stopped;
        }

        let url = resolve_url(&self.listing_url(), next);
        self.page.navigate(&url);
        PageOutcome::Navigated(url)
    }

    fn drive_item(&mut self, location: ItemLocation) -> PageOutcome {
        let path = location.item_path.clone();
        // A stored key without an item name belongs to whatever item the
        // surface reloaded into.
        let (resuming, adopted, visited) = {
            let session = self.shared.session();
            let named = session.current_item.as_deref() == Some(path.as_str());
            let adopted = session.current_item.is_none() && session.last_sub_item_key.is_some();
            (
                named || adopted,
                adopted,
                session.visited_items.contains(&path),
            )
        };

        if !resuming && visited {
            self.shared
                .log(format!("{} was already read; back to the listing", path));
            return self.back_to_listing();
        }

        if resuming {
            if adopted {
                let mut session = self.shared.session();
                if session.visited_items.insert(path.clone()) {
                    session.stats.total_items += 1;
                }
                session.current_item = Some(path.clone());
                session.save(&*self.shared.store);
            }
            self.shared.log(format!("Resuming {}", path));
        } else {
            let mut session = self.shared.session();
            session.visited_items.insert(path.clone());
            session.stats.total_items += 1;
            session.current_item = Some(path.clone());
            session.last_sub_item_key = None;
            session.save(&*self.shared.store);
            drop(session);
            self.shared.log(format!("Reading {}", path));
        }

        let settle = self.dice.uniform_ms(ITEM_SETTLE_MS.0, ITEM_SETTLE_MS.1);
        if !self.shared.pause(settle) {
            return PageOutcome::Stopped;
        }
        let config = self.shared.config();
        if self.dice.bernoulli(config.pointer_probability) {
            self.page.pointer_wiggle();
        }

        if !config.quick_mode {
            let last_key = self.shared.session().last_sub_item_key;
            let outcome = {
                let mut host = HostView {
                    shared: &self.shared,
                    dice: &mut self.dice,
                };
                run_traversal(
                    self.page.as_mut(),
                    self.unread.as_ref(),
                    &mut host,
                    &location,
                    last_key,
                )
            };

            match outcome {
                TraversalOutcome::Completed { .. } => {}
                TraversalOutcome::Aborted {
                    reason: AbortReason::QuickMode,
                    ..
                } => self.shared.log("Quick mode switched on; skipping the rest"),
                TraversalOutcome::Aborted {
                    reason: AbortReason::Stopped,
                    ..
                } => return PageOutcome::Stopped,
                TraversalOutcome::Aborted {
                    reason: AbortReason::Drift { expected, actual },
                    ..
                } => {
                    let err = ReaderError::NavigationDrift {
                        expected: expected.clone(),
                        actual: actual.clone(),
                    };
                    {
                        let mut session = self.shared.session();
                        session.stats.errors += 1;
                        session.save(&*self.shared.store);
                    }
                    self.shared.diagnostics.record("traversal", err.to_string());
                    self.shared.log(err.to_string());
                    return PageOutcome::Aborted(AbortReason::Drift { expected, actual });
                }
            }
        }

        let config = self.shared.config();
        let (low, high) = if config.quick_mode {
            QUICK_DWELL_MS
        } else {
            (config.min_stay_ms, config.max_stay_ms)
        };
        let stay = self.dice.uniform_ms(low, high);
        self.shared
            .log(format!("Staying on the page for {} s", stay / 1000));
        if !self.shared.pause(stay) {
            return PageOutcome::Stopped;
        }

        self.complete_item(path)
    }

    fn complete_item(&mut self, path: String) -> PageOutcome {
        let now = self.shared.clock.now_ms();
        let snapshot = {
            let mut session = self.shared.session();
            session.current_item = None;
            session.last_sub_item_key = None;
            session.save(&*self.shared.store);
            session.stats_snapshot(now, Some(path))
        };
        self.shared.sink.emit(&ExecutorEvent::Stats { snapshot });

        match daily::record_progress(&*self.shared.store, self.shared.clock.local_now()) {
            ProgressOutcome::NotRunning => {}
            ProgressOutcome::Counted { count, target } => {
                self.shared
                    .log(format!("Daily progress {}/{}", count, target));
            }
            ProgressOutcome::TargetReached { count, target } => {
                self.shared
                    .log(format!("Daily target reached ({}/{})", count, target));
                self.shared.finish_daily("daily target reached");
                return PageOutcome::Stopped;
            }
        }

        if !self.shared.checkpoint() {
            return PageOutcome::Stopped;
        }
        self.back_to_listing()
    }
}

struct HostView<'a> {
    shared: &'a Shared,
    dice: &'a mut Dice,
}

impl TraversalHost for HostView<'_> {
    fn abort_reason(&self) -> Option<AbortReason> {
        let session = self.shared.session();
        if !session.is_running {
            Some(AbortReason::Stopped)
        } else if session.config.quick_mode {
            Some(AbortReason::QuickMode)
        } else {
            None
        }
    }

    fn pause(&mut self, ms: u64) -> bool {
        self.shared.pause(ms)
    }

    fn persist_last_key(&mut self, key: Option<u64>) {
        let mut session = self.shared.session();
        session.last_sub_item_key = key;
        session.save(&*self.shared.store);
    }

    fn read_delay_ms(&mut self) -> u64 {
        let config = self.shared.config();
        self.dice.uniform_ms(config.min_read_ms, config.max_read_ms)
    }

    fn roll_pointer(&mut self) -> bool {
        let probability = self.shared.config().pointer_probability;
        self.dice.bernoulli(probability)
    }

    fn log(&mut self, text: &str) {
        self.shared.log(text);
    }
}
