//! Deterministic fakes for driving executors in tests.
//!
//! Enabled with the `test-helpers` feature.

use autoread_protocol::ExecutorEvent;
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::channel::EventSink;
use crate::clock::Clock;
use crate::diagnostics::Diagnostics;
use crate::executor::ExecutorParts;
use crate::location::{classify, PageKind};
use crate::page::{HeuristicUnread, Page, SubItem};
use crate::random::Dice;
use crate::store::DurableStore;
use crate::wait::{WaitGate, WaitOutcome};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─────────────────────────────────────────────────────────────────────────────
// FakePage
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct FakePageState {
    pub location: String,
    pub item_links: Vec<String>,
    /// Sub-items per item path.
    pub sub_items: BTreeMap<String, Vec<SubItem>>,
    /// Batches appended to the current item on each scroll to the end.
    pub growth: VecDeque<Vec<SubItem>>,
    pub scroll_position: i64,
    pub last_read_key: Option<u64>,
    pub navigations: Vec<String>,
    pub reloads: u32,
    pub wiggles: u32,
    pub scrolled_into_view: Vec<u64>,
}

/// Scripted page. Clones share state so a test can keep a handle while the
/// executor owns a boxed copy.
#[derive(Debug, Default, Clone)]
pub struct FakePage {
    state: Arc<Mutex<FakePageState>>,
}

impl FakePage {
    pub fn at(location: &str) -> Self {
        let page = Self::default();
        page.state().location = location.to_string();
        page
    }

    pub fn state(&self) -> MutexGuard<'_, FakePageState> {
        lock(&self.state)
    }

    pub fn with_links(self, links: &[&str]) -> Self {
        self.state().item_links = links.iter().map(|link| link.to_string()).collect();
        self
    }

    pub fn with_sub_items(self, item_path: &str, keys: &[u64]) -> Self {
        self.state().sub_items.insert(
            item_path.to_string(),
            keys.iter().map(|key| SubItem::new(*key)).collect(),
        );
        self
    }

    pub fn push_growth(&self, keys: &[u64]) {
        self.state()
            .growth
            .push_back(keys.iter().map(|key| SubItem::new(*key)).collect());
    }

    pub fn set_location(&self, location: &str) {
        self.state().location = location.to_string();
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state().navigations.clone()
    }

    pub fn scrolled_into_view(&self) -> Vec<u64> {
        self.state().scrolled_into_view.clone()
    }

    fn current_item(state: &FakePageState) -> Option<String> {
        match classify(&state.location) {
            PageKind::Item(item) => Some(item.item_path),
            _ => None,
        }
    }
}

impl Page for FakePage {
    fn location(&self) -> String {
        self.state().location.clone()
    }

    fn item_links(&self) -> Vec<String> {
        self.state().item_links.clone()
    }

    fn sub_items(&self) -> Vec<SubItem> {
        let state = self.state();
        Self::current_item(&state)
            .and_then(|path| state.sub_items.get(&path).cloned())
            .unwrap_or_default()
    }

    fn last_read_key(&self) -> Option<u64> {
        self.state().last_read_key
    }

    fn is_in_view(&self, _item: &SubItem) -> bool {
        false
    }

    fn scroll_into_view(&mut self, item: &SubItem) {
        self.state().scrolled_into_view.push(item.key);
    }

    fn scroll_to_end(&mut self) {
        let mut state = self.state();
        let Some(path) = Self::current_item(&state) else {
            return;
        };
        if let Some(batch) = state.growth.pop_front() {
            state.sub_items.entry(path.clone()).or_default().extend(batch);
        }
        let count = state.sub_items.get(&path).map_or(0, Vec::len) as i64;
        state.scroll_position = state.scroll_position.max(count * 100);
    }

    fn scroll_position(&self) -> i64 {
        self.state().scroll_position
    }

    fn pointer_wiggle(&mut self) {
        self.state().wiggles += 1;
    }

    fn navigate(&mut self, url: &str) {
        let mut state = self.state();
        state.navigations.push(url.to_string());
        state.location = url.to_string();
        state.scroll_position = 0;
    }

    fn reload(&mut self) {
        let mut state = self.state();
        state.reloads += 1;
        state.scroll_position = 0;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ManualClock
// ─────────────────────────────────────────────────────────────────────────────

type WaitHook = Box<dyn FnMut(i64) + Send>;

/// Virtual clock. Waits return immediately after advancing time; hooks run
/// on every wait so a test can inject commands "while" the executor sleeps.
/// Local time is the UTC reading of the virtual instant.
pub struct ManualClock {
    now: Mutex<i64>,
    waited: Mutex<Vec<u64>>,
    hooks: Mutex<Vec<WaitHook>>,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: Mutex::new(now_ms),
            waited: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn at_local(local: NaiveDateTime) -> Self {
        Self::new(local.and_utc().timestamp_millis())
    }

    pub fn advance(&self, ms: i64) {
        *lock(&self.now) += ms;
    }

    pub fn set_local(&self, local: NaiveDateTime) {
        *lock(&self.now) = local.and_utc().timestamp_millis();
    }

    pub fn on_wait(&self, hook: impl FnMut(i64) + Send + 'static) {
        lock(&self.hooks).push(Box::new(hook));
    }

    pub fn waits(&self) -> Vec<u64> {
        lock(&self.waited).clone()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        *lock(&self.now)
    }

    fn local_now(&self) -> NaiveDateTime {
        chrono::DateTime::from_timestamp_millis(self.now_ms())
            .map(|instant| instant.naive_utc())
            .unwrap_or_default()
    }

    fn wait(&self, duration: Duration, gate: &WaitGate) -> WaitOutcome {
        let generation = gate.generation();
        let ms = duration.as_millis() as u64;
        let now = {
            let mut now = lock(&self.now);
            *now += ms as i64;
            *now
        };
        lock(&self.waited).push(ms);
        for hook in lock(&self.hooks).iter_mut() {
            hook(now);
        }
        if gate.generation() != generation {
            WaitOutcome::Released
        } else {
            WaitOutcome::Elapsed
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordingSink
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ExecutorEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutorEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, matches: impl Fn(&ExecutorEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|event| matches(event)).count()
    }

    pub fn stopped_count(&self) -> usize {
        self.count(|event| matches!(event, ExecutorEvent::Stopped))
    }

    pub fn started_count(&self) -> usize {
        self.count(|event| matches!(event, ExecutorEvent::Started))
    }

    pub fn logs(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                ExecutorEvent::Log { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &ExecutorEvent) {
        lock(&self.events).push(event.clone());
    }
}

/// Executor parts wired to fakes: heuristic unread detection, fixed seed.
pub fn fake_parts(
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    page: &FakePage,
) -> ExecutorParts {
    ExecutorParts {
        surface_id: "surface-1".to_string(),
        endpoint: None,
        store,
        clock,
        sink,
        diagnostics: Arc::new(Diagnostics::new()),
        page: Box::new(page.clone()),
        unread: Box::new(HeuristicUnread),
        dice: Dice::seeded(7),
    }
}
