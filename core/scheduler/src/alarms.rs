//! Durable alarm book.
//!
//! Alarms are records in the store, so a restarted scheduler picks up where
//! the previous one left off. The tick thread drains due alarms with
//! [`StoredAlarms::take_due`]; repeating alarms are re-armed past `now`.

use autoread_core::store::{keys, load_record, save_record, DurableStore};
use autoread_core::Alarms;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmEntry {
    pub when_ms: i64,
    #[serde(default)]
    pub period_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AlarmBook {
    alarms: BTreeMap<String, AlarmEntry>,
}

pub struct StoredAlarms {
    store: Arc<dyn DurableStore>,
    // Serialises read-modify-write of the book within this process.
    lock: Mutex<()>,
}

impl StoredAlarms {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    fn update<R>(&self, change: impl FnOnce(&mut AlarmBook) -> R) -> R {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut book: AlarmBook = load_record(&*self.store, keys::ALARMS);
        let result = change(&mut book);
        save_record(&*self.store, keys::ALARMS, &book);
        result
    }

    pub fn get(&self, name: &str) -> Option<AlarmEntry> {
        let book: AlarmBook = load_record(&*self.store, keys::ALARMS);
        book.alarms.get(name).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, AlarmEntry> {
        let book: AlarmBook = load_record(&*self.store, keys::ALARMS);
        book.alarms
    }

    /// Names of alarms due at `now`. One-shot alarms are removed; repeating
    /// ones move to their first occurrence after `now`.
    pub fn take_due(&self, now: i64) -> Vec<String> {
        self.update(|book| {
            let mut due = Vec::new();
            book.alarms.retain(|name, entry| {
                if entry.when_ms > now {
                    return true;
                }
                due.push(name.clone());
                match entry.period_ms {
                    Some(period) if period > 0 => {
                        let missed = (now - entry.when_ms) / period + 1;
                        entry.when_ms += missed * period;
                        true
                    }
                    _ => false,
                }
            });
            due
        })
    }
}

impl Alarms for StoredAlarms {
    fn schedule_once_at(&self, name: &str, when_ms: i64) {
        debug!(alarm = name, when_ms, "Alarm armed");
        self.update(|book| {
            book.alarms.insert(
                name.to_string(),
                AlarmEntry {
                    when_ms,
                    period_ms: None,
                },
            );
        });
    }

    fn schedule_repeating(&self, name: &str, first_ms: i64, period_ms: i64) {
        debug!(alarm = name, first_ms, period_ms, "Repeating alarm armed");
        self.update(|book| {
            book.alarms.insert(
                name.to_string(),
                AlarmEntry {
                    when_ms: first_ms,
                    period_ms: Some(period_ms),
                },
            );
        });
    }

    fn cancel(&self, name: &str) {
        self.update(|book| {
            book.alarms.remove(name);
        });
    }
}
