//! Durable Store.
//!
//! Records are independent JSON documents under fixed keys. The store is
//! best-effort from every caller's point of view: [`load_record`] degrades to
//! `T::default()` when the record is missing, corrupt, or the backend is
//! unavailable, and [`save_record`] logs and moves on when a write fails.
//! Callers re-read before each decision instead of caching. A backend built
//! with a [`Diagnostics`] handle also lands each failure in that buffer.

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::diagnostics::Diagnostics;
use crate::error::{ReaderError, Result};

pub mod keys {
    pub const SESSION: &str = "session";
    pub const DAILY_AUTO: &str = "daily_auto";
    pub const SITE_ACTIVITY: &str = "site_activity";
    pub const STOP_SIGNAL: &str = "stop_signal";
    pub const DAILY_PENDING: &str = "daily_pending";
    pub const ALARMS: &str = "alarms";
}

pub trait DurableStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<String>>;
    fn put_raw(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;

    /// Buffer that swallowed failures are reported to.
    fn diagnostics(&self) -> Option<&Diagnostics> {
        None
    }
}

fn report(store: &dyn DurableStore, key: &str, message: &str, err: &dyn std::fmt::Display) {
    match store.diagnostics() {
        Some(diagnostics) => diagnostics.record("store", format!("{}: {} ({})", key, message, err)),
        None => tracing::warn!(key, error = %err, "{}", message),
    }
}

/// Reads a record, falling back to the default on any failure.
pub fn load_record<T>(store: &dyn DurableStore, key: &str) -> T
where
    T: DeserializeOwned + Default,
{
    let raw = match store.get_raw(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return T::default(),
        Err(err) => {
            report(store, key, "Store read failed; using defaults", &err);
            return T::default();
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(source) => {
            let err = ReaderError::Json {
                context: format!("record {}", key),
                source,
            };
            report(store, key, "Stored record is corrupt; using defaults", &err);
            T::default()
        }
    }
}

/// Writes a record. Failures are logged, never returned.
pub fn save_record<T: Serialize>(store: &dyn DurableStore, key: &str, value: &T) {
    let encoded = match serde_json::to_string(value) {
        Ok(encoded) => encoded,
        Err(err) => {
            report(store, key, "Failed to encode record", &err);
            return;
        }
    };
    if let Err(err) = store.put_raw(key, &encoded) {
        report(store, key, "Store write failed; continuing", &err);
    }
}

pub fn remove_record(store: &dyn DurableStore, key: &str) {
    if let Err(err) = store.remove(key) {
        report(store, key, "Store remove failed; continuing", &err);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
    diagnostics: Option<Arc<Diagnostics>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Simulates the backend going away (every call fails) or coming back.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self, context: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ReaderError::storage(context, "memory store marked unavailable"));
        }
        Ok(())
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DurableStore for MemoryStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        self.check("get")?;
        Ok(self.records().get(key).cloned())
    }

    fn put_raw(&self, key: &str, value: &str) -> Result<()> {
        self.check("put")?;
        self.records().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check("remove")?;
        self.records().remove(key);
        Ok(())
    }

    fn diagnostics(&self) -> Option<&Diagnostics> {
        self.diagnostics.as_deref()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQLite backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Key/value records in a single SQLite table. Each operation opens its own
/// connection so the scheduler and embedded executors can share one file.
pub struct SqliteStore {
    path: PathBuf,
    diagnostics: Option<Arc<Diagnostics>>,
}

impl SqliteStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let store = Self {
            path,
            diagnostics: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS records (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );",
            )
            .map_err(|err| ReaderError::storage("init schema", err))
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| ReaderError::storage("create data dir", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| ReaderError::storage("open sqlite db", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| ReaderError::storage("enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| ReaderError::storage("set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| ReaderError::storage("set busy_timeout", err))?;

        Ok(conn)
    }
}

impl DurableStore for SqliteStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT value FROM records WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|err| ReaderError::storage(format!("read {}", key), err))
        })
    }

    fn put_raw(&self, key: &str, value: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO records (key, value, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                 updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .map_err(|err| ReaderError::storage(format!("write {}", key), err))?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM records WHERE key = ?1", params![key])
                .map_err(|err| ReaderError::storage(format!("remove {}", key), err))?;
            Ok(())
        })
    }

    fn diagnostics(&self) -> Option<&Diagnostics> {
        self.diagnostics.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u32,
        label: String,
    }

    #[test]
    fn missing_record_loads_default() {
        let store = MemoryStore::new();
        let loaded: Sample = load_record(&store, "sample");
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn corrupt_record_loads_default() {
        let store = MemoryStore::new();
        store.put_raw("sample", "{not json").unwrap();
        let loaded: Sample = load_record(&store, "sample");
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn unavailable_store_degrades_reads_and_writes() {
        let store = MemoryStore::new();
        save_record(
            &store,
            "sample",
            &Sample {
                count: 3,
                label: "kept".to_string(),
            },
        );
        store.set_available(false);

        save_record(
            &store,
            "sample",
            &Sample {
                count: 9,
                label: "lost".to_string(),
            },
        );
        let during: Sample = load_record(&store, "sample");
        assert_eq!(during, Sample::default());

        store.set_available(true);
        let after: Sample = load_record(&store, "sample");
        assert_eq!(after.count, 3);
    }

    #[test]
    fn failures_land_in_diagnostics() {
        let diagnostics = Arc::new(Diagnostics::new());
        let store = MemoryStore::new().with_diagnostics(Arc::clone(&diagnostics));
        store.put_raw(keys::SESSION, "{not json").unwrap();

        let _: Sample = load_record(&store, keys::SESSION);
        store.set_available(false);
        save_record(&store, keys::DAILY_AUTO, &Sample::default());
        remove_record(&store, keys::STOP_SIGNAL);

        let entries = diagnostics.snapshot();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|entry| entry.source == "store"));
        assert!(entries[0].message.starts_with("stop_signal: Store remove failed"));
        assert!(entries[1].message.starts_with("daily_auto: Store write failed"));
        assert!(entries[2].message.starts_with("session: Stored record is corrupt"));
    }

    #[test]
    fn sqlite_round_trips_and_removes() {
        let temp = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(temp.path().join("nested").join("state.db")).unwrap();

        save_record(
            &store,
            keys::SESSION,
            &Sample {
                count: 2,
                label: "a".to_string(),
            },
        );
        save_record(
            &store,
            keys::SESSION,
            &Sample {
                count: 5,
                label: "b".to_string(),
            },
        );
        let loaded: Sample = load_record(&store, keys::SESSION);
        assert_eq!(loaded.count, 5);

        remove_record(&store, keys::SESSION);
        assert_eq!(store.get_raw(keys::SESSION).unwrap(), None);
    }

    #[test]
    fn sqlite_is_shared_between_handles() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("state.db");
        let writer = SqliteStore::new(path.clone()).unwrap();
        let reader = SqliteStore::new(path).unwrap();

        writer.put_raw(keys::STOP_SIGNAL, "{\"at\":10}").unwrap();
        assert_eq!(
            reader.get_raw(keys::STOP_SIGNAL).unwrap().as_deref(),
            Some("{\"at\":10}")
        );
    }
}
