//! Bounded in-memory diagnostics buffer.
//!
//! Boundary failures that are otherwise swallowed (dropped deliveries, store
//! errors, traversal drift) land here so `get_diagnostics` can show them.
//! Newest first; the oldest entry is dropped once the buffer is full.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DIAGNOSTICS_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticEntry {
    pub at: i64,
    pub source: String,
    pub message: String,
}

#[derive(Debug)]
pub struct Diagnostics {
    entries: Mutex<VecDeque<DiagnosticEntry>>,
    capacity: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::with_capacity(DIAGNOSTICS_CAPACITY)
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, source: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(source, message = %message, "Diagnostic recorded");

        let entry = DiagnosticEntry {
            at: chrono::Utc::now().timestamp_millis(),
            source: source.to_string(),
            message,
        };
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.push_front(entry);
        entries.truncate(self.capacity);
    }

    pub fn snapshot(&self) -> Vec<DiagnosticEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
