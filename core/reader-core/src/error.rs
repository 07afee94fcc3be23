//! Error types for autoread-core operations.
//!
//! Most failures in this crate are absorbed at the boundary (reads degrade to
//! defaults, deliveries are dropped after a bounded retry). `ReaderError` is the
//! shape those failures take on their way into the log and the diagnostics
//! buffer.

// ═══════════════════════════════════════════════════════════════════════════════
// Internal Error
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    // ─────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Storage unavailable: {context}: {details}")]
    StorageUnavailable { context: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Channel Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("No live receiver for {target} after {attempts} attempts: {details}")]
    TransientDeliveryFailure {
        target: String,
        attempts: u32,
        details: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Traversal Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Surface left the expected item: expected {expected}, found {actual}")]
    NavigationDrift { expected: String, actual: String },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ReaderError {
    pub fn storage(context: impl Into<String>, details: impl std::fmt::Display) -> Self {
        ReaderError::StorageUnavailable {
            context: context.into(),
            details: details.to_string(),
        }
    }
}

/// Convenience type alias for Results using ReaderError.
pub type Result<T> = std::result::Result<T, ReaderError>;

impl From<ReaderError> for String {
    fn from(err: ReaderError) -> String {
        err.to_string()
    }
}
