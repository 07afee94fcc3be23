//! Wire protocol for autoread.
//!
//! This crate is shared by the scheduler, the per-surface executors and the
//! CLI so that none of them can drift from the schema. The scheduler remains
//! the authority on validation, but every client reuses the same types to
//! construct valid requests.
//!
//! Transport is one JSON document per line over a unix socket: a [`Request`]
//! goes out, a single [`Response`] comes back.

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    /// Executor → scheduler notification (`params` is an [`EventEnvelope`]).
    Event,
    /// Scheduler/CLI → executor command (`params` is a [`Command`]).
    Command,
    GetDailyAuto,
    UpdateDailyAuto,
    RunDailyNow,
    IssueStop,
    /// Forward a [`Command`] to a registered surface (`params` is [`DispatchParams`]).
    Dispatch,
    ForgetSurface,
    GetDiagnostics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn success(id: Option<String>) -> Self {
        Self::ok(id, serde_json::json!({ "success": true }))
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Executor configuration
// ═══════════════════════════════════════════════════════════════════════════════

pub const DEFAULT_LISTING_URL: &str = "https://linux.do/latest";

/// Tunables for a single reading session. Persisted inside the session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub min_read_ms: u64,
    pub max_read_ms: u64,
    pub min_stay_ms: u64,
    pub max_stay_ms: u64,
    pub pointer_probability: f64,
    pub quick_mode: bool,
    pub listing_url: String,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            min_read_ms: 1_000,
            max_read_ms: 4_000,
            min_stay_ms: 5_000,
            max_stay_ms: 15_000,
            pointer_probability: 0.3,
            quick_mode: false,
            listing_url: DEFAULT_LISTING_URL.to_string(),
        }
    }
}

impl ReaderConfig {
    /// Applies a partial update and returns the normalized result.
    pub fn merge(&self, patch: &ReaderConfigPatch) -> ReaderConfig {
        let mut next = self.clone();
        if let Some(value) = patch.min_read_ms {
            next.min_read_ms = value;
        }
        if let Some(value) = patch.max_read_ms {
            next.max_read_ms = value;
        }
        if let Some(value) = patch.min_stay_ms {
            next.min_stay_ms = value;
        }
        if let Some(value) = patch.max_stay_ms {
            next.max_stay_ms = value;
        }
        if let Some(value) = patch.pointer_probability {
            next.pointer_probability = value;
        }
        if let Some(value) = patch.quick_mode {
            next.quick_mode = value;
        }
        if let Some(value) = &patch.listing_url {
            next.listing_url = value.clone();
        }
        next.normalized()
    }

    /// Swaps inverted ranges, clamps the probability and restores an empty listing URL.
    pub fn normalized(mut self) -> ReaderConfig {
        if self.min_read_ms > self.max_read_ms {
            std::mem::swap(&mut self.min_read_ms, &mut self.max_read_ms);
        }
        if self.min_stay_ms > self.max_stay_ms {
            std::mem::swap(&mut self.min_stay_ms, &mut self.max_stay_ms);
        }
        self.pointer_probability = if self.pointer_probability.is_finite() {
            self.pointer_probability.clamp(0.0, 1.0)
        } else {
            ReaderConfig::default().pointer_probability
        };
        if self.listing_url.trim().is_empty() {
            self.listing_url = DEFAULT_LISTING_URL.to_string();
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaderConfigPatch {
    pub min_read_ms: Option<u64>,
    pub max_read_ms: Option<u64>,
    pub min_stay_ms: Option<u64>,
    pub max_stay_ms: Option<u64>,
    pub pointer_probability: Option<f64>,
    pub quick_mode: Option<bool>,
    pub listing_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_items: u64,
    #[serde(default)]
    pub start_time: Option<i64>,
    pub errors: u64,
    pub accumulated_run_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DailyAutoPatch {
    pub enabled: Option<bool>,
    pub target: Option<u32>,
    pub window_start: Option<String>,
    pub require_hidden: Option<bool>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Commands (scheduler/UI → executor)
// ═══════════════════════════════════════════════════════════════════════════════

/// Commands are delivered at least once; every executor handles them idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Command {
    Start,
    #[serde(rename_all = "camelCase")]
    StartDaily {
        target: u32,
        date: String,
        #[serde(default)]
        skip_idle_wait: bool,
    },
    Stop,
    ResetAndStart,
    ResetHistory,
    UpdateConfig {
        config: ReaderConfigPatch,
    },
    GetConfig,
    GetStats,
}

impl Command {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        match self {
            Command::StartDaily { target, date, .. } => {
                if *target < 1 {
                    return Err(ErrorInfo::new("invalid_target", "target must be at least 1"));
                }
                if NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
                    return Err(ErrorInfo::new("invalid_date", "date must be YYYY-MM-DD"));
                }
                Ok(())
            }
            Command::UpdateConfig { config } => match config.pointer_probability {
                Some(value) if !value.is_finite() => Err(ErrorInfo::new(
                    "invalid_config",
                    "pointer_probability must be a finite number",
                )),
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::StartDaily { .. } => "startDaily",
            Command::Stop => "stop",
            Command::ResetAndStart => "resetAndStart",
            Command::ResetHistory => "resetHistory",
            Command::UpdateConfig { .. } => "updateConfig",
            Command::GetConfig => "getConfig",
            Command::GetStats => "getStats",
        }
    }
}

pub fn parse_command(params: Value) -> Result<Command, ErrorInfo> {
    let command: Command = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("command payload is invalid JSON: {}", err),
        )
    })?;
    command.validate()?;
    Ok(command)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchParams {
    pub surface_id: String,
    pub command: Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SurfaceParams {
    pub surface_id: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Events (executor → any listener)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutorEvent {
    Ready {
        #[serde(default)]
        endpoint: Option<String>,
    },
    Started,
    Stopped,
    Log {
        text: String,
    },
    Stats {
        snapshot: StatsSnapshot,
    },
    ConfigUpdated {
        config: ReaderConfig,
    },
    SiteVisibility {
        visible: bool,
        at: i64,
    },
    SiteActivity {
        at: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventEnvelope {
    pub event_id: String,
    pub recorded_at: String,
    pub surface_id: String,
    #[serde(default)]
    pub url: Option<String>,
    pub event: ExecutorEvent,
}

impl EventEnvelope {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.event_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_event_id", "event_id is required"));
        }
        if self.event_id.len() > 128 {
            return Err(ErrorInfo::new(
                "invalid_event_id",
                "event_id must be 128 characters or fewer",
            ));
        }

        if DateTime::parse_from_rfc3339(&self.recorded_at).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "recorded_at must be RFC3339",
            ));
        }

        if self.surface_id.trim().is_empty() {
            return Err(ErrorInfo::new("missing_field", "surface_id is required"));
        }

        match &self.event {
            ExecutorEvent::SiteVisibility { at, .. } | ExecutorEvent::SiteActivity { at } => {
                if *at <= 0 {
                    return Err(ErrorInfo::new("invalid_timestamp", "at must be positive"));
                }
            }
            ExecutorEvent::Ready { .. }
            | ExecutorEvent::Started
            | ExecutorEvent::Stopped
            | ExecutorEvent::Log { .. }
            | ExecutorEvent::Stats { .. }
            | ExecutorEvent::ConfigUpdated { .. } => {}
        }

        Ok(())
    }
}

pub fn parse_event(params: Value) -> Result<EventEnvelope, ErrorInfo> {
    let envelope: EventEnvelope = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("event payload is invalid JSON: {}", err),
        )
    })?;
    envelope.validate()?;
    Ok(envelope)
}
