//! Message Channel.
//!
//! Commands go out at-least-once with a bounded, fixed-delay retry; past the
//! bound they are dropped with a log line and a diagnostic, never escalated.
//! Events go out best effort through an [`EventSink`].

use autoread_protocol::{ErrorInfo, ExecutorEvent};
use std::time::Duration;

use crate::clock::Clock;
use crate::diagnostics::Diagnostics;
use crate::error::ReaderError;
use crate::wait::WaitGate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Nobody is listening yet (surface still loading, socket not bound).
    NoReceiver(String),
    /// The receiver answered with an error. Retrying will not help.
    Rejected(ErrorInfo),
    Transport(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, DeliveryError::Rejected(_))
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::NoReceiver(details) => write!(f, "no receiver: {}", details),
            DeliveryError::Rejected(info) => write!(f, "rejected: {}", info),
            DeliveryError::Transport(details) => write!(f, "transport: {}", details),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Start command to a freshly opened surface: the first send plus ten
    /// retries, one second apart.
    pub fn start_command() -> Self {
        Self::new(11, Duration::from_millis(1_000))
    }

    /// Commands sent on behalf of a person waiting on the answer.
    pub fn interactive() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// Runs `attempt` until it succeeds, fails permanently, or the policy is
/// exhausted. Failures are logged and recorded; the caller only sees `None`.
pub fn deliver_with_retry<T, F>(
    policy: RetryPolicy,
    clock: &dyn Clock,
    gate: &WaitGate,
    diagnostics: &Diagnostics,
    label: &str,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut(u32) -> Result<T, DeliveryError>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for number in 1..=attempts {
        match attempt(number) {
            Ok(value) => {
                if number > 1 {
                    tracing::debug!(label, attempt = number, "Delivered after retry");
                }
                return Some(value);
            }
            Err(err) if !err.is_transient() => {
                tracing::warn!(label, error = %err, "Delivery rejected");
                diagnostics.record("channel", format!("{} rejected: {}", label, err));
                return None;
            }
            Err(err) => {
                tracing::debug!(label, attempt = number, error = %err, "Delivery attempt failed");
                last_error = Some(err);
                if number < attempts {
                    clock.wait(policy.delay, gate);
                }
            }
        }
    }

    let failure = ReaderError::TransientDeliveryFailure {
        target: label.to_string(),
        attempts,
        details: last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    };
    tracing::warn!(label, error = %failure, "Giving up on delivery");
    diagnostics.record("channel", failure.to_string());
    None
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event sinks
// ═══════════════════════════════════════════════════════════════════════════════

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ExecutorEvent);
}
