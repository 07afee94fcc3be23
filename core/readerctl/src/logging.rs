//! File logging for readerctl.
//!
//! Diagnostics go to a daily-rotated file under the autoread logs directory
//! so they never mix with the JSON printed on stdout. `AUTOREAD_DEBUG_LOG`
//! raises the level to debug.

use autoread_core::StoragePaths;
use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "readerctl.log";

/// Keep the returned guard alive for the life of the process; dropping it
/// flushes buffered lines.
pub fn init() -> Option<WorkerGuard> {
    let logs_dir = StoragePaths::resolve().ok()?.logs_dir();
    fs_err::create_dir_all(&logs_dir).ok()?;

    let file_appender = tracing_appender::rolling::daily(&logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(non_blocking)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}

fn filter() -> EnvFilter {
    let debug_enabled = env::var("AUTOREAD_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}
