//! Scheduler settings (`scheduler.toml`).
//!
//! Every section is optional. A missing file means defaults; a file that
//! fails to parse is reported and the defaults are used instead.

use autoread_core::activity::DEFAULT_QUIET_MS;
use autoread_core::RetryPolicy;
use autoread_protocol::DEFAULT_LISTING_URL;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteSettings {
    pub listing_url: String,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            listing_url: DEFAULT_LISTING_URL.to_string(),
        }
    }
}

/// How a new surface is opened: `program args... <url>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LauncherSettings {
    pub program: Option<String>,
    pub args: Vec<String>,
    pub load_timeout_secs: u64,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            load_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        let policy = RetryPolicy::start_command();
        Self {
            attempts: policy.attempts,
            delay_ms: policy.delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdleSettings {
    pub quiet_minutes: u64,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            quiet_minutes: (DEFAULT_QUIET_MS / 60_000) as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    pub tick_secs: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self { tick_secs: 15 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub site: SiteSettings,
    pub launcher: LauncherSettings,
    pub delivery: DeliverySettings,
    pub idle: IdleSettings,
    pub timing: TimingSettings,
}

impl SchedulerSettings {
    pub fn quiet_ms(&self) -> i64 {
        (self.idle.quiet_minutes.max(1) as i64) * 60_000
    }

    pub fn delivery_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.delivery.attempts.max(1),
            Duration::from_millis(self.delivery.delay_ms),
        )
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.launcher.load_timeout_secs.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.timing.tick_secs.max(1))
    }
}

pub fn load_settings(path: &Path) -> Result<SchedulerSettings, String> {
    if !path.exists() {
        return Ok(SchedulerSettings::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|err| format!("Failed to read settings {}: {}", path.display(), err))?;
    toml::from_str::<SchedulerSettings>(&content)
        .map_err(|err| format!("Failed to parse settings {}: {}", path.display(), err))
}
