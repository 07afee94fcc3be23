//! Storage paths for autoread.
//!
//! Every file location the scheduler, the CLI and embedded executors touch is
//! decided here. Production code resolves `~/.autoread` (or `AUTOREAD_HOME`);
//! tests use [`StoragePaths::with_root`] with a temp directory.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{ReaderError, Result};

pub const HOME_ENV: &str = "AUTOREAD_HOME";
pub const SOCKET_ENV: &str = "AUTOREAD_SOCKET";

const ROOT_DIR_NAME: &str = ".autoread";
const SOCKET_NAME: &str = "scheduler.sock";

#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    /// Resolves the root from `AUTOREAD_HOME`, falling back to `~/.autoread`.
    pub fn resolve() -> Result<Self> {
        if let Ok(value) = env::var(HOME_ENV) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Ok(Self::with_root(PathBuf::from(trimmed)));
            }
        }
        let home = dirs::home_dir()
            .ok_or_else(|| ReaderError::storage("resolve storage root", "home directory not found"))?;
        Ok(Self::with_root(home.join(ROOT_DIR_NAME)))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Files
    // ─────────────────────────────────────────────────────────────────────────────

    /// SQLite database holding every durable record.
    pub fn state_db(&self) -> PathBuf {
        self.root.join("state.db")
    }

    /// Scheduler socket. `AUTOREAD_SOCKET` wins when set.
    pub fn scheduler_socket(&self) -> PathBuf {
        match env::var(SOCKET_ENV) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => self.root.join(SOCKET_NAME),
        }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("scheduler.toml")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Directories
    // ─────────────────────────────────────────────────────────────────────────────

    /// Per-surface command endpoints live here.
    pub fn surfaces_dir(&self) -> PathBuf {
        self.root.join("surfaces")
    }

    pub fn surface_socket(&self, surface_id: &str) -> PathBuf {
        let safe: String = surface_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.surfaces_dir().join(format!("{}.sock", safe))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.root.clone(), self.surfaces_dir(), self.logs_dir()] {
            fs_err::create_dir_all(&dir).map_err(|source| ReaderError::Io {
                context: format!("create {}", dir.display()),
                source,
            })?;
        }
        Ok(())
    }
}
