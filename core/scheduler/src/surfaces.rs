//! Surface registry and launcher.
//!
//! A surface is opened by spawning the configured launcher program with the
//! URL appended and the surface id in the environment. The hosted executor
//! announces itself with a `ready` event carrying its command endpoint; from
//! then on commands go straight to that socket.

use autoread_core::ipc;
use autoread_core::storage::{HOME_ENV, SOCKET_ENV};
use autoread_core::{DeliveryError, ReaderError, StoragePaths, SurfaceHost};
use autoread_protocol::{Command, Response};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Child, Command as Process, Stdio};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::settings::LauncherSettings;

pub const SURFACE_ID_ENV: &str = "AUTOREAD_SURFACE_ID";
pub const SURFACE_ACTIVE_ENV: &str = "AUTOREAD_SURFACE_ACTIVE";

#[derive(Debug, Default)]
struct SurfaceEntry {
    url: Option<String>,
    endpoint: Option<PathBuf>,
    child: Option<Child>,
}

pub struct LauncherHost {
    paths: StoragePaths,
    launcher: LauncherSettings,
    scheduler_socket: PathBuf,
    registry: Mutex<BTreeMap<String, SurfaceEntry>>,
    registered: Condvar,
}

impl LauncherHost {
    pub fn new(paths: StoragePaths, launcher: LauncherSettings) -> Self {
        let scheduler_socket = paths.scheduler_socket();
        Self {
            paths,
            launcher,
            scheduler_socket,
            registry: Mutex::new(BTreeMap::new()),
            registered: Condvar::new(),
        }
    }

    fn registry(&self) -> MutexGuard<'_, BTreeMap<String, SurfaceEntry>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a surface's command endpoint. Surfaces started outside the
    /// scheduler are accepted too.
    pub fn register(&self, surface_id: &str, endpoint: Option<String>, url: Option<String>) {
        let endpoint = endpoint
            .map(PathBuf::from)
            .unwrap_or_else(|| self.paths.surface_socket(surface_id));
        {
            let mut registry = self.registry();
            let entry = registry.entry(surface_id.to_string()).or_default();
            entry.endpoint = Some(endpoint.clone());
            if url.is_some() {
                entry.url = url;
            }
        }
        info!(surface = surface_id, endpoint = %endpoint.display(), "Surface registered");
        self.registered.notify_all();
    }

    pub fn note_url(&self, surface_id: &str, url: &str) {
        if let Some(entry) = self.registry().get_mut(surface_id) {
            entry.url = Some(url.to_string());
        }
    }

    /// Drops a surface from the registry and reaps its process, if this
    /// host launched one. True when it was known.
    pub fn forget(&self, surface_id: &str) -> bool {
        let Some(entry) = self.registry().remove(surface_id) else {
            return false;
        };
        reap(surface_id, entry.child);
        debug!(surface = surface_id, "Surface forgotten");
        true
    }

    pub fn endpoint_of(&self, surface_id: &str) -> Option<PathBuf> {
        self.registry()
            .get(surface_id)
            .and_then(|entry| entry.endpoint.clone())
    }

    pub fn url_of(&self, surface_id: &str) -> Option<String> {
        self.registry()
            .get(surface_id)
            .and_then(|entry| entry.url.clone())
    }
}

fn reap(surface_id: &str, child: Option<Child>) {
    let Some(mut child) = child else {
        return;
    };
    if let Err(err) = child.kill() {
        // Already exited; still collect the status below.
        debug!(surface = surface_id, error = %err, "Surface process not killed");
    }
    match child.wait() {
        Ok(status) => debug!(surface = surface_id, %status, "Surface process reaped"),
        Err(err) => warn!(surface = surface_id, error = %err, "Failed to reap surface process"),
    }
}

impl SurfaceHost for LauncherHost {
    fn open_surface(&self, url: &str, active: bool) -> autoread_core::Result<String> {
        let program = self.launcher.program.clone().ok_or_else(|| ReaderError::Io {
            context: "open surface".to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no launcher program configured",
            ),
        })?;
        let surface_id = ipc::make_request_id("surface");

        let child = Process::new(&program)
            .args(&self.launcher.args)
            .arg(url)
            .env(SURFACE_ID_ENV, &surface_id)
            .env(SURFACE_ACTIVE_ENV, if active { "1" } else { "0" })
            .env(HOME_ENV, self.paths.root())
            .env(SOCKET_ENV, &self.scheduler_socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ReaderError::Io {
                context: format!("spawn launcher {}", program),
                source,
            })?;

        info!(surface = %surface_id, url, active, pid = child.id(), "Surface launched");
        self.registry().insert(
            surface_id.clone(),
            SurfaceEntry {
                url: Some(url.to_string()),
                endpoint: None,
                child: Some(child),
            },
        );
        Ok(surface_id)
    }

    fn close_surface(&self, surface_id: &str) -> autoread_core::Result<()> {
        if let Some(entry) = self.registry().remove(surface_id) {
            reap(surface_id, entry.child);
        }
        Ok(())
    }

    fn wait_until_loaded(&self, surface_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut registry = self.registry();
        loop {
            let loaded = registry
                .get(surface_id)
                .is_some_and(|entry| entry.endpoint.is_some());
            if loaded {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            registry = match self.registered.wait_timeout(registry, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn send_command(&self, surface_id: &str, command: &Command) -> Result<Response, DeliveryError> {
        let endpoint = self.endpoint_of(surface_id).ok_or_else(|| {
            DeliveryError::NoReceiver(format!("surface {} has no endpoint yet", surface_id))
        })?;
        ipc::send_command(&endpoint, command)
    }

    fn surfaces(&self) -> Vec<String> {
        self.registry().keys().cloned().collect()
    }
}
