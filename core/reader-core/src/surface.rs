//! Surface runtime.
//!
//! A reading surface outlives every page it shows. The runtime holds what
//! survives navigation (the state database, the scheduler event sink and the
//! command endpoint) and builds a fresh [`Executor`] for each page load.
//! Commands are routed to whichever executor is loaded at the time.

use autoread_protocol::{Command, Response};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::executor::{Executor, ExecutorHandle, ExecutorParts, PageOutcome};
use crate::ipc::{CommandEndpoint, SocketEventSink};
use crate::page::{HeuristicUnread, Page};
use crate::random::Dice;
use crate::storage::StoragePaths;
use crate::store::{DurableStore, SqliteStore};
use crate::wait::WaitOutcome;

/// How long an idle page waits for a command before handing control back.
pub const IDLE_PARK: Duration = Duration::from_secs(30);

pub struct SurfaceParts {
    pub surface_id: String,
    pub store: Arc<dyn DurableStore>,
    pub clock: Arc<dyn Clock>,
    pub diagnostics: Arc<Diagnostics>,
}

pub struct SurfaceRuntime {
    surface_id: String,
    endpoint: String,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<Diagnostics>,
    sink: Arc<SocketEventSink>,
    current: Arc<Mutex<Option<ExecutorHandle>>>,
    _server: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SurfaceRuntime {
    /// Shared SQLite state and the system clock.
    pub fn connect(paths: &StoragePaths, surface_id: impl Into<String>) -> Result<Self> {
        let diagnostics = Arc::new(Diagnostics::new());
        let store = SqliteStore::new(paths.state_db())?.with_diagnostics(Arc::clone(&diagnostics));
        Self::start(
            paths,
            SurfaceParts {
                surface_id: surface_id.into(),
                store: Arc::new(store),
                clock: Arc::new(SystemClock),
                diagnostics,
            },
        )
    }

    /// Binds the surface's command endpoint and starts serving it.
    pub fn start(paths: &StoragePaths, parts: SurfaceParts) -> Result<Self> {
        let endpoint = CommandEndpoint::bind(paths.surface_socket(&parts.surface_id))?;
        let endpoint_path = endpoint.path().to_string_lossy().to_string();

        let current: Arc<Mutex<Option<ExecutorHandle>>> = Arc::new(Mutex::new(None));
        let routed = Arc::clone(&current);
        let surface_id = parts.surface_id.clone();
        // Commands are applied under the routing lock so none lands on an
        // executor that is being replaced.
        let server = endpoint.serve(Arc::new(move |command: Command| {
            match lock(&routed).as_ref() {
                Some(handle) => handle.handle(command),
                None => Response::error(
                    None,
                    "no_receiver",
                    format!("surface {} has no page loaded", surface_id),
                ),
            }
        }));

        info!(surface = %parts.surface_id, endpoint = %endpoint_path, "Surface runtime started");
        Ok(Self {
            sink: Arc::new(SocketEventSink::new(
                paths.scheduler_socket(),
                parts.surface_id.clone(),
            )),
            surface_id: parts.surface_id,
            endpoint: endpoint_path,
            store: parts.store,
            clock: parts.clock,
            diagnostics: parts.diagnostics,
            current,
            _server: server,
        })
    }

    pub fn surface_id(&self) -> &str {
        &self.surface_id
    }

    pub fn endpoint(&self) -> &Path {
        Path::new(&self.endpoint)
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// Runs one page load to its conclusion and hands the page back.
    ///
    /// An idle session parks the executor until a command wakes it; after
    /// [`IDLE_PARK`] without one the page is returned with `Idle`.
    pub fn serve_page(&self, page: Box<dyn Page>) -> (PageOutcome, Box<dyn Page>) {
        self.sink.set_url(Some(page.location()));
        let mut executor = {
            let mut current = lock(&self.current);
            let executor = Executor::load(ExecutorParts {
                surface_id: self.surface_id.clone(),
                endpoint: Some(self.endpoint.clone()),
                store: Arc::clone(&self.store),
                clock: Arc::clone(&self.clock),
                sink: self.sink.clone(),
                diagnostics: Arc::clone(&self.diagnostics),
                page,
                unread: Box::new(HeuristicUnread),
                dice: Dice::from_entropy(),
            });
            *current = Some(executor.handle());
            executor
        };

        let outcome = loop {
            match executor.drive() {
                PageOutcome::Idle => match executor.park(IDLE_PARK) {
                    WaitOutcome::Released => continue,
                    WaitOutcome::Elapsed => break PageOutcome::Idle,
                },
                outcome => break outcome,
            }
        };
        info!(surface = %self.surface_id, outcome = ?outcome, "Page finished");
        (outcome, executor.unload())
    }

    pub fn note_visibility(&self, visible: bool, at: i64) {
        if let Some(handle) = lock(&self.current).as_ref() {
            handle.note_visibility(visible, at);
        }
    }

    pub fn note_user_activity(&self, at: i64) {
        if let Some(handle) = lock(&self.current).as_ref() {
            handle.note_user_activity(at);
        }
    }
}
