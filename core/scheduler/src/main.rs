//! autoread scheduler entrypoint.
//!
//! A long-lived, single-writer service: it owns the daily-auto alarms, the
//! site activity ledger and the stop signal, and relays commands to the
//! executors hosted in reading surfaces. Requests arrive as JSON lines on a
//! unix socket; each connection carries one request and one response.

use std::env;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use autoread_core::{
    ipc, Diagnostics, DurableStore, MemoryStore, SqliteStore, StoragePaths, SystemClock,
};
use autoread_protocol::{
    parse_command, parse_event, DailyAutoPatch, DispatchParams, Method, Request, Response,
    SurfaceParams, PROTOCOL_VERSION,
};
use serde_json::Value;

mod alarms;
mod daily;
mod settings;
mod state;
mod surfaces;

use settings::{load_settings, SchedulerSettings};
use state::SharedState;

fn main() {
    init_logging();

    let paths = match StoragePaths::resolve() {
        Ok(paths) => paths,
        Err(err) => {
            error!(error = %err, "Failed to resolve storage root");
            std::process::exit(1);
        }
    };
    if let Err(err) = paths.ensure_dirs() {
        error!(error = %err, "Failed to prepare storage directories");
        std::process::exit(1);
    }

    let settings = match load_settings(&paths.settings_file()) {
        Ok(settings) => settings,
        Err(err) => {
            warn!(error = %err, "Failed to load scheduler settings; using defaults");
            SchedulerSettings::default()
        }
    };

    let socket_path = paths.scheduler_socket();
    let listener = match ipc::bind_listener(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind scheduler socket");
            std::process::exit(1);
        }
    };

    let diagnostics = Arc::new(Diagnostics::new());
    let store: Arc<dyn DurableStore> = match SqliteStore::new(paths.state_db()) {
        Ok(store) => Arc::new(store.with_diagnostics(Arc::clone(&diagnostics))),
        Err(err) => {
            warn!(error = %err, "Failed to open state database; keeping state in memory");
            diagnostics.record("store", format!("state database unavailable: {}", err));
            Arc::new(MemoryStore::new().with_diagnostics(Arc::clone(&diagnostics)))
        }
    };

    info!(
        path = %socket_path.display(),
        listing_url = %settings.site.listing_url,
        launcher = ?settings.launcher.program,
        "autoread scheduler started"
    );

    let shared_state = Arc::new(SharedState::new(
        store,
        Arc::new(SystemClock),
        paths,
        diagnostics,
        settings,
    ));
    shared_state.startup();
    spawn_ticker(Arc::clone(&shared_state));

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept scheduler connection");
            }
        }
    }
}

fn spawn_ticker(state: Arc<SharedState>) {
    let interval = state.settings().tick_interval();
    thread::spawn(move || loop {
        thread::sleep(interval);
        state.tick();
    });
}

fn init_logging() {
    let debug_enabled = env::var("AUTOREAD_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match ipc::read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = ipc::write_response(&mut stream, &response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Scheduler request received");
    let response = handle_request(request, &state);
    let _ = ipc::write_response(&mut stream, &response);
}

fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<Value>,
    what: &str,
) -> Result<T, Response> {
    let params = params.ok_or_else(|| {
        Response::error(None, "invalid_params", format!("{} params are required", what))
    })?;
    serde_json::from_value(params).map_err(|err| {
        Response::error(
            None,
            "invalid_params",
            format!("{} params are invalid: {}", what, err),
        )
    })
}

fn with_id(mut response: Response, id: Option<String>) -> Response {
    response.id = id;
    response
}

fn handle_request(request: Request, state: &SharedState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            });
            data["scheduler"] = state.health();
            Response::ok(request.id, data)
        }
        Method::Event => {
            let Some(params) = request.params else {
                return Response::error(request.id, "invalid_params", "event params are required");
            };
            match parse_event(params) {
                Ok(envelope) => {
                    let fresh = state.ingest(&envelope);
                    Response::ok(request.id, serde_json::json!({ "duplicate": !fresh }))
                }
                Err(err) => Response::error_with_info(request.id, err),
            }
        }
        Method::Command => {
            let Some(params) = request.params else {
                return Response::error(
                    request.id,
                    "invalid_params",
                    "command params are required",
                );
            };
            match parse_command(params) {
                Ok(command) => {
                    info!(action = command.name(), "Broadcasting command");
                    Response::ok(request.id, state.broadcast(&command))
                }
                Err(err) => Response::error_with_info(request.id, err),
            }
        }
        Method::GetDailyAuto => Response::ok(request.id, state.daily_status()),
        Method::UpdateDailyAuto => {
            let patch: DailyAutoPatch = match parse_params(request.params, "daily auto") {
                Ok(patch) => patch,
                Err(response) => return with_id(response, request.id),
            };
            let config = state.runner().update(&patch);
            match serde_json::to_value(config) {
                Ok(value) => Response::ok(request.id, value),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize daily auto config: {}", err),
                ),
            }
        }
        Method::RunDailyNow => match serde_json::to_value(state.run_daily_now()) {
            Ok(value) => Response::ok(request.id, value),
            Err(err) => Response::error(
                request.id,
                "serialization_error",
                format!("Failed to serialize launch outcome: {}", err),
            ),
        },
        Method::IssueStop => Response::ok(request.id, state.issue_stop()),
        Method::Dispatch => {
            let params: DispatchParams = match parse_params(request.params, "dispatch") {
                Ok(params) => params,
                Err(response) => return with_id(response, request.id),
            };
            if let Err(err) = params.command.validate() {
                return Response::error_with_info(request.id, err);
            }
            with_id(
                state.dispatch(&params.surface_id, &params.command),
                request.id,
            )
        }
        Method::ForgetSurface => {
            let params: SurfaceParams = match parse_params(request.params, "surface") {
                Ok(params) => params,
                Err(response) => return with_id(response, request.id),
            };
            let removed = state.forget_surface(&params.surface_id);
            Response::ok(request.id, serde_json::json!({ "removed": removed }))
        }
        Method::GetDiagnostics => match serde_json::to_value(state.diagnostics().snapshot()) {
            Ok(value) => Response::ok(request.id, value),
            Err(err) => Response::error(
                request.id,
                "serialization_error",
                format!("Failed to serialize diagnostics: {}", err),
            ),
        },
    }
}
