//! Unix-socket transport.
//!
//! One JSON document per line in each direction: the client writes a
//! [`Request`], the server answers with one [`Response`] and closes. Used by
//! the scheduler socket, the CLI, and each surface's command endpoint.

use autoread_protocol::{
    parse_command, Command, EventEnvelope, ErrorInfo, ExecutorEvent, Method, Request, Response,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use chrono::Utc;
use rand::RngCore;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::channel::{DeliveryError, EventSink};
use crate::error::{ReaderError, Result};

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const CLIENT_TIMEOUT_MS: u64 = 2_000;
const EVENT_RETRY_DELAY_MS: u64 = 50;

// ─────────────────────────────────────────────────────────────────────────────
// Server side
// ─────────────────────────────────────────────────────────────────────────────

pub fn read_request(stream: &mut UnixStream) -> std::result::Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let line = first_line(&buffer);
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }
    if buffer.len() > line.len() + 1 && buffer[line.len() + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
        warn!("Extra bytes detected after newline; ignoring trailing data");
    }

    serde_json::from_slice(line).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

pub fn write_response(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    let payload = serde_json::to_vec(response).map_err(std::io::Error::other)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()
}

/// Binds `path`, replacing a stale socket file left by a previous process.
pub fn bind_listener(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent).map_err(|source| ReaderError::Io {
            context: "create socket directory".to_string(),
            source,
        })?;
    }
    if path.exists() {
        fs_err::remove_file(path).map_err(|source| ReaderError::Io {
            context: "remove existing socket".to_string(),
            source,
        })?;
    }
    UnixListener::bind(path).map_err(|source| ReaderError::Io {
        context: format!("bind {}", path.display()),
        source,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Client side
// ─────────────────────────────────────────────────────────────────────────────

pub fn send_request(socket: &Path, request: &Request) -> std::result::Result<Response, DeliveryError> {
    let mut stream = UnixStream::connect(socket).map_err(|err| match err.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
            DeliveryError::NoReceiver(format!("{}: {}", socket.display(), err))
        }
        _ => DeliveryError::Transport(format!("failed to connect: {}", err)),
    })?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(CLIENT_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(CLIENT_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, request)
        .map_err(|err| DeliveryError::Transport(format!("failed to write request: {}", err)))?;
    stream
        .write_all(b"\n")
        .map_err(|err| DeliveryError::Transport(format!("failed to flush request: {}", err)))?;
    stream.flush().ok();

    read_response(&mut stream)
}

pub fn read_response(stream: &mut UnixStream) -> std::result::Result<Response, DeliveryError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(DeliveryError::Transport(
                        "response exceeded maximum size".to_string(),
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(DeliveryError::Transport(
                    "timed out waiting for response".to_string(),
                ));
            }
            Err(err) => {
                return Err(DeliveryError::Transport(format!(
                    "failed to read response: {}",
                    err
                )))
            }
        }
    }

    let line = first_line(&buffer);
    if line.is_empty() {
        return Err(DeliveryError::Transport("response was empty".to_string()));
    }
    serde_json::from_slice(line)
        .map_err(|err| DeliveryError::Transport(format!("failed to parse response JSON: {}", err)))
}

/// Sends a command to a surface endpoint. A refusal comes back as `Rejected`.
pub fn send_command(
    socket: &Path,
    command: &Command,
) -> std::result::Result<Response, DeliveryError> {
    let params = serde_json::to_value(command)
        .map_err(|err| DeliveryError::Transport(format!("failed to encode command: {}", err)))?;
    let request = Request::new(
        Method::Command,
        Some(make_request_id(command.name())),
        Some(params),
    );
    let response = send_request(socket, &request)?;
    if response.ok {
        Ok(response)
    } else {
        Err(DeliveryError::Rejected(response.error.unwrap_or_else(|| {
            ErrorInfo::new("unknown", "receiver returned an error without details")
        })))
    }
}

pub fn make_request_id(prefix: &str) -> String {
    let mut random = rand::thread_rng();
    format!(
        "{}-{}-{:x}",
        prefix,
        Utc::now().timestamp_millis(),
        random.next_u64()
    )
}

fn first_line(buffer: &[u8]) -> &[u8] {
    match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event sink backed by the scheduler socket
// ─────────────────────────────────────────────────────────────────────────────

/// Posts executor events to the scheduler. One retry, same event id, then drop.
pub struct SocketEventSink {
    socket: PathBuf,
    surface_id: String,
    url: Mutex<Option<String>>,
}

impl SocketEventSink {
    pub fn new(socket: PathBuf, surface_id: impl Into<String>) -> Self {
        Self {
            socket,
            surface_id: surface_id.into(),
            url: Mutex::new(None),
        }
    }

    pub fn set_url(&self, url: Option<String>) {
        *self.url.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = url;
    }

    fn post(&self, envelope: &EventEnvelope) -> std::result::Result<(), DeliveryError> {
        let params = serde_json::to_value(envelope)
            .map_err(|err| DeliveryError::Transport(format!("failed to encode event: {}", err)))?;
        let request = Request::new(Method::Event, Some(envelope.event_id.clone()), Some(params));
        let response = send_request(&self.socket, &request)?;
        if response.ok {
            Ok(())
        } else {
            Err(DeliveryError::Rejected(response.error.unwrap_or_else(|| {
                ErrorInfo::new("unknown", "scheduler returned an error without details")
            })))
        }
    }
}

impl EventSink for SocketEventSink {
    fn emit(&self, event: &ExecutorEvent) {
        let envelope = EventEnvelope {
            event_id: make_request_id("evt"),
            recorded_at: Utc::now().to_rfc3339(),
            surface_id: self.surface_id.clone(),
            url: self
                .url
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            event: event.clone(),
        };

        if let Err(err) = self.post(&envelope) {
            debug!(error = %err, "Failed to post event; retrying once");
            thread::sleep(Duration::from_millis(EVENT_RETRY_DELAY_MS));
            if let Err(retry_err) = self.post(&envelope) {
                debug!(error = %retry_err, "Retry failed posting event");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-surface command endpoint
// ─────────────────────────────────────────────────────────────────────────────

pub type CommandHandler = dyn Fn(Command) -> Response + Send + Sync;

/// Listener that answers `command` requests for one surface.
pub struct CommandEndpoint {
    path: PathBuf,
    listener: UnixListener,
}

impl CommandEndpoint {
    pub fn bind(path: PathBuf) -> Result<Self> {
        let listener = bind_listener(&path)?;
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serves requests on a background thread until the process exits.
    pub fn serve(self, handler: Arc<CommandHandler>) -> JoinHandle<()> {
        thread::spawn(move || {
            for stream in self.listener.incoming() {
                match stream {
                    Ok(mut stream) => {
                        let response = match read_request(&mut stream) {
                            Ok(request) => answer(request, handler.as_ref()),
                            Err(err) => Response::error_with_info(None, err),
                        };
                        let _ = write_response(&mut stream, &response);
                    }
                    Err(err) => warn!(error = %err, "Failed to accept command connection"),
                }
            }
        })
    }
}

fn answer(request: Request, handler: &CommandHandler) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(request.id, "protocol_mismatch", "unsupported protocol version");
    }
    match request.method {
        Method::GetHealth => Response::ok(request.id, serde_json::json!({ "status": "ok" })),
        Method::Command => {
            let Some(params) = request.params else {
                return Response::error(request.id, "invalid_params", "command params are required");
            };
            match parse_command(params) {
                Ok(command) => {
                    let mut response = handler(command);
                    response.id = request.id;
                    response
                }
                Err(err) => Response::error_with_info(request.id, err),
            }
        }
        _ => Response::error(
            request.id,
            "invalid_method",
            "surface endpoints only accept commands",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_answers_commands() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("surface.sock");
        let endpoint = CommandEndpoint::bind(path.clone()).unwrap();
        endpoint.serve(Arc::new(|command: Command| {
            Response::ok(None, serde_json::json!({ "action": command.name() }))
        }));

        let response = send_command(&path, &Command::GetStats).unwrap();
        assert_eq!(response.data.unwrap()["action"], "getStats");
    }

    #[test]
    fn endpoint_rejects_invalid_command() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("surface.sock");
        CommandEndpoint::bind(path.clone())
            .unwrap()
            .serve(Arc::new(|_command: Command| Response::success(None)));

        let err = send_command(
            &path,
            &Command::StartDaily {
                target: 0,
                date: "2026-01-30".to_string(),
                skip_idle_wait: false,
            },
        )
        .unwrap_err();
        match err {
            DeliveryError::Rejected(info) => assert_eq!(info.code, "invalid_target"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn missing_socket_is_no_receiver() {
        let temp = tempfile::tempdir().unwrap();
        let err = send_command(&temp.path().join("absent.sock"), &Command::Stop).unwrap_err();
        assert!(matches!(err, DeliveryError::NoReceiver(_)));
    }

    #[test]
    fn garbage_request_is_invalid_json() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("surface.sock");
        CommandEndpoint::bind(path.clone())
            .unwrap()
            .serve(Arc::new(|_command: Command| Response::success(None)));

        let mut stream = UnixStream::connect(&path).unwrap();
        stream.write_all(b"{nope\n").unwrap();
        let response = read_response(&mut stream).unwrap();
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().code, "invalid_json");
    }
}
