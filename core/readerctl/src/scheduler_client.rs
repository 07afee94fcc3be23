//! Client helper for talking to the autoread scheduler.
//!
//! One request per connection. A failed call is retried once, with the same
//! request id, so the scheduler can tell a lost response from a new request.

use autoread_core::{ipc, DeliveryError, StoragePaths};
use autoread_protocol::{Method, Request, Response, PROTOCOL_VERSION};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

const RETRY_DELAY_MS: u64 = 50;

fn socket_path() -> Result<PathBuf, String> {
    StoragePaths::resolve()
        .map(|paths| paths.scheduler_socket())
        .map_err(|err| err.to_string())
}

fn send_once(request: &Request) -> Result<Response, DeliveryError> {
    let socket = socket_path().map_err(DeliveryError::Transport)?;
    ipc::send_request(&socket, request)
}

/// Sends `method` and returns the response data. A scheduler-side error is
/// returned as `code: message` without a retry.
pub fn call(method: Method, params: Option<Value>) -> Result<Value, String> {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(ipc::make_request_id("ctl")),
        params,
    };

    let response = match send_once(&request) {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, method = ?method, "Scheduler request failed; retrying");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_once(&request).map_err(|retry_err| {
                tracing::warn!(error = %retry_err, method = ?method, "Retry failed");
                format!("scheduler unreachable: {}", retry_err)
            })?
        }
    };

    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown scheduler error".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoread_core::storage::SOCKET_ENV;
    use std::io::{Read, Write};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::sync::{Arc, Mutex, OnceLock};
    use std::time::Instant;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct EnvGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prior }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.prior {
                std::env::set_var(self.key, value);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_request(stream: &mut UnixStream) -> Option<Request> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if buffer.contains(&b'\n') {
                        break;
                    }
                }
                Err(_) => return None,
            }
        }
        let end = buffer.iter().position(|b| *b == b'\n').unwrap_or(buffer.len());
        serde_json::from_slice(&buffer[..end]).ok()
    }

    /// Serves `responses.len()` connections; `None` drops the connection
    /// without answering.
    fn serve(
        listener: UnixListener,
        responses: Vec<Option<Response>>,
    ) -> (std::thread::JoinHandle<()>, Arc<Mutex<Vec<Request>>>) {
        listener.set_nonblocking(true).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let mut pending = responses.into_iter();
            let mut next = pending.next();
            while next.is_some() && start.elapsed() < Duration::from_secs(5) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        if let Some(request) = read_request(&mut stream) {
                            seen_clone.lock().unwrap().push(request);
                        }
                        if let Some(Some(response)) = next.take() {
                            let mut payload = serde_json::to_vec(&response).unwrap();
                            payload.push(b'\n');
                            let _ = stream.write_all(&payload);
                        }
                        next = pending.next();
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });
        (handle, seen)
    }

    #[test]
    fn returns_data_on_success() {
        let _guard = env_lock();
        let temp_dir = tempfile::tempdir().unwrap();
        let socket = temp_dir.path().join("scheduler.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let (server, seen) = serve(
            listener,
            vec![Some(Response::ok(None, serde_json::json!({ "stop_at": 7 })))],
        );
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().unwrap());

        let data = call(Method::IssueStop, None).unwrap();
        server.join().unwrap();

        assert_eq!(data["stop_at"], 7);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, Method::IssueStop);
        assert_eq!(seen[0].protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn retry_reuses_request_id_after_lost_response() {
        let _guard = env_lock();
        let temp_dir = tempfile::tempdir().unwrap();
        let socket = temp_dir.path().join("scheduler.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let (server, seen) = serve(
            listener,
            vec![None, Some(Response::success(None))],
        );
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().unwrap());

        assert!(call(Method::RunDailyNow, None).is_ok());
        server.join().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].id.is_some());
        assert_eq!(seen[0].id, seen[1].id);
    }

    #[test]
    fn scheduler_error_is_not_retried() {
        let _guard = env_lock();
        let temp_dir = tempfile::tempdir().unwrap();
        let socket = temp_dir.path().join("scheduler.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let (server, seen) = serve(
            listener,
            vec![Some(Response::error(None, "unknown_surface", "ghost"))],
        );
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().unwrap());

        let err = call(Method::Dispatch, Some(serde_json::json!({}))).unwrap_err();
        server.join().unwrap();

        assert_eq!(err, "unknown_surface: ghost");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn unreachable_scheduler_reports_error() {
        let _guard = env_lock();
        let temp_dir = tempfile::tempdir().unwrap();
        let socket = temp_dir.path().join("missing.sock");
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().unwrap());

        let err = call(Method::GetHealth, None).unwrap_err();
        assert!(err.starts_with("scheduler unreachable"));
    }
}
