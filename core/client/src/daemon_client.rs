//! Client helper for talking to the carewalk daemon.
//!
//! One request per connection. Commands the daemon treats as idempotent are
//! retried once on transport failure; samples keep their `sampleId` across the
//! retry so the daemon can drop the replay.

use carewalk_daemon_protocol::{
    ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use chrono::Utc;
use rand::RngCore;
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const SOCKET_ENV: &str = "CAREWALK_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 2_000;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Transport(String),
    #[error("{}: {}", .0.code, .0.message)]
    Daemon(ErrorInfo),
}

impl ClientError {
    fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Daemon(info) => matches!(info.code.as_str(), "read_timeout" | "store_error"),
        }
    }
}

/// `im_ok` acknowledges whichever alert is newest when it lands, so a blind
/// replay could acknowledge a second one.
fn retry_safe(method: Method) -> bool {
    !matches!(method, Method::ImOk)
}

pub fn call(method: Method, params: Option<Value>) -> Result<Value, ClientError> {
    let id = make_request_id();
    match call_once(method, &id, params.clone()) {
        Ok(data) => Ok(data),
        Err(err) if retry_safe(method) && err.is_retryable() => {
            tracing::warn!(error = %err, method = ?method, "Daemon request failed; retrying");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            call_once(method, &id, params).map_err(|retry_err| {
                tracing::warn!(error = %retry_err, method = ?method, "Retry failed");
                retry_err
            })
        }
        Err(err) => Err(err),
    }
}

fn call_once(method: Method, id: &str, params: Option<Value>) -> Result<Value, ClientError> {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(id.to_string()),
        params,
    };
    let response = send_request(request).map_err(ClientError::Transport)?;
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(ClientError::Daemon(response.error.unwrap_or_else(|| {
            ErrorInfo::new("unknown_error", "Unknown daemon error")
        })))
    }
}

fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".carewalk").join(SOCKET_NAME))
}

fn send_request(request: Request) -> Result<Response, String> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, &request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

pub fn make_sample_id() -> String {
    let rand = rand::thread_rng().next_u64();
    format!("smp-{}-{:x}", Utc::now().timestamp_millis(), rand)
}

fn make_request_id() -> String {
    let rand = rand::thread_rng().next_u32();
    format!("req-{}-{:x}", Utc::now().timestamp_millis(), rand)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::net::UnixListener;
    use std::path::Path;
    use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
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
            match &self.prior {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn temp_socket(prefix: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in("/tmp")
            .expect("temp dir");
        let path = dir.path().join(SOCKET_NAME);
        (dir, path)
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

    fn reply(stream: &mut UnixStream, response: &Response) {
        let mut payload = serde_json::to_vec(response).expect("serialize response");
        payload.push(b'\n');
        let _ = stream.write_all(&payload);
    }

    /// Accepts up to `attempts` connections, records each request, and lets
    /// `respond` decide what (if anything) goes back.
    fn serve<F>(
        socket: &Path,
        attempts: usize,
        respond: F,
    ) -> (std::thread::JoinHandle<()>, Arc<Mutex<Vec<Request>>>)
    where
        F: Fn(usize) -> Option<Response> + Send + 'static,
    {
        let listener = UnixListener::bind(socket).expect("bind test socket");
        listener.set_nonblocking(true).expect("nonblocking");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let server = std::thread::spawn(move || {
            let start = Instant::now();
            let mut handled = 0;
            while handled < attempts && start.elapsed() < Duration::from_secs(5) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        handled += 1;
                        let _ = stream.set_nonblocking(false);
                        if let Some(request) = read_request(&mut stream) {
                            seen_clone.lock().expect("lock").push(request);
                        }
                        if let Some(response) = respond(handled) {
                            reply(&mut stream, &response);
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });
        (server, seen)
    }

    #[test]
    fn sample_retry_reuses_sample_id_after_lost_response() {
        let _guard = env_lock();
        let (_dir, socket) = temp_socket("cw-lost");
        let (server, seen) = serve(&socket, 2, |attempt| {
            (attempt == 2).then(|| Response::ok(None, json!({ "saved": true })))
        });
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().expect("utf8 path"));

        let params = json!({ "patientId": "p1", "steps": 10, "sampleId": make_sample_id() });
        let data = call(Method::ReceiveData, Some(params)).expect("call succeeds on retry");
        server.join().expect("server thread");

        assert_eq!(data["saved"], true);
        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].id, seen[1].id, "retry must reuse the request id");
        let sample_ids: Vec<_> = seen
            .iter()
            .map(|request| request.params.as_ref().map(|p| p["sampleId"].clone()))
            .collect();
        assert_eq!(sample_ids[0], sample_ids[1]);
    }

    #[test]
    fn validation_errors_are_not_retried() {
        let _guard = env_lock();
        let (_dir, socket) = temp_socket("cw-invalid");
        let (server, seen) = serve(&socket, 1, |_| {
            Some(Response::error(None, "missing_field", "alertId is required"))
        });
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().expect("utf8 path"));

        let err = call(
            Method::CaregiverHandleAlert,
            Some(json!({ "patientId": "p1" })),
        )
        .expect_err("daemon rejects");
        server.join().expect("server thread");

        match err {
            ClientError::Daemon(info) => assert_eq!(info.code, "missing_field"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[test]
    fn im_ok_is_sent_once_even_when_response_is_lost() {
        let _guard = env_lock();
        let (_dir, socket) = temp_socket("cw-imok");
        let (server, seen) = serve(&socket, 1, |_| None);
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().expect("utf8 path"));

        let err = call(Method::ImOk, Some(json!({ "patientId": "p1" }))).expect_err("no reply");
        server.join().expect("server thread");

        assert!(matches!(err, ClientError::Transport(_)));
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[test]
    fn missing_socket_is_a_transport_error() {
        let _guard = env_lock();
        let (_dir, socket) = temp_socket("cw-missing");
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().expect("utf8 path"));

        let err = call(Method::GetHealth, None).expect_err("nothing listening");
        assert!(err.to_string().contains("Failed to connect"));
    }

    #[test]
    fn sample_ids_are_prefixed_and_unique() {
        let first = make_sample_id();
        let second = make_sample_id();
        assert!(first.starts_with("smp-"));
        assert_ne!(first, second);
        assert!(first.len() <= 128);
    }
}
