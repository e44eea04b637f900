//! Carewalk daemon entrypoint.
//!
//! Owns all session, aggregate and alert state for the patients it serves.
//! Clients connect over a Unix socket and send one newline-delimited JSON
//! request per connection; each connection is handled on its own thread.

use chrono::Utc;
use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use carewalk_daemon_protocol::{
    parse_handle_alert, parse_history_params, parse_patient_params, parse_register_token,
    parse_sample, ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde::Serialize;
use serde_json::Value;

mod aggregates;
mod alerts;
mod attribution;
mod calendar;
mod config;
mod db;
mod error;
mod notify;
mod push;
mod reconcile;
mod session;
mod state;

use db::Db;
use error::EngineError;
use push::OutboxChannel;
use state::SharedState;

const SOCKET_NAME: &str = "daemon.sock";
const OUTBOX_NAME: &str = "push-outbox.jsonl";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

fn main() {
    init_logging();

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "Carewalk daemon started");

    let db_path = match daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    let runtime_config = match config::load_runtime_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load runtime config; using defaults");
            config::RuntimeConfig::default()
        }
    };

    let outbox_path = match runtime_config.push.outbox_path.clone() {
        Some(path) => path,
        None => match daemon_outbox_path() {
            Ok(path) => path,
            Err(err) => {
                error!(error = %err, "Failed to resolve push outbox path");
                std::process::exit(1);
            }
        },
    };
    info!(
        auto_stop_minutes = runtime_config.session.auto_stop_minutes,
        timezone = %runtime_config.calendar.timezone,
        outbox = %outbox_path.display(),
        "Runtime config loaded"
    );

    let push = Arc::new(OutboxChannel::new(outbox_path));
    let shared_state = match SharedState::new(db, runtime_config, push) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon state");
            std::process::exit(1);
        }
    };

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("CAREWALK_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn carewalk_home() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".carewalk"))
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    Ok(carewalk_home()?.join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    Ok(carewalk_home()?.join("daemon").join("state.db"))
}

fn daemon_outbox_path() -> Result<PathBuf, String> {
    Ok(carewalk_home()?.join("daemon").join(OUTBOX_NAME))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
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
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
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

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &SharedState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let now = Utc::now();
    let id = request.id;
    let params = request.params;

    match request.method {
        Method::GetHealth => Response::ok(
            id,
            serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "timezone": state.timezone().name(),
            }),
        ),
        Method::SessionState => match parse_patient_params(params) {
            Ok(parsed) => respond(id, state.session_state(parsed.patient_id())),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::RegisterToken => match require_params(params).and_then(parse_register_token) {
            Ok(parsed) => respond(id, state.register_token(&parsed, now)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::StartSession => match parse_patient_params(params) {
            Ok(parsed) => respond(id, state.start_session(parsed.patient_id(), now)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::StopSession => match parse_patient_params(params) {
            Ok(parsed) => respond(id, state.stop_session(parsed.patient_id(), now)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::ReceiveData => handle_sample(id, params, state, now),
        Method::ImOk => match parse_patient_params(params) {
            Ok(parsed) => respond(id, state.im_ok(parsed.patient_id(), now)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::CaregiverHandleAlert => match require_params(params).and_then(parse_handle_alert)
        {
            Ok((patient_id, alert_id)) => respond(
                id,
                state.caregiver_handle_alert(&patient_id, &alert_id, now),
            ),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::GetDailySummary => match parse_history_params(params) {
            Ok(parsed) => respond(id, state.daily_summary(&parsed, now)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::ListSessions => match parse_history_params(params) {
            Ok(parsed) => respond(id, state.list_sessions(&parsed)),
            Err(err) => Response::error_with_info(id, err),
        },
        Method::ListAlerts => match parse_history_params(params) {
            Ok(parsed) => respond(id, state.list_alerts(&parsed)),
            Err(err) => Response::error_with_info(id, err),
        },
    }
}

fn handle_sample(
    id: Option<String>,
    params: Option<Value>,
    state: &SharedState,
    now: chrono::DateTime<Utc>,
) -> Response {
    let raw = match require_params(params) {
        Ok(raw) => raw,
        Err(err) => return Response::error_with_info(id, err),
    };
    let sample = match parse_sample(raw.clone()) {
        Ok(sample) => sample,
        Err(err) => return Response::error_with_info(id, err),
    };

    info!(
        patient_id = %sample.patient_id(),
        sample_type = sample.sample_type.as_str(),
        sample_id = ?sample.sample_id,
        source = ?sample.source,
        "Received sample"
    );

    // The alert push thread is detached; its outcome is only logged.
    let result = state.receive_sample(&sample, &raw, now).map(|outcome| {
        if outcome.fanout.is_some() {
            tracing::debug!(alert_id = ?outcome.receipt.alert_id, "Alert push running in background");
        }
        outcome.receipt
    });
    respond(id, result)
}

fn require_params(params: Option<Value>) -> Result<Value, ErrorInfo> {
    match params {
        Some(value) if value.is_object() => Ok(value),
        Some(_) => Err(ErrorInfo::new("invalid_params", "params must be an object")),
        None => Err(ErrorInfo::new("invalid_params", "params are required")),
    }
}

fn respond<T: Serialize>(id: Option<String>, result: Result<T, EngineError>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => Response::ok(id, value),
            Err(err) => Response::error(
                id,
                "serialization_error",
                format!("Failed to serialize response: {}", err),
            ),
        },
        Err(err) => {
            if matches!(err, EngineError::Store(_)) {
                warn!(error = %err, "Request failed with store error");
            }
            Response::error_with_info(id, err.to_error_info())
        }
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
