//! Helpers for driving a real `carewalk-daemon` process over its socket.
#![allow(dead_code)]

use carewalk_daemon_protocol::{Method, Request, Response, PROTOCOL_VERSION};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Kills the daemon when the test ends, pass or fail.
pub struct Daemon {
    child: Child,
    pub socket: PathBuf,
}

impl Daemon {
    pub fn spawn(home: &Path) -> Self {
        let child = Command::new(env!("CARGO_BIN_EXE_carewalk-daemon"))
            .env("HOME", home)
            .env_remove("CAREWALK_CONFIG")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn carewalk-daemon");
        let daemon = Self {
            child,
            socket: home.join(".carewalk").join("daemon.sock"),
        };
        daemon.wait_ready(Duration::from_secs(5));
        daemon
    }

    fn wait_ready(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if UnixStream::connect(&self.socket).is_ok() {
                return;
            }
            sleep(Duration::from_millis(25));
        }
        panic!("daemon socket never came up at {}", self.socket.display());
    }

    pub fn request(&self, request: &Request) -> Response {
        let mut payload = serde_json::to_vec(request).expect("serialize request");
        payload.push(b'\n');
        self.raw(&payload)
    }

    pub fn raw(&self, payload: &[u8]) -> Response {
        let mut stream = UnixStream::connect(&self.socket).expect("connect to daemon");
        stream.write_all(payload).expect("write request");
        stream.flush().expect("flush request");
        read_response(stream)
    }

    pub fn call(&self, method: Method, params: Option<Value>) -> Response {
        self.request(&Request {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some(format!("{:?}", method)),
            params,
        })
    }

    /// Payload of a successful call; panics with the daemon's error otherwise.
    pub fn data(&self, method: Method, params: Option<Value>) -> Value {
        let response = self.call(method, params);
        assert!(response.ok, "{:?} failed: {:?}", method, response.error);
        response.data.expect("response payload")
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn read_response(stream: UnixStream) -> Response {
    let mut line = String::new();
    BufReader::new(stream)
        .read_line(&mut line)
        .expect("read response");
    serde_json::from_str(line.trim_end()).expect("parse response JSON")
}

pub fn error_code(response: &Response) -> Option<&str> {
    response.error.as_ref().map(|err| err.code.as_str())
}

/// Short paths under /tmp keep socket names within the platform limit.
pub fn temp_home(prefix: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in("/tmp")
        .expect("create temp HOME")
}

/// Some sandboxes forbid binding unix sockets; tests skip there.
pub fn can_bind_socket(home: &Path) -> bool {
    let path = home.join("bind-check.sock");
    match UnixListener::bind(&path) {
        Ok(listener) => {
            drop(listener);
            let _ = std::fs::remove_file(&path);
            true
        }
        Err(err) => err.kind() != std::io::ErrorKind::PermissionDenied,
    }
}

/// Returns early from a test when unix sockets cannot be bound.
macro_rules! require_sockets {
    ($home:expr) => {
        if !$crate::common::can_bind_socket($home.path()) {
            eprintln!("Skipping: unix socket binding not permitted in this environment.");
            return;
        }
    };
}
