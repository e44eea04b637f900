//! Push delivery channel.
//!
//! The daemon does not talk to a push provider itself. It hands multicast
//! messages to a `PushChannel` and reads back a per-token report. The default
//! channel appends messages to a JSONL outbox that an external delivery agent
//! drains.

use chrono::Utc;
use fs_err as fs;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

pub const ERROR_TOKEN_NOT_REGISTERED: &str = "messaging/registration-token-not-registered";
pub const ERROR_INVALID_TOKEN: &str = "messaging/invalid-registration-token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
}

impl PushNotification {
    pub fn new(title: &str, body: impl Into<String>) -> Self {
        Self {
            title: title.to_string(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MulticastMessage {
    pub tokens: Vec<String>,
    pub notification: PushNotification,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub success: bool,
    pub error_code: Option<String>,
}

impl SendResult {
    pub fn delivered() -> Self {
        Self {
            success: true,
            error_code: None,
        }
    }

    pub fn failed(code: &str) -> Self {
        Self {
            success: false,
            error_code: Some(code.to_string()),
        }
    }

    /// The registration will never work again and should be removed.
    pub fn is_permanent_failure(&self) -> bool {
        if self.success {
            return false;
        }
        self.error_code
            .as_deref()
            .map(|code| {
                code.contains("registration-token-not-registered")
                    || code.contains("invalid-registration-token")
            })
            .unwrap_or(false)
    }
}

/// One result per token, in the same order as `MulticastMessage::tokens`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastReport {
    pub responses: Vec<SendResult>,
}

impl MulticastReport {
    pub fn success_count(&self) -> usize {
        self.responses.iter().filter(|result| result.success).count()
    }
}

pub trait PushChannel: Send + Sync {
    /// `Err` means nothing was sent at all; per-token failures belong in the
    /// report.
    fn send_multicast(&self, message: &MulticastMessage) -> Result<MulticastReport, String>;
}

#[derive(Serialize)]
struct OutboxEntry<'a> {
    queued_at: String,
    #[serde(flatten)]
    message: &'a MulticastMessage,
}

pub struct OutboxChannel {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl OutboxChannel {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }
}

impl PushChannel for OutboxChannel {
    fn send_multicast(&self, message: &MulticastMessage) -> Result<MulticastReport, String> {
        let mut responses = Vec::with_capacity(message.tokens.len());
        let mut deliverable = Vec::new();
        for token in &message.tokens {
            if is_well_formed_token(token) {
                responses.push(SendResult::delivered());
                deliverable.push(token.clone());
            } else {
                responses.push(SendResult::failed(ERROR_INVALID_TOKEN));
            }
        }

        if deliverable.is_empty() {
            return Ok(MulticastReport { responses });
        }

        let filtered = MulticastMessage {
            tokens: deliverable,
            notification: message.notification.clone(),
            data: message.data.clone(),
        };
        let mut line = serde_json::to_string(&OutboxEntry {
            queued_at: Utc::now().to_rfc3339(),
            message: &filtered,
        })
        .map_err(|err| format!("Failed to serialize push message: {}", err))?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| "Push outbox lock poisoned".to_string())?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| format!("Failed to create push outbox dir: {}", err))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| format!("Failed to open push outbox: {}", err))?;
        file.write_all(line.as_bytes())
            .map_err(|err| format!("Failed to append to push outbox: {}", err))?;

        Ok(MulticastReport { responses })
    }
}

fn is_well_formed_token(token: &str) -> bool {
    !token.is_empty() && token.len() <= 4096 && !token.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(tokens: &[&str]) -> MulticastMessage {
        MulticastMessage {
            tokens: tokens.iter().map(|token| token.to_string()).collect(),
            notification: PushNotification::new("ALERT", "fall_alert"),
            data: BTreeMap::from([("kind".to_string(), "alert".to_string())]),
        }
    }

    #[test]
    fn outbox_appends_one_line_per_message() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("push").join("outbox.jsonl");
        let channel = OutboxChannel::new(path.clone());

        channel.send_multicast(&message(&["tok-a"])).expect("first send");
        let report = channel
            .send_multicast(&message(&["tok-b", "tok-c"]))
            .expect("second send");
        assert_eq!(report.success_count(), 2);

        let content = std::fs::read_to_string(&path).expect("read outbox");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("json line");
        assert_eq!(second["tokens"], serde_json::json!(["tok-b", "tok-c"]));
        assert_eq!(second["notification"]["title"], "ALERT");
        assert_eq!(second["data"]["kind"], "alert");
    }

    #[test]
    fn malformed_tokens_report_invalid() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let channel = OutboxChannel::new(temp_dir.path().join("outbox.jsonl"));

        let report = channel
            .send_multicast(&message(&["good", "has space", ""]))
            .expect("send");
        assert_eq!(report.responses[0], SendResult::delivered());
        assert!(report.responses[1].is_permanent_failure());
        assert!(report.responses[2].is_permanent_failure());
        assert_eq!(report.success_count(), 1);
    }

    #[test]
    fn transient_failure_is_not_permanent() {
        assert!(!SendResult::failed("messaging/internal-error").is_permanent_failure());
        assert!(SendResult::failed(ERROR_TOKEN_NOT_REGISTERED).is_permanent_failure());
        assert!(!SendResult::delivered().is_permanent_failure());
    }
}
