//! Role-targeted push fan-out.
//!
//! Looks up a patient's registrations for one role, hands the batch to the
//! push channel, and deletes registrations the channel reports as permanently
//! invalid before returning.

use carewalk_daemon_protocol::DeviceRole;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::alerts::AlertRecord;
use crate::db::Db;
use crate::push::{MulticastMessage, PushChannel, PushNotification};

pub const KIND_ALERT: &str = "alert";
pub const KIND_PATIENT_OK: &str = "patient_ok";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub sent: usize,
    pub pruned: usize,
}

/// Storage key for a registration: the token with every byte outside the
/// URI-unreserved set written as `_XX`.
pub fn token_doc_id(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    for byte in token.bytes() {
        let keep = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')');
        if keep {
            out.push(byte as char);
        } else {
            let _ = write!(out, "_{:02X}", byte);
        }
    }
    out
}

/// Push data values must be strings; anything else is sent as its JSON text.
/// Null entries are dropped.
pub fn to_string_data(data: &Map<String, Value>) -> BTreeMap<String, String> {
    data.iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let text = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), text)
        })
        .collect()
}

pub fn send_push_to_role(
    db: &Db,
    channel: &dyn PushChannel,
    patient_id: &str,
    role: DeviceRole,
    notification: PushNotification,
    data: &Map<String, Value>,
) -> Result<FanoutReport, String> {
    let registrations = db.tokens_by_role(patient_id, role.as_str())?;
    let registrations: Vec<_> = registrations
        .into_iter()
        .filter(|row| !row.token.is_empty())
        .collect();
    if registrations.is_empty() {
        return Ok(FanoutReport::default());
    }

    let message = MulticastMessage {
        tokens: registrations.iter().map(|row| row.token.clone()).collect(),
        notification,
        data: to_string_data(data),
    };
    let report = channel.send_multicast(&message)?;

    let mut pruned = 0;
    for (row, result) in registrations.iter().zip(report.responses.iter()) {
        if !result.is_permanent_failure() {
            continue;
        }
        match db.delete_device_token(patient_id, &row.token_id) {
            Ok(()) => pruned += 1,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    patient_id = %patient_id,
                    token_id = %row.token_id,
                    "Failed to prune invalid device token"
                );
            }
        }
    }

    Ok(FanoutReport {
        sent: report.success_count(),
        pruned,
    })
}

/// Caregiver notification for a newly created alert. Runs off the request
/// thread; failures are logged and never reach the sample's caller.
pub fn spawn_alert_fanout(
    db: Db,
    channel: Arc<dyn PushChannel>,
    alert: &AlertRecord,
) -> Option<JoinHandle<()>> {
    let patient_id = alert.patient_id.clone();
    let alert_id = alert.alert_id.clone();
    let notification = PushNotification::new("ALERT", alert.alert_type.clone());
    let mut data = Map::new();
    data.insert("kind".to_string(), Value::String(KIND_ALERT.to_string()));
    data.insert("alertId".to_string(), Value::String(alert_id.clone()));
    if let Some(session_id) = &alert.session_id {
        data.insert("sessionId".to_string(), Value::String(session_id.clone()));
    }

    let spawned = thread::Builder::new()
        .name("carewalk-alert-push".to_string())
        .spawn(move || {
            match send_push_to_role(
                &db,
                channel.as_ref(),
                &patient_id,
                DeviceRole::Caregiver,
                notification,
                &data,
            ) {
                Ok(report) => {
                    tracing::info!(
                        patient_id = %patient_id,
                        alert_id = %alert_id,
                        sent = report.sent,
                        pruned = report.pruned,
                        "Alert push dispatched"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        patient_id = %patient_id,
                        alert_id = %alert_id,
                        "Alert push failed"
                    );
                }
            }
        });

    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(error = %err, "Failed to spawn alert push thread");
            None
        }
    }
}
