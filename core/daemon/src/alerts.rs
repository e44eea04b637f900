//! Alert decisions and acknowledgment.

use carewalk_daemon_protocol::SampleType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::calendar::timestamp;

pub const FALL_ALERT: &str = "fall_alert";
const NOTE_OFFLINE: &str = "Synced from offline";
const NOTE_REALTIME: &str = "Realtime";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandledBy {
    Patient,
    Caregiver,
}

impl HandledBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandledBy::Patient => "patient",
            HandledBy::Caregiver => "caregiver",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "patient" => Some(HandledBy::Patient),
            "caregiver" => Some(HandledBy::Caregiver),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub alert_id: String,
    pub patient_id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub session_id: Option<String>,
    pub timestamp: String,
    pub handled: bool,
    pub handled_at: Option<String>,
    pub handled_by: Option<HandledBy>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertDecision {
    pub alert_type: &'static str,
    /// Amount added to `alertsCount` on the day and session rows.
    pub alerts_increment: u64,
    pub note: &'static str,
}

/// Explicit emergency samples always alert. A routine sample alerts when its
/// fall counter advanced, which is how falls buffered while the device was
/// offline arrive.
pub fn decide_alert(sample_type: SampleType, fall_delta: u64) -> Option<AlertDecision> {
    if sample_type.is_emergency() {
        return Some(AlertDecision {
            alert_type: sample_type.as_str(),
            alerts_increment: if fall_delta > 0 { fall_delta } else { 1 },
            note: NOTE_REALTIME,
        });
    }

    if fall_delta > 0 {
        return Some(AlertDecision {
            alert_type: FALL_ALERT,
            alerts_increment: fall_delta,
            note: NOTE_OFFLINE,
        });
    }

    None
}

pub fn build_alert(
    decision: &AlertDecision,
    alert_id: String,
    patient_id: &str,
    session_id: Option<String>,
    sample: &Value,
    now: DateTime<Utc>,
) -> AlertRecord {
    let mut payload = match sample {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    payload.insert("note".to_string(), Value::String(decision.note.to_string()));

    AlertRecord {
        alert_id,
        patient_id: patient_id.to_string(),
        alert_type: decision.alert_type.to_string(),
        session_id,
        timestamp: timestamp(now),
        handled: false,
        handled_at: None,
        handled_by: None,
        payload: Value::Object(payload),
    }
}
