//! IPC protocol types and validation for carewalk-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 256 * 1024;
pub const DEFAULT_PATIENT_ID: &str = "p1";
/// Largest counter reading accepted from a device. Anything above is treated
/// as not reported.
pub const MAX_COUNTER: u64 = 1_000_000_000;

const MAX_ID_LEN: usize = 128;
const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    SessionState,
    RegisterToken,
    StartSession,
    StopSession,
    ReceiveData,
    ImOk,
    CaregiverHandleAlert,
    GetDailySummary,
    ListSessions,
    ListAlerts,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self::error_with_info(id, ErrorInfo::new(code, message))
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Kind of an inbound sample. Anything other than the two emergency signals is
/// routine telemetry as far as alerting is concerned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    #[default]
    Telemetry,
    FallAlert,
    LongImmobility,
    #[serde(other)]
    Other,
}

impl SampleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleType::Telemetry => "telemetry",
            SampleType::FallAlert => "fall_alert",
            SampleType::LongImmobility => "long_immobility",
            SampleType::Other => "other",
        }
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self, SampleType::FallAlert | SampleType::LongImmobility)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Patient,
    Caregiver,
}

impl DeviceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::Patient => "patient",
            DeviceRole::Caregiver => "caregiver",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "patient" => Some(DeviceRole::Patient),
            "caregiver" => Some(DeviceRole::Caregiver),
            _ => None,
        }
    }
}

/// Absolute counter readings carried by a sample. Each reading is optional;
/// a device may report only the counters it tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawCounters {
    pub steps: Option<u64>,
    pub stairs: Option<u64>,
    pub falls: Option<u64>,
}

/// Telemetry sample sent by the wearable or the phone relaying it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleEnvelope {
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub sample_id: Option<String>,
    #[serde(rename = "type", default)]
    pub sample_type: SampleType,
    #[serde(default, deserialize_with = "lenient_number")]
    pub steps: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub stairs_count: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub falls_count: Option<f64>,
    #[serde(default)]
    pub imu_moving: Option<bool>,
    #[serde(default)]
    pub source: Option<String>,
}

impl SampleEnvelope {
    pub fn patient_id(&self) -> &str {
        resolve_patient_id(self.patient_id.as_deref())
    }

    pub fn counters(&self) -> RawCounters {
        RawCounters {
            steps: whole_count(self.steps),
            stairs: whole_count(self.stairs_count),
            falls: whole_count(self.falls_count),
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        validate_patient_id(self.patient_id.as_deref())?;
        if let Some(sample_id) = self.sample_id.as_deref() {
            if sample_id.trim().is_empty() || sample_id.len() > MAX_ID_LEN {
                return Err(ErrorInfo::new(
                    "invalid_sample_id",
                    format!("sampleId must be 1-{} characters", MAX_ID_LEN),
                ));
            }
        }
        Ok(())
    }
}

/// Parameters shared by the patient-scoped commands (session state, start,
/// stop, self-acknowledgment).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PatientParams {
    #[serde(default)]
    pub patient_id: Option<String>,
}

impl PatientParams {
    pub fn patient_id(&self) -> &str {
        resolve_patient_id(self.patient_id.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegisterTokenParams {
    #[serde(default)]
    pub patient_id: Option<String>,
    pub token: String,
    pub role: DeviceRole,
    #[serde(default)]
    pub platform: Option<String>,
}

impl RegisterTokenParams {
    pub fn patient_id(&self) -> &str {
        resolve_patient_id(self.patient_id.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HandleAlertParams {
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub alert_id: Option<String>,
}

/// Read-side queries over a patient's history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HistoryParams {
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub date_key: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl HistoryParams {
    pub fn patient_id(&self) -> &str {
        resolve_patient_id(self.patient_id.as_deref())
    }

    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }
}

pub fn parse_sample(params: Value) -> Result<SampleEnvelope, ErrorInfo> {
    let sample: SampleEnvelope = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("sample payload is invalid: {}", err),
        )
    })?;
    sample.validate()?;
    Ok(sample)
}

pub fn parse_patient_params(params: Option<Value>) -> Result<PatientParams, ErrorInfo> {
    let parsed: PatientParams = match params {
        Some(Value::Null) | None => PatientParams::default(),
        Some(value) => serde_json::from_value(value).map_err(|err| {
            ErrorInfo::new("invalid_params", format!("params are invalid: {}", err))
        })?,
    };
    validate_patient_id(parsed.patient_id.as_deref())?;
    Ok(parsed)
}

pub fn parse_register_token(params: Value) -> Result<RegisterTokenParams, ErrorInfo> {
    let parsed: RegisterTokenParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("token registration is invalid: {}", err),
        )
    })?;
    validate_patient_id(parsed.patient_id.as_deref())?;
    if parsed.token.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "token is required"));
    }
    Ok(parsed)
}

/// Caregiver acknowledgment names both ids explicitly; there is no default
/// patient on this path.
pub fn parse_handle_alert(params: Value) -> Result<(String, String), ErrorInfo> {
    let parsed: HandleAlertParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("alert acknowledgment is invalid: {}", err),
        )
    })?;
    let patient_id = require_string(parsed.patient_id, "patientId")?;
    let alert_id = require_string(parsed.alert_id, "alertId")?;
    validate_patient_id(Some(&patient_id))?;
    Ok((patient_id, alert_id))
}

pub fn parse_history_params(params: Option<Value>) -> Result<HistoryParams, ErrorInfo> {
    let parsed: HistoryParams = match params {
        Some(Value::Null) | None => HistoryParams::default(),
        Some(value) => serde_json::from_value(value).map_err(|err| {
            ErrorInfo::new("invalid_params", format!("params are invalid: {}", err))
        })?,
    };
    validate_patient_id(parsed.patient_id.as_deref())?;
    if let Some(date_key) = parsed.date_key.as_deref() {
        if !is_date_key(date_key) {
            return Err(ErrorInfo::new(
                "invalid_params",
                "dateKey must be formatted YYYY-MM-DD",
            ));
        }
    }
    Ok(parsed)
}

fn is_date_key(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(index, byte)| match index {
            4 | 7 => *byte == b'-',
            _ => byte.is_ascii_digit(),
        })
}

fn resolve_patient_id(value: Option<&str>) -> &str {
    match value {
        Some(id) if !id.trim().is_empty() => id,
        _ => DEFAULT_PATIENT_ID,
    }
}

fn validate_patient_id(value: Option<&str>) -> Result<(), ErrorInfo> {
    let Some(id) = value else {
        return Ok(());
    };
    if id.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "patientId must not be blank"));
    }
    if id.len() > MAX_ID_LEN || id.contains('/') {
        return Err(ErrorInfo::new(
            "invalid_patient_id",
            format!(
                "patientId must be {} characters or fewer and contain no '/'",
                MAX_ID_LEN
            ),
        ));
    }
    Ok(())
}

fn require_string(value: Option<String>, field: &str) -> Result<String, ErrorInfo> {
    match value {
        Some(candidate) if !candidate.trim().is_empty() => Ok(candidate),
        _ => Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        )),
    }
}

fn whole_count(value: Option<f64>) -> Option<u64> {
    value
        .filter(|n| n.is_finite() && *n >= 0.0 && *n <= MAX_COUNTER as f64)
        .map(|n| n.trunc() as u64)
}

// Firmware builds disagree on whether counters are numbers or numeric
// strings; anything unparseable is treated as not reported.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        Some(Value::Bool(flag)) => Some(if flag { 1.0 } else { 0.0 }),
        _ => None,
    })
}
