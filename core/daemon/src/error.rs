use carewalk_daemon_protocol::ErrorInfo;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{}", .0.message)]
    Validation(ErrorInfo),
    #[error("alert {alert_id} not found for patient {patient_id}")]
    AlertNotFound {
        patient_id: String,
        alert_id: String,
    },
    #[error("{0}")]
    Store(String),
}

impl EngineError {
    pub fn code(&self) -> &str {
        match self {
            EngineError::Validation(info) => &info.code,
            EngineError::AlertNotFound { .. } => "alert_not_found",
            EngineError::Store(_) => "store_error",
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            EngineError::Validation(info) => info.clone(),
            other => ErrorInfo::new(other.code(), other.to_string()),
        }
    }
}

impl From<ErrorInfo> for EngineError {
    fn from(info: ErrorInfo) -> Self {
        EngineError::Validation(info)
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Store(err)
    }
}
