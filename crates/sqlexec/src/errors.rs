use serde::{Deserialize, Serialize};

use crate::result::QueryStatus;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Parse(#[from] sqlscript::ScriptError),

    #[error("{0}")]
    Security(String),

    #[error("{message}")]
    Timeout { message: String, seconds: u64 },

    #[error("{message}")]
    Database {
        message: String,
        errors: Vec<ErrorInfo>,
    },

    #[error("{0}")]
    ResultsBackend(String),

    #[error("failed to render template: {0}")]
    Template(#[from] minijinja::Error),

    #[error(transparent)]
    Access(#[from] access::AccessError),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] resultstore::StoreError),

    #[error("invalid value for setting '{name}': {reason}")]
    InvalidSetting { name: String, reason: String },

    #[error("unknown setting '{0}'")]
    UnknownSetting(String),

    #[error("background job runner is closed")]
    JobRunnerClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// Machine readable tag for the error.
    pub fn error_type(&self) -> &'static str {
        match self {
            ExecError::Parse(_) => "PARSE_ERROR",
            ExecError::Security(_) => "SECURITY_ERROR",
            ExecError::Timeout { .. } => "TIMEOUT_ERROR",
            ExecError::Database { .. } => "DATABASE_ERROR",
            ExecError::ResultsBackend(_)
            | ExecError::Arrow(_)
            | ExecError::Json(_)
            | ExecError::Store(_) => "RESULTS_BACKEND_ERROR",
            ExecError::Template(_) => "TEMPLATE_ERROR",
            ExecError::Access(_) => "ACCESS_RULE_ERROR",
            ExecError::InvalidSetting { .. }
            | ExecError::UnknownSetting(_)
            | ExecError::JobRunnerClosed
            | ExecError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Status a query ends up in when it fails with this error.
    pub fn query_status(&self) -> QueryStatus {
        match self {
            ExecError::Timeout { .. } => QueryStatus::TimedOut,
            _ => QueryStatus::Failed,
        }
    }

    /// Structured errors for reporting back to callers.
    pub fn error_infos(&self) -> Vec<ErrorInfo> {
        match self {
            ExecError::Database { errors, .. } if !errors.is_empty() => errors.clone(),
            other => vec![ErrorInfo::new(
                other.to_string(),
                other.error_type(),
                ErrorLevel::Error,
            )],
        }
    }

    pub(crate) fn timeout(seconds: u64) -> Self {
        ExecError::Timeout {
            message: format!("Query exceeded the {seconds} seconds timeout."),
            seconds,
        }
    }
}

pub type Result<T, E = ExecError> = std::result::Result<T, E>;

#[allow(unused_macros)]
macro_rules! internal {
    ($($arg:tt)*) => {
        crate::errors::ExecError::Internal(std::format!($($arg)*))
    };
}
pub(crate) use internal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorLevel {
    Info,
    Warning,
    Error,
}

/// An error refined by an engine adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub error_type: String,
    pub level: ErrorLevel,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>, level: ErrorLevel) -> Self {
        ErrorInfo {
            message: message.into(),
            error_type: error_type.into(),
            level,
        }
    }
}

/// Error raised by a database driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        DriverError {
            message: message.into(),
        }
    }
}
