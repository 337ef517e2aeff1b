use crate::models::JobStage;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("extraction engine timed out after {}s", .limit.as_secs())]
    EngineTimeout { limit: Duration },

    #[error("extraction engine exited with {}", describe_exit(.exit_code))]
    Engine {
        exit_code: Option<i32>,
        diagnostics: String,
    },

    #[error("extraction engine produced unusable output: {0}")]
    EngineOutput(String),

    #[error("too many concurrent extraction jobs (limit {limit}), retry later")]
    Backpressure { limit: usize },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}

impl ExtractionError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }

    pub fn storage(context: &str, error: std::io::Error) -> Self {
        Self::Storage(format!("{context}: {error}"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Input(_) => ErrorKind::InputError,
            Self::Storage(_) => ErrorKind::StorageError,
            Self::EngineTimeout { .. } => ErrorKind::EngineTimeoutError,
            Self::Engine { .. } => ErrorKind::EngineError,
            Self::EngineOutput(_) => ErrorKind::EngineOutputError,
            Self::Backpressure { .. } => ErrorKind::BackpressureError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StorageError | ErrorKind::EngineTimeoutError | ErrorKind::BackpressureError
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InputError,
    StorageError,
    EngineTimeoutError,
    EngineError,
    EngineOutputError,
    BackpressureError,
}

/// A job that ended in the `Failed` state, with the stage it failed in.
#[derive(Debug, Error)]
#[error("job {job_id} failed while {stage}: {error}")]
pub struct JobFailure {
    pub job_id: String,
    pub stage: JobStage,
    #[source]
    pub error: ExtractionError,
}

impl JobFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                kind: self.error.kind(),
                message: self.error.to_string(),
                job_id: Some(self.job_id.clone()),
                retryable: self.error.is_retryable(),
            },
        }
    }
}

/// Wire shape of every error returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    pub job_id: Option<String>,
    pub retryable: bool,
}

impl From<&ExtractionError> for ErrorBody {
    fn from(error: &ExtractionError) -> Self {
        Self {
            error: ErrorDetail {
                kind: error.kind(),
                message: error.to_string(),
                job_id: None,
                retryable: error.is_retryable(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T, E = ExtractionError> = std::result::Result<T, E>;
