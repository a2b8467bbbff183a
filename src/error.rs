//! Error taxonomy shared by every phase of a download request.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Fixed set of failure categories a download request can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    UnsupportedFormat,
    BotDetectionBlocked,
    ProbeFailed,
    StreamLaunchFailed,
    StreamRuntimeFailed,
}

/// How a client should react to a given failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    FixInput,
    DoNotRetry,
    Retry,
    RetryLaterOrElsewhere,
    OperatorIssue,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidInput | ErrorKind::UnsupportedFormat => StatusCode::BAD_REQUEST,
            ErrorKind::BotDetectionBlocked
            | ErrorKind::ProbeFailed
            | ErrorKind::StreamLaunchFailed
            | ErrorKind::StreamRuntimeFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retry_hint(self) -> RetryHint {
        match self {
            ErrorKind::InvalidInput => RetryHint::FixInput,
            ErrorKind::UnsupportedFormat => RetryHint::DoNotRetry,
            ErrorKind::ProbeFailed | ErrorKind::StreamRuntimeFailed => RetryHint::Retry,
            ErrorKind::BotDetectionBlocked => RetryHint::RetryLaterOrElsewhere,
            ErrorKind::StreamLaunchFailed => RetryHint::OperatorIssue,
        }
    }
}

/// A failure that has already been mapped to a category and a user-facing
/// message. The message is what ends up in the `{"error": ...}` body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedFormat, message)
    }

    pub fn probe_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProbeFailed, message)
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }
}

impl IntoResponse for ClassifiedError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.message,
        });
        (status, Json(body)).into_response()
    }
}
