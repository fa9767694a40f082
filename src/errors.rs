use crate::{
    services::{codec::CodecError, ledger::LedgerError},
    storage::StorageError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Machine-distinguishable error category carried in every error body.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    ValidationError,
    DecodeError,
    StorageWriteError,
    AuthorizationError,
    ProcessingError,
    Unauthorized,
    Forbidden,
    NotFound,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::DecodeError => "DecodeError",
            ErrorKind::StorageWriteError => "StorageWriteError",
            ErrorKind::AuthorizationError => "AuthorizationError",
            ErrorKind::ProcessingError => "ProcessingError",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

/// Terminal failure for one file.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("storage write failed: {0}")]
    StorageWrite(String),
    #[error("storage authorization failed: {0}")]
    Authorization(String),
    #[error("image processing failed: {0}")]
    Processing(String),
}

impl IntakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IntakeError::Decode(_) => ErrorKind::DecodeError,
            IntakeError::StorageWrite(_) => ErrorKind::StorageWriteError,
            IntakeError::Authorization(_) => ErrorKind::AuthorizationError,
            IntakeError::Processing(_) => ErrorKind::ProcessingError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            IntakeError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            IntakeError::StorageWrite(_) => StatusCode::SERVICE_UNAVAILABLE,
            IntakeError::Authorization(_) => StatusCode::BAD_GATEWAY,
            IntakeError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether re-sending the same file may succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, IntakeError::StorageWrite(_))
    }
}

impl From<CodecError> for IntakeError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Decode(reason) => IntakeError::Decode(reason),
            other => IntakeError::Processing(other.to_string()),
        }
    }
}

impl From<StorageError> for IntakeError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Authorization(reason) => IntakeError::Authorization(reason),
            other => IntakeError::StorageWrite(other.to_string()),
        }
    }
}

/// An HTTP-facing error: status, kind, and a message kept local to the request.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl AppError {
    pub fn new(status: StatusCode, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: msg.into(),
            retryable: false,
        }
    }

    /// Caller-fixable input problem, rejected before any processing.
    pub fn validation(status: StatusCode, msg: impl Into<String>) -> Self {
        Self::new(status, ErrorKind::ValidationError, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::validation(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorKind::Unauthorized, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, ErrorKind::Forbidden, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::NotFound, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::InternalError,
            msg,
        )
    }

    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": self.message,
            "kind": self.kind,
            "status": self.status.as_u16(),
            "retryable": self.retryable,
        })
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

impl From<IntakeError> for AppError {
    fn from(err: IntakeError) -> Self {
        Self {
            status: err.status(),
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.retryable(),
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => AppError::not_found(format!("upload `{id}` not found")),
            other => {
                tracing::error!(error = %other, "ledger query failed");
                AppError::internal("upload ledger unavailable")
            }
        }
    }
}
