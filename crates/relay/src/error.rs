// crates/relay/src/error.rs
use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failure talking to the backend job endpoint.
#[derive(Debug, Error)]
pub enum BackendRequestError {
    #[error("request to backend failed: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("backend returned status {status}")]
    Status { status: reqwest::StatusCode },

    #[error("backend event stream broke: {0}")]
    Stream(#[source] std::io::Error),
}

/// Failure fetching or unpacking the result artifact.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("artifact download failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("artifact download returned status {status}")]
    Status { status: reqwest::StatusCode },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid artifact bundle: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("extraction task failed: {0}")]
    Task(String),
}

impl TransferError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Machine-readable category of a failed relay run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BackendRequest,
    Transfer,
    Cancelled,
}

/// Anything that ends a relay run early.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Backend(#[from] BackendRequestError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("job cancelled: client disconnected")]
    Cancelled,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Backend(_) => ErrorKind::BackendRequest,
            RelayError::Transfer(_) => ErrorKind::Transfer,
            RelayError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind address {addr}: {source}")]
    BindAddr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("invalid backend url {url}: {message}")]
    BackendUrl { url: String, message: String },
}

/// Structured JSON error response for HTTP-level errors
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Errors returned by the transport endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::SessionNotFound(id) => {
                tracing::warn!(session_id = %id, "Session not found");
                (
                    StatusCode::NOT_FOUND,
                    ErrorResponse::with_details("Session not found", format!("Session ID: {id}")),
                )
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!(message = %msg, "Bad request");
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::with_details("Bad request", msg.clone()),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
