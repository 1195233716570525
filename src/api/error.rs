//! API error handling with the stable `{error, message}` envelope.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API error type. The `error` kind string is the stable contract;
/// messages are human-readable and may expose underlying failures.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    RuntimeNotFound(String),

    #[error("{0}")]
    SessionNotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    CreationFailed(String),

    #[error("{0}")]
    DeletionFailed(String),

    #[error("{0}")]
    PauseFailed(String),

    #[error("{0}")]
    ResumeFailed(String),

    #[error("{0}")]
    ProxyError(String),
}

impl ApiError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn runtime_not_found() -> Self {
        Self::RuntimeNotFound("Runtime not found".to_string())
    }

    pub fn session_not_found() -> Self {
        Self::SessionNotFound("Session not found".to_string())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::InvalidState(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::RuntimeNotFound(_) | Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::CreationFailed(_)
            | Self::DeletionFailed(_)
            | Self::PauseFailed(_)
            | Self::ResumeFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ProxyError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::RuntimeNotFound(_) => "runtime_not_found",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::CreationFailed(_) => "sandbox_creation_failed",
            Self::DeletionFailed(_) => "sandbox_deletion_failed",
            Self::PauseFailed(_) => "pause_failed",
            Self::ResumeFailed(_) => "resume_failed",
            Self::ProxyError(_) => "proxy_error",
        }
    }
}

/// The wire envelope for every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let kind = self.kind();
        let message = self.to_string();

        if status.is_server_error() {
            log::error!("api error [{kind}]: {message}");
        } else {
            log::debug!("client error [{kind}]: {message}");
        }

        let body = ErrorResponse {
            error: kind.to_string(),
            message: Some(message),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
