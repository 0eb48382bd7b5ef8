//! HTTP error types for selah-sa
//!
//! `ApiError` is the boundary between the orchestration core and axum:
//! handlers return `ApiResult<T>` and every error renders as a JSON body
//! `{"error": {"code", "message"}}` with a matching status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::orchestrator::SubmitError;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Request is well-formed but cannot be processed (422), e.g. a
    /// playlist with no members
    #[error("Unprocessable: {0}")]
    EmptyCollection(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// selah-common error
    #[error("Common error: {0}")]
    Common(#[from] selah_common::Error),
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::TrackNotFound(_)
            | SubmitError::PlaylistNotFound(_)
            | SubmitError::JobNotFound(_) => ApiError::NotFound(err.to_string()),
            SubmitError::EmptyCollection(_) => ApiError::EmptyCollection(err.to_string()),
            SubmitError::Database(e) => ApiError::Common(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::EmptyCollection(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "EMPTY_PLAYLIST", msg)
            }
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg,
            ),
            ApiError::Other(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                err.to_string(),
            ),
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
