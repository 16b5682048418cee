//! Error types for the media sync server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::media::MediaError;
use crate::storage::StoreError;
use crate::sync::SyncError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Media(MediaError::Store(e)) | AppError::Store(e) => store_parts(e),
            AppError::Media(e @ MediaError::Validation(_)) => {
                (e.status_code(), "validation_error", e.to_string())
            }
            AppError::Sync(e) => {
                tracing::warn!(peer = %e.peer(), error = %e, "Sync request failed");
                let error_type = match e {
                    SyncError::Timeout { .. } => "sync_timeout",
                    SyncError::Store { .. } => "storage_error",
                    _ => "sync_error",
                };
                (e.status_code(), error_type, e.to_string())
            }
        }
    }
}

fn store_parts(e: &StoreError) -> (StatusCode, &'static str, String) {
    match e {
        // Surfaced verbatim; callers match on the "Blob not found" prefix
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", e.to_string()),
        StoreError::InvalidKey(_) => (StatusCode::BAD_REQUEST, "bad_request", e.to_string()),
        StoreError::Io(io) => {
            tracing::error!("Storage error: {}", io);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "Storage error".to_string(),
            )
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = self.parts();

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}
