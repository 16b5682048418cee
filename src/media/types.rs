//! Media types

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::storage::{BlobId, StoreError};

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRecord {
    /// Shared by the original and its thumbnail
    pub id: BlobId,
    /// Byte length of the original
    pub length: u64,
    pub content_type: String,
    /// Whether a thumbnail was stored with this upload
    pub thumbnail: bool,
}

/// Media service error types
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Invalid upload: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MediaError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Store(StoreError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
            Self::Store(StoreError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
