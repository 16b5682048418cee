//! Media routes
//!
//! Upload originals (with an optional thumbnail) and serve stored blobs.

use std::io;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State},
    http::{header, StatusCode},
    response::Response,
    routing::{get, put},
    Json, Router,
};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::StreamReader;

use crate::error::{AppError, Result};
use crate::media::{MediaRecord, MediaService};
use crate::state::AppState;
use crate::storage::{BlobId, Namespace};

/// Largest accepted upload body
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

/// Create the media router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", put(upload_media).post(upload_media))
        .route("/:namespace/:id", get(get_media))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

/// Server-side paths for local uploads
#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    pub file: Option<String>,
    pub thumbnail: Option<String>,
}

/// Store an upload
///
/// Either a multipart body with an `original` field and optional `thumbnail`
/// field, or `?file=` (and `&thumbnail=`) naming files on this host.
async fn upload_media(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    request: Request,
) -> Result<Json<MediaRecord>> {
    if let Some(file) = query.file {
        if !state.config().media.allow_local_paths {
            return Err(AppError::BadRequest(
                "Local path uploads are disabled".to_string(),
            ));
        }

        tracing::info!(file = %file, "Importing local media");
        let record = state
            .media()
            .import(
                std::path::Path::new(&file),
                query.thumbnail.as_deref().map(std::path::Path::new),
            )
            .await?;
        return Ok(Json(record));
    }

    let mut multipart = Multipart::from_request(request, &state)
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?;

    let mut draft = state.media().draft();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().unwrap_or_default().to_string();

        let reader = StreamReader::new(field.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
        tokio::pin!(reader);

        match name.as_str() {
            "original" => draft.original(&mut reader, &filename).await?,
            "thumbnail" => draft.thumbnail(&mut reader, &filename).await?,
            other => tracing::debug!(field = %other, "Ignoring unknown upload field"),
        }
    }

    let record = draft.finish().await?;
    Ok(Json(record))
}

/// Stream a stored blob
async fn get_media(
    State(state): State<AppState>,
    Path((namespace, id)): Path<(String, String)>,
) -> Result<Response> {
    let namespace: Namespace = namespace.parse()?;
    let id = BlobId::parse(&id)?;

    let reader = state.media().read(namespace, &id).await?;
    let length = reader.len();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MediaService::content_type(&id))
        .header(header::CONTENT_LENGTH, length)
        .header(header::CACHE_CONTROL, "public, max-age=31536000, immutable")
        .body(Body::from_stream(reader.into_stream()))
        .map_err(|e| AppError::Internal(e.to_string()))
}
