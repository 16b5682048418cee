//! Sync API endpoints
//!
//! Trigger sessions and manage which peers this node announces itself to.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::sync::{PeerTarget, SyncReport};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start", get(start_sync))
        .route("/targets", get(list_targets))
        .route("/peers", get(list_peers).post(add_peer).delete(remove_peer))
}

/// Peer address from the query string
#[derive(Debug, Deserialize)]
pub struct PeerQuery {
    pub host: String,
    pub port: u16,
    pub name: Option<String>,
}

impl PeerQuery {
    fn into_target(self) -> PeerTarget {
        let target = PeerTarget::new(self.host, self.port);
        match self.name {
            Some(name) if !name.is_empty() => target.with_name(name),
            _ => target,
        }
    }
}

/// Push every local blob to `host:port`; responds once the peer has them
async fn start_sync(
    State(state): State<AppState>,
    Query(query): Query<PeerQuery>,
) -> Result<Json<SyncReport>> {
    let target = query.into_target();
    tracing::info!(peer = %target, "Sync requested");

    let report = state.sync().sync_now(target).await?;
    Ok(Json(report))
}

/// Peers currently connected to this node
async fn list_targets(State(state): State<AppState>) -> Json<Vec<PeerTarget>> {
    Json(state.sync().targets())
}

/// Peers this node announces itself to
async fn list_peers(State(state): State<AppState>) -> Json<Vec<PeerTarget>> {
    Json(state.sync().linked_peers())
}

async fn add_peer(
    State(state): State<AppState>,
    Query(query): Query<PeerQuery>,
) -> Result<(StatusCode, Json<PeerTarget>)> {
    let target = query.into_target();
    state.sync().connect(target.clone()).await?;
    Ok((StatusCode::CREATED, Json(target)))
}

async fn remove_peer(
    State(state): State<AppState>,
    Query(query): Query<PeerQuery>,
) -> Result<StatusCode> {
    let target = query.into_target();
    if state.sync().disconnect(&target) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!(
            "Not linked to {}",
            target.address()
        )))
    }
}
