//! Health check endpoints

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;
use crate::sync::SyncMode;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub name: String,
    pub mode: SyncMode,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        service: "media-sync-server",
        name: state.sync().name().to_string(),
        mode: state.sync().mode(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}
