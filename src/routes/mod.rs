//! Route modules for the media sync server

pub mod health;
pub mod media;
pub mod sync;

use axum::Router;

use crate::state::AppState;

/// Assemble the HTTP API
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest("/media", media::router())
        .nest("/sync", sync::router())
        .with_state(state)
}
