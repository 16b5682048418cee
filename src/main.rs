//! Media Sync Server
//!
//! Stores uploaded media as content-addressed blobs and pushes them to peer
//! nodes over a small TCP sync protocol.

use anyhow::Context;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use media_sync_server::config::Config;
use media_sync_server::media::MediaService;
use media_sync_server::routes;
use media_sync_server::state::AppState;
use media_sync_server::storage::BlobStore;
use media_sync_server::sync::{RouterOptions, SyncRouter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "media_sync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Media Sync Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Media root: {}", config.storage.root.display());
    tracing::info!("Sync mode: {}", config.sync.mode);

    let store = BlobStore::open(&config.storage.root)
        .await
        .with_context(|| format!("failed to open blob store at {}", config.storage.root.display()))?;

    // Sync router and its listener
    let sync = SyncRouter::start(RouterOptions::from(&config.sync), store.clone());

    let sync_addr = format!("{}:{}", config.sync.host, config.sync.port);
    let sync_listener = tokio::net::TcpListener::bind(&sync_addr)
        .await
        .with_context(|| format!("failed to bind sync listener on {}", sync_addr))?;
    sync.listen(sync_listener)?;

    for peer in &config.sync.peers {
        if let Err(e) = sync.connect(peer.clone()).await {
            tracing::warn!(peer = %peer, error = %e, "Could not reach configured peer");
        }
    }

    let media = MediaService::with_sync(store, sync.clone());
    let app_state = AppState::new(config.clone(), media, sync);

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server with graceful shutdown
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Media Sync Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
