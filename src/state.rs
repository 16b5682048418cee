//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::media::MediaService;
use crate::sync::SyncRouter;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    media: MediaService,
    sync: SyncRouter,
}

impl AppState {
    pub fn new(config: Config, media: MediaService, sync: SyncRouter) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                media,
                sync,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn media(&self) -> &MediaService {
        &self.inner.media
    }

    pub fn sync(&self) -> &SyncRouter {
        &self.inner.sync
    }
}
