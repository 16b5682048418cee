//! Media upload and retrieval on top of the blob store

mod service;
mod types;

pub use service::{extension_of, MediaDraft, MediaService, FALLBACK_EXTENSION};
pub use types::{MediaError, MediaRecord};
