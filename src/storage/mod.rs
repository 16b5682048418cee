//! Storage module for content-addressed media blobs
//!
//! Blobs live under `original/<id>` and `thumbnail/<id>` and are immutable
//! once committed.

mod blob_store;
mod types;

pub use blob_store::{BlobReader, BlobStore, BlobWriter, StagedBlob, READ_BUFFER_SIZE};
pub use types::*;
