//! Media service
//!
//! Turns uploads into content-addressed blob pairs. The original's SHA-256
//! plus its filename extension forms the id; the thumbnail is stored under
//! the same id in its own namespace.

use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::storage::{
    BlobId, BlobKey, BlobReader, BlobStore, Namespace, StagedBlob, MAX_EXTENSION_LEN,
};
use crate::sync::SyncRouter;

use super::types::{MediaError, MediaRecord};

/// Extension used when a filename has none we can keep
pub const FALLBACK_EXTENSION: &str = "bin";

/// Media service handle
#[derive(Clone)]
pub struct MediaService {
    inner: Arc<MediaServiceInner>,
}

struct MediaServiceInner {
    store: BlobStore,
    sync: Option<SyncRouter>,
}

impl MediaService {
    /// Service without sync notifications
    pub fn new(store: BlobStore) -> Self {
        Self {
            inner: Arc::new(MediaServiceInner { store, sync: None }),
        }
    }

    /// Service that tells `sync` about every upload
    pub fn with_sync(store: BlobStore, sync: SyncRouter) -> Self {
        Self {
            inner: Arc::new(MediaServiceInner {
                store,
                sync: Some(sync),
            }),
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.inner.store
    }

    /// Store an original and optional thumbnail in one call
    pub async fn create<R, T>(
        &self,
        original: R,
        filename: &str,
        thumbnail: Option<(T, &str)>,
    ) -> Result<MediaRecord, MediaError>
    where
        R: AsyncRead + Unpin,
        T: AsyncRead + Unpin,
    {
        let mut draft = self.draft();
        draft.original(original, filename).await?;
        if let Some((reader, thumbnail_name)) = thumbnail {
            draft.thumbnail(reader, thumbnail_name).await?;
        }
        draft.finish().await
    }

    /// Store files from the server's own filesystem
    pub async fn import(
        &self,
        original: &Path,
        thumbnail: Option<&Path>,
    ) -> Result<MediaRecord, MediaError> {
        let mut draft = self.draft();

        let file = open_local(original).await?;
        draft.original(file, &display_name(original)).await?;

        if let Some(path) = thumbnail {
            let file = open_local(path).await?;
            draft.thumbnail(file, &display_name(path)).await?;
        }

        draft.finish().await
    }

    /// Begin an upload whose parts arrive one at a time
    pub fn draft(&self) -> MediaDraft {
        MediaDraft {
            service: self.clone(),
            original: None,
            thumbnail: None,
        }
    }

    /// Open a stored blob
    pub async fn read(&self, namespace: Namespace, id: &BlobId) -> Result<BlobReader, MediaError> {
        let key = BlobKey::new(namespace, id.clone());
        Ok(self.inner.store.get(&key).await?)
    }

    /// MIME type implied by the id's extension
    pub fn content_type(id: &BlobId) -> String {
        mime_guess::from_ext(id.extension())
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }
}

/// Lowercased extension of `filename`, or [`FALLBACK_EXTENSION`]
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
}

async fn open_local(path: &Path) -> Result<tokio::fs::File, MediaError> {
    tokio::fs::File::open(path)
        .await
        .map_err(|e| MediaError::Validation(format!("cannot read {}: {}", path.display(), e)))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ============================================================================
// Draft
// ============================================================================

/// Upload in progress
///
/// Parts are staged as they arrive and only committed by [`finish`]. Dropping
/// a draft discards everything staged so far.
///
/// [`finish`]: MediaDraft::finish
pub struct MediaDraft {
    service: MediaService,
    original: Option<(StagedBlob, String)>,
    thumbnail: Option<StagedBlob>,
}

impl MediaDraft {
    pub async fn original<R>(&mut self, reader: R, filename: &str) -> Result<(), MediaError>
    where
        R: AsyncRead + Unpin,
    {
        if self.original.is_some() {
            return Err(MediaError::Validation("original supplied twice".to_string()));
        }
        let staged = self.service.inner.store.stage(reader).await?;
        self.original = Some((staged, extension_of(filename)));
        Ok(())
    }

    /// The thumbnail's own filename does not affect the id
    pub async fn thumbnail<R>(&mut self, reader: R, filename: &str) -> Result<(), MediaError>
    where
        R: AsyncRead + Unpin,
    {
        if self.thumbnail.is_some() {
            return Err(MediaError::Validation("thumbnail supplied twice".to_string()));
        }
        let staged = self.service.inner.store.stage(reader).await?;
        tracing::trace!(filename = %filename, length = staged.length(), "Staged thumbnail");
        self.thumbnail = Some(staged);
        Ok(())
    }

    /// Commit the staged parts and report the record
    pub async fn finish(self) -> Result<MediaRecord, MediaError> {
        let Some((original, extension)) = self.original else {
            return Err(MediaError::Validation("missing original".to_string()));
        };

        let id = BlobId::new(original.digest(), &extension)?;
        let length = original.length();

        let mut keys = vec![BlobKey::original(id.clone())];
        let created = original.commit(&keys[0]).await?;

        let has_thumbnail = self.thumbnail.is_some();
        if let Some(thumbnail) = self.thumbnail {
            let key = BlobKey::thumbnail(id.clone());
            thumbnail.commit(&key).await?;
            keys.push(key);
        }

        tracing::info!(
            id = %id,
            length,
            thumbnail = has_thumbnail,
            created,
            "Stored media"
        );

        // Peers that already hold these keys skip them cheaply
        if let Some(sync) = &self.service.inner.sync {
            sync.blobs_stored(keys);
        }

        Ok(MediaRecord {
            content_type: MediaService::content_type(&id),
            id,
            length,
            thumbnail: has_thumbnail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn service() -> (MediaService, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        (MediaService::new(store), dir)
    }

    async fn read_all(service: &MediaService, namespace: Namespace, id: &BlobId) -> Vec<u8> {
        let mut reader = service.read(namespace, id).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_create_with_thumbnail_shares_id() {
        let (service, _dir) = service().await;

        let record = service
            .create(&b"full size"[..], "photo.JPG", Some((&b"small"[..], "thumb.png")))
            .await
            .unwrap();

        assert!(record.id.as_str().ends_with(".jpg"));
        assert_eq!(record.id.digest().len(), 64);
        assert_eq!(record.length, 9);
        assert_eq!(record.content_type, "image/jpeg");
        assert!(record.thumbnail);

        assert_eq!(read_all(&service, Namespace::Original, &record.id).await, b"full size");
        assert_eq!(read_all(&service, Namespace::Thumbnail, &record.id).await, b"small");
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (service, _dir) = service().await;
        let none: Option<(&[u8], &str)> = None;

        let first = service.create(&b"same"[..], "a.png", none).await.unwrap();
        let second = service.create(&b"same"[..], "b.png", none).await.unwrap();
        assert_eq!(first.id, second.id);

        // Same bytes, different extension: a distinct id
        let other = service.create(&b"same"[..], "a.gif", none).await.unwrap();
        assert_ne!(first.id, other.id);
        assert_eq!(first.id.digest(), other.id.digest());
    }

    #[tokio::test]
    async fn test_empty_original_and_missing_extension() {
        let (service, _dir) = service().await;
        let none: Option<(&[u8], &str)> = None;

        let record = service.create(&b""[..], "README", none).await.unwrap();
        assert_eq!(record.length, 0);
        assert_eq!(record.id.extension(), FALLBACK_EXTENSION);
        assert_eq!(record.content_type, "application/octet-stream");
        assert!(read_all(&service, Namespace::Original, &record.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_draft_without_original_commits_nothing() {
        let (service, _dir) = service().await;

        let mut draft = service.draft();
        draft.thumbnail(&b"orphan"[..], "t.png").await.unwrap();
        let err = draft.finish().await.unwrap_err();
        assert!(matches!(err, MediaError::Validation(_)));
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);

        let mut entries = tokio::fs::read_dir(service.store().root().join("thumbnail"))
            .await
            .unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let (service, _dir) = service().await;
        let id = BlobId::parse("abcdef.jpg").unwrap();

        let err = service.read(Namespace::Original, &id).await.err().unwrap();
        assert!(matches!(err, MediaError::Store(StoreError::NotFound(_))));
        assert!(err.to_string().starts_with("Blob not found"));
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_import_local_paths() {
        let (service, dir) = service().await;
        let path = dir.path().join("clip.mp4");
        tokio::fs::write(&path, b"frames").await.unwrap();

        let record = service.import(&path, None).await.unwrap();
        assert_eq!(record.id.extension(), "mp4");
        assert_eq!(record.content_type, "video/mp4");

        let missing = service.import(&dir.path().join("nope.jpg"), None).await;
        assert!(matches!(missing, Err(MediaError::Validation(_))));
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("a.JPEG"), "jpeg");
        assert_eq!(extension_of("archive.tar.gz"), "gz");
        assert_eq!(extension_of("noext"), "bin");
        assert_eq!(extension_of(".hidden"), "bin");
        assert_eq!(extension_of("weird.ex-t"), "bin");
        assert_eq!(extension_of(""), "bin");
    }
}
