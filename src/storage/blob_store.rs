//! Blob Store
//!
//! Content-addressed blob storage on the local filesystem.
//!
//! Layout under the store root:
//! - `original/<id>` and `thumbnail/<id>`: committed, immutable blobs
//! - `.tmp/<uuid>`: staged writes, renamed into place on commit
//!
//! Every write goes through a staged temp file that is fsynced and then
//! renamed, so readers only ever observe complete blobs.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::types::{BlobId, BlobKey, Namespace, StoreError};

/// Directory (under the root) holding staged writes
const TEMP_DIR: &str = ".tmp";

/// Buffer size used when draining a source reader
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Blob Store
// ============================================================================

/// Filesystem blob store
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<BlobStoreInner>,
}

struct BlobStoreInner {
    root: PathBuf,
}

impl BlobStore {
    /// Open (or create) a store rooted at `root`
    ///
    /// Staged files left behind by an interrupted process are removed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();

        for namespace in Namespace::ALL {
            fs::create_dir_all(root.join(namespace.as_str())).await?;
        }

        let temp_dir = root.join(TEMP_DIR);
        fs::create_dir_all(&temp_dir).await?;

        let swept = sweep_temp_dir(&temp_dir).await?;
        if swept > 0 {
            tracing::info!(count = swept, root = %root.display(), "Removed stale staged blobs");
        }

        tracing::info!(root = %root.display(), "Blob store opened");

        Ok(Self {
            inner: Arc::new(BlobStoreInner { root }),
        })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Persist `source` under `key`
    ///
    /// Returns `false` when the key was already present; blobs are immutable,
    /// so the new copy is discarded.
    pub async fn put<R>(&self, key: &BlobKey, source: R) -> Result<bool, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let staged = self.stage(source).await?;
        staged.commit(key).await
    }

    /// Drain `source` into a staged temp file, hashing as it goes
    pub async fn stage<R>(&self, mut source: R) -> Result<StagedBlob, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let mut writer = self.writer().await?;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write(&buf[..n]).await?;
        }

        writer.finish().await
    }

    /// Open a staged writer for chunk-at-a-time writes
    pub async fn writer(&self) -> Result<BlobWriter, StoreError> {
        let path = self
            .inner
            .root
            .join(TEMP_DIR)
            .join(Uuid::new_v4().to_string());

        let file = File::create(&path).await?;

        Ok(BlobWriter {
            file,
            hasher: Sha256::new(),
            length: 0,
            temp: TempFile::new(path),
            store: self.clone(),
        })
    }

    /// Open a blob for reading
    pub async fn get(&self, key: &BlobKey) -> Result<BlobReader, StoreError> {
        let path = self.path_for(key);

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let length = file.metadata().await?.len();

        Ok(BlobReader { file, length })
    }

    /// Check whether a blob exists without reading it
    pub async fn has(&self, key: &BlobKey) -> Result<bool, StoreError> {
        match fs::metadata(self.path_for(key)).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Lazily enumerate keys whose text form starts with `prefix`
    ///
    /// An empty prefix lists the whole store. Order is unspecified.
    pub fn list(&self, prefix: &str) -> BoxStream<'static, Result<BlobKey, StoreError>> {
        let prefix = prefix.to_string();

        // Popped from the back, so reverse to visit namespaces in order
        let pending: Vec<Namespace> = Namespace::ALL
            .into_iter()
            .rev()
            .filter(|ns| {
                let dir_prefix = format!("{}/", ns);
                dir_prefix.starts_with(&prefix) || prefix.starts_with(&dir_prefix)
            })
            .collect();

        let state = ListState {
            root: self.inner.root.clone(),
            prefix,
            pending,
            current: None,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if state.current.is_none() {
                    let namespace = state.pending.pop()?;
                    match fs::read_dir(state.root.join(namespace.as_str())).await {
                        Ok(entries) => state.current = Some((namespace, entries)),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Some((Err(e.into()), state)),
                    }
                }

                let Some((namespace, entries)) = state.current.as_mut() else {
                    continue;
                };
                let namespace = *namespace;
                let next = entries.next_entry().await;

                match next {
                    Ok(Some(entry)) => {
                        let name = entry.file_name();
                        // Skip anything that is not a well-formed id
                        let Some(id) = name.to_str().and_then(|n| BlobId::parse(n).ok()) else {
                            continue;
                        };
                        let key = BlobKey::new(namespace, id);
                        if key.to_string().starts_with(&state.prefix) {
                            return Some((Ok(key), state));
                        }
                    }
                    Ok(None) => state.current = None,
                    Err(e) => {
                        state.current = None;
                        return Some((Err(e.into()), state));
                    }
                }
            }
        })
        .boxed()
    }

    fn path_for(&self, key: &BlobKey) -> PathBuf {
        self.inner
            .root
            .join(key.namespace.as_str())
            .join(key.id.as_str())
    }
}

struct ListState {
    root: PathBuf,
    prefix: String,
    pending: Vec<Namespace>,
    current: Option<(Namespace, fs::ReadDir)>,
}

// ============================================================================
// Staged Writes
// ============================================================================

/// In-progress write to a temp file
///
/// Dropping the writer before [`BlobWriter::finish`] removes the temp file.
pub struct BlobWriter {
    // Declared before `temp` so the handle closes before the file is removed
    file: File,
    hasher: Sha256,
    length: u64,
    temp: TempFile,
    store: BlobStore,
}

impl BlobWriter {
    /// Append a chunk
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.hasher.update(chunk);
        self.file.write_all(chunk).await?;
        self.length += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Flush to disk and hand over the staged file
    pub async fn finish(self) -> Result<StagedBlob, StoreError> {
        let BlobWriter {
            mut file,
            hasher,
            length,
            temp,
            store,
        } = self;

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        Ok(StagedBlob {
            temp,
            digest: hex::encode(hasher.finalize()),
            length,
            store,
        })
    }
}

/// Fully written blob waiting to be committed under a key
pub struct StagedBlob {
    temp: TempFile,
    digest: String,
    length: u64,
    store: BlobStore,
}

impl StagedBlob {
    /// Lowercase hex SHA-256 of the staged content
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Atomically move the staged file into place
    ///
    /// Returns `false` if `key` already existed, in which case the staged
    /// copy is discarded.
    pub async fn commit(mut self, key: &BlobKey) -> Result<bool, StoreError> {
        let target = self.store.path_for(key);

        if fs::metadata(&target).await.is_ok() {
            tracing::debug!(key = %key, "Blob already stored, discarding staged copy");
            return Ok(false);
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::rename(&self.temp.path, &target).await?;
        self.temp.disarm();

        tracing::debug!(key = %key, length = self.length, "Blob committed");

        Ok(true)
    }
}

/// Removes its path on drop unless disarmed
struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove staged blob");
            }
        }
    }
}

async fn sweep_temp_dir(dir: &Path) -> Result<usize, StoreError> {
    let mut count = 0;
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        fs::remove_file(entry.path()).await?;
        count += 1;
    }

    Ok(count)
}

// ============================================================================
// Reads
// ============================================================================

/// Single-pass reader over a stored blob
pub struct BlobReader {
    file: File,
    length: u64,
}

impl BlobReader {
    /// Blob size in bytes
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Adapt into a stream of byte chunks (e.g. for an HTTP body)
    pub fn into_stream(self) -> ReaderStream<Self> {
        ReaderStream::with_capacity(self, READ_BUFFER_SIZE)
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

// ============================================================================
// Tests
// ============================================================================
