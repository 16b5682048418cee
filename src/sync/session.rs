//! Sync Session
//!
//! One outbound transfer of local blobs to a single peer. Keys are offered
//! one at a time; the next key starts only after the peer has answered for
//! the previous one, so memory use stays bounded by a single chunk.

use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::io::ReaderStream;

use crate::storage::{BlobKey, BlobStore, StoreError};

use super::protocol::{self, Frame, Message, ProtocolError, Purpose, SyncCodec, CHUNK_SIZE};
use super::types::{KeyFailure, PeerTarget, SyncError, SyncReport, SyncScope};

/// Framed connection to a peer's sync port
pub type PeerStream = Framed<TcpStream, SyncCodec>;

// ============================================================================
// Connection Helpers
// ============================================================================

/// Dial `peer`, send `hello` and wait for its `welcome`
///
/// Returns the open stream and the name the peer introduced itself with.
pub(super) async fn handshake(
    peer: &PeerTarget,
    hello: Message,
    timeout: Duration,
) -> Result<(PeerStream, String), SyncError> {
    let connect = TcpStream::connect((peer.host.as_str(), peer.port));
    let stream = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| SyncError::Timeout { peer: peer.clone() })?
        .map_err(|e| SyncError::Unreachable {
            peer: peer.clone(),
            reason: e.to_string(),
        })?;

    let mut framed = protocol::framed(stream);
    send_to(peer, &mut framed, hello).await?;

    match recv_from(peer, &mut framed, timeout).await? {
        Message::Welcome { name } => Ok((framed, name)),
        other => Err(unexpected(peer, &other)),
    }
}

async fn send_to(
    peer: &PeerTarget,
    framed: &mut PeerStream,
    message: Message,
) -> Result<(), SyncError> {
    protocol::send_message(framed, message)
        .await
        .map_err(|e| aborted(peer, e))
}

async fn recv_from(
    peer: &PeerTarget,
    framed: &mut PeerStream,
    timeout: Duration,
) -> Result<Message, SyncError> {
    match tokio::time::timeout(timeout, protocol::recv_message(framed)).await {
        Ok(Ok(message)) => Ok(message),
        Ok(Err(e)) => Err(aborted(peer, e)),
        Err(_) => Err(SyncError::Timeout { peer: peer.clone() }),
    }
}

fn aborted(peer: &PeerTarget, e: ProtocolError) -> SyncError {
    SyncError::Aborted {
        peer: peer.clone(),
        reason: e.to_string(),
    }
}

fn unexpected(peer: &PeerTarget, message: &Message) -> SyncError {
    SyncError::Aborted {
        peer: peer.clone(),
        reason: format!("unexpected reply {:?}", message),
    }
}

// ============================================================================
// Sync Session
// ============================================================================

/// Outbound transfer to one peer
pub struct SyncSession {
    peer: PeerTarget,
    store: BlobStore,
    local_name: String,
    timeout: Duration,
}

impl SyncSession {
    pub fn new(
        peer: PeerTarget,
        store: BlobStore,
        local_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            peer,
            store,
            local_name: local_name.into(),
            timeout,
        }
    }

    pub fn peer(&self) -> &PeerTarget {
        &self.peer
    }

    /// Connect, offer every key in `scope`, and report what happened
    ///
    /// Per-key problems (a rejected blob, a key deleted locally) are recorded
    /// in the report. Losing the connection fails the whole session.
    pub async fn run(self, scope: SyncScope) -> Result<SyncReport, SyncError> {
        let described = match &scope {
            SyncScope::Everything => "everything".to_string(),
            SyncScope::Keys(keys) => format!("{} keys", keys.len()),
        };
        tracing::info!(peer = %self.peer, scope = %described, "Starting sync session");

        let hello = Message::Hello {
            name: self.local_name.clone(),
            purpose: Purpose::Transfer,
            listen_port: None,
        };
        let (mut framed, remote_name) = handshake(&self.peer, hello, self.timeout).await?;
        tracing::debug!(peer = %self.peer, remote_name = %remote_name, "Peer accepted transfer");

        let mut report = SyncReport::new(self.peer.clone());

        match scope {
            SyncScope::Everything => {
                let mut keys = self.store.list("");
                while let Some(key) = keys.next().await {
                    let key = key.map_err(|e| self.store_error(e))?;
                    self.offer(&mut framed, &key, &mut report).await?;
                }
            }
            SyncScope::Keys(keys) => {
                for key in &keys {
                    self.offer(&mut framed, key, &mut report).await?;
                }
            }
        }

        send_to(&self.peer, &mut framed, Message::Done).await?;
        report.finished_at = Utc::now();

        tracing::info!(
            peer = %self.peer,
            sent = report.sent,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Sync session complete"
        );

        Ok(report)
    }

    /// Offer one key; stream it if the peer lacks it
    async fn offer(
        &self,
        framed: &mut PeerStream,
        key: &BlobKey,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let wire_key = key.to_string();

        send_to(&self.peer, framed, Message::Has { key: wire_key.clone() }).await?;
        match recv_from(&self.peer, framed, self.timeout).await? {
            Message::HasReply { key: k, present } if k == wire_key => {
                if present {
                    tracing::trace!(peer = %self.peer, key = %key, "Peer already has blob");
                    report.skipped += 1;
                    return Ok(());
                }
            }
            other => return Err(unexpected(&self.peer, &other)),
        }

        let reader = match self.store.get(key).await {
            Ok(reader) => reader,
            Err(StoreError::NotFound(_)) => {
                report.failed.push(KeyFailure {
                    key: key.clone(),
                    reason: "no longer stored locally".to_string(),
                });
                return Ok(());
            }
            Err(e) => return Err(self.store_error(e)),
        };

        let length = reader.len();
        send_to(
            &self.peer,
            framed,
            Message::Begin {
                key: wire_key.clone(),
                length,
            },
        )
        .await?;

        let mut chunks = ReaderStream::with_capacity(reader, CHUNK_SIZE);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| self.store_error(e.into()))?;
            framed
                .feed(Frame::Chunk(chunk))
                .await
                .map_err(|e| aborted(&self.peer, e))?;
        }

        send_to(&self.peer, framed, Message::End { key: wire_key.clone() }).await?;

        match recv_from(&self.peer, framed, self.timeout).await? {
            Message::Stored { key: k } if k == wire_key => {
                tracing::debug!(peer = %self.peer, key = %key, length, "Blob sent");
                report.sent += 1;
                Ok(())
            }
            Message::Rejected { key: k, reason } if k == wire_key => {
                tracing::warn!(peer = %self.peer, key = %key, reason = %reason, "Peer rejected blob");
                report.failed.push(KeyFailure {
                    key: key.clone(),
                    reason,
                });
                Ok(())
            }
            other => Err(unexpected(&self.peer, &other)),
        }
    }

    fn store_error(&self, e: StoreError) -> SyncError {
        SyncError::Store {
            peer: self.peer.clone(),
            reason: e.to_string(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BlobId, Namespace};
    use crate::sync::receiver::{accept_loop, Inbound};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn open_store(dir: &TempDir) -> BlobStore {
        BlobStore::open(dir.path()).await.unwrap()
    }

    /// Store `data` as an original (and optionally a thumbnail) under its content id
    async fn put_media(store: &BlobStore, data: &[u8], thumbnail: Option<&[u8]>) -> BlobId {
        let staged = store.stage(data).await.unwrap();
        let id = BlobId::new(staged.digest(), "jpg").unwrap();
        staged.commit(&BlobKey::original(id.clone())).await.unwrap();
        if let Some(thumb) = thumbnail {
            store.put(&BlobKey::thumbnail(id.clone()), thumb).await.unwrap();
        }
        id
    }

    async fn read_blob(store: &BlobStore, key: &BlobKey) -> Vec<u8> {
        let mut reader = store.get(key).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    /// Start a receiving peer; returns its target
    async fn spawn_peer(store: BlobStore) -> PeerTarget {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (commands, _rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(
            listener,
            Inbound::new("receiver", store, TIMEOUT, commands),
        ));
        PeerTarget::new("127.0.0.1", port).with_name("receiver")
    }

    #[tokio::test]
    async fn test_full_sweep_then_skip() {
        let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (store_a, store_b) = (open_store(&dir_a).await, open_store(&dir_b).await);
        let id = put_media(&store_a, b"original bytes", Some(b"thumb bytes")).await;
        let peer = spawn_peer(store_b.clone()).await;

        let report = SyncSession::new(peer.clone(), store_a.clone(), "sender", TIMEOUT)
            .run(SyncScope::Everything)
            .await
            .unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.skipped, 0);
        assert!(report.is_complete());

        assert_eq!(
            read_blob(&store_b, &BlobKey::original(id.clone())).await,
            b"original bytes"
        );
        assert_eq!(
            read_blob(&store_b, &BlobKey::thumbnail(id.clone())).await,
            b"thumb bytes"
        );

        let again = SyncSession::new(peer, store_a, "sender", TIMEOUT)
            .run(SyncScope::Everything)
            .await
            .unwrap();
        assert_eq!(again.sent, 0);
        assert_eq!(again.skipped, 2);
    }

    #[tokio::test]
    async fn test_keys_scope_sends_only_given_keys() {
        let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (store_a, store_b) = (open_store(&dir_a).await, open_store(&dir_b).await);
        let first = put_media(&store_a, b"first", None).await;
        let second = put_media(&store_a, b"second", None).await;
        let peer = spawn_peer(store_b.clone()).await;

        let report = SyncSession::new(peer, store_a, "sender", TIMEOUT)
            .run(SyncScope::keys([BlobKey::original(second.clone())]))
            .await
            .unwrap();
        assert_eq!(report.sent, 1);

        assert!(store_b.has(&BlobKey::original(second)).await.unwrap());
        assert!(!store_b.has(&BlobKey::original(first)).await.unwrap());
    }

    #[tokio::test]
    async fn test_large_blob_spans_many_chunks() {
        let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (store_a, store_b) = (open_store(&dir_a).await, open_store(&dir_b).await);
        let data: Vec<u8> = (0..(CHUNK_SIZE * 5 + 123)).map(|i| (i % 251) as u8).collect();
        let id = put_media(&store_a, &data, None).await;
        let peer = spawn_peer(store_b.clone()).await;

        SyncSession::new(peer, store_a, "sender", TIMEOUT)
            .run(SyncScope::Everything)
            .await
            .unwrap();

        assert_eq!(read_blob(&store_b, &BlobKey::original(id)).await, data);
    }

    #[tokio::test]
    async fn test_peer_rejects_original_with_wrong_digest() {
        let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (store_a, store_b) = (open_store(&dir_a).await, open_store(&dir_b).await);
        let forged = BlobKey::new(Namespace::Original, BlobId::parse("00ff.jpg").unwrap());
        store_a.put(&forged, &b"not matching"[..]).await.unwrap();
        let good = put_media(&store_a, b"fine", None).await;
        let peer = spawn_peer(store_b.clone()).await;

        let report = SyncSession::new(peer, store_a, "sender", TIMEOUT)
            .run(SyncScope::Everything)
            .await
            .unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key, forged);
        assert!(!store_b.has(&forged).await.unwrap());
        assert!(store_b.has(&BlobKey::original(good)).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_local_key_is_reported() {
        let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let (store_a, store_b) = (open_store(&dir_a).await, open_store(&dir_b).await);
        let peer = spawn_peer(store_b).await;
        let ghost: BlobKey = "original/abcd.jpg".parse().unwrap();

        let report = SyncSession::new(peer, store_a, "sender", TIMEOUT)
            .run(SyncScope::keys([ghost.clone()]))
            .await
            .unwrap();

        assert_eq!(report.sent, 0);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key, ghost);
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let peer = PeerTarget::new("127.0.0.1", port).with_name("gone");
        let err = SyncSession::new(peer.clone(), store, "sender", TIMEOUT)
            .run(SyncScope::Everything)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Unreachable { .. }));
        assert_eq!(err.peer(), &peer);
    }
}
