//! Inbound sync connections
//!
//! Every accepted connection introduces itself with `hello`. Announce links
//! register the dialer as a connected peer until the socket closes; transfer
//! connections serve one sync session against the local store.

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::storage::{BlobKey, BlobStore, Namespace};

use super::protocol::{self, Frame, Message, ProtocolError, Purpose, SyncCodec};
use super::router::RouterCommand;
use super::types::{ConnectionId, PeerTarget};

/// Time a new connection gets to send its `hello`
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept sync connections until the listener fails permanently
pub(super) async fn accept_loop(listener: TcpListener, inbound: Inbound) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    if let Err(e) = inbound.handle(stream, remote).await {
                        tracing::warn!(remote = %remote, error = %e, "Inbound sync connection failed");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept sync connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

// ============================================================================
// Inbound Handler
// ============================================================================

/// Shared context for inbound connections
#[derive(Clone)]
pub(super) struct Inbound {
    name: String,
    store: BlobStore,
    /// Longest a transfer may go without a frame
    idle_timeout: Duration,
    commands: mpsc::UnboundedSender<RouterCommand>,
}

impl Inbound {
    pub(super) fn new(
        name: impl Into<String>,
        store: BlobStore,
        idle_timeout: Duration,
        commands: mpsc::UnboundedSender<RouterCommand>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            idle_timeout,
            commands,
        }
    }

    async fn handle(&self, stream: TcpStream, remote: SocketAddr) -> Result<(), ProtocolError> {
        let mut framed = protocol::framed(stream);

        let hello = tokio::time::timeout(HELLO_TIMEOUT, protocol::recv_message(&mut framed))
            .await
            .map_err(|_| ProtocolError::Unexpected("silence instead of hello".to_string()))??;

        let (name, purpose, listen_port) = match hello {
            Message::Hello {
                name,
                purpose,
                listen_port,
            } => (name, purpose, listen_port),
            other => {
                return Err(ProtocolError::Unexpected(format!("{:?} before hello", other)));
            }
        };

        protocol::send_message(
            &mut framed,
            Message::Welcome {
                name: self.name.clone(),
            },
        )
        .await?;

        match purpose {
            Purpose::Announce => {
                self.hold_announce(framed, remote, name, listen_port).await;
                Ok(())
            }
            Purpose::Transfer => self.serve_transfer(framed, &name).await,
        }
    }

    /// Keep the dialer registered while its announce link stays open
    async fn hold_announce<T>(
        &self,
        mut framed: Framed<T, SyncCodec>,
        remote: SocketAddr,
        name: String,
        listen_port: Option<u16>,
    ) where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(port) = listen_port else {
            tracing::warn!(remote = %remote, name = %name, "Announce without a listen port ignored");
            return;
        };

        let mut target = PeerTarget::new(remote.ip().to_string(), port);
        if !name.is_empty() {
            target = target.with_name(name);
        }

        let connection = ConnectionId::new();
        let _presence = Presence::register(connection, target, self.commands.clone());

        // Nothing is expected on this link; it only has to stay open
        while let Some(frame) = framed.next().await {
            if let Err(e) = frame {
                tracing::debug!(remote = %remote, error = %e, "Announce link errored");
                break;
            }
        }
    }

    /// Answer one transfer session until `done` or hang-up
    async fn serve_transfer<T>(
        &self,
        mut framed: Framed<T, SyncCodec>,
        peer_name: &str,
    ) -> Result<(), ProtocolError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stored = 0usize;
        let mut rejected = 0usize;

        loop {
            let message = match self.next_frame(&mut framed).await {
                Some(Ok(Frame::Message(message))) => message,
                Some(Ok(Frame::Chunk(_))) => {
                    return Err(ProtocolError::Unexpected(
                        "data chunk outside a blob".to_string(),
                    ))
                }
                Some(Err(e)) => return Err(e),
                None => break,
            };

            match message {
                Message::Has { key } => {
                    let present = self.has(&key).await;
                    protocol::send_message(&mut framed, Message::HasReply { key, present })
                        .await?;
                }
                Message::Begin { key, length } => {
                    let reply = self.receive_blob(&mut framed, &key, length).await?;
                    match &reply {
                        Message::Stored { .. } => stored += 1,
                        _ => rejected += 1,
                    }
                    protocol::send_message(&mut framed, reply).await?;
                }
                Message::Done => break,
                other => {
                    return Err(ProtocolError::Unexpected(format!(
                        "{:?} in transfer session",
                        other
                    )))
                }
            }
        }

        tracing::info!(peer = %peer_name, stored, rejected, "Inbound sync session finished");
        Ok(())
    }

    /// Next frame of a transfer, failing once the sender goes quiet
    async fn next_frame<T>(
        &self,
        framed: &mut Framed<T, SyncCodec>,
    ) -> Option<Result<Frame, ProtocolError>>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::time::timeout(self.idle_timeout, framed.next()).await {
            Ok(frame) => frame,
            Err(_) => Some(Err(ProtocolError::Idle(self.idle_timeout))),
        }
    }

    async fn has(&self, raw_key: &str) -> bool {
        let Ok(key) = raw_key.parse::<BlobKey>() else {
            return false;
        };
        match self.store.has(&key).await {
            Ok(present) => present,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to check blob");
                false
            }
        }
    }

    /// Consume the chunks of one blob up to its `end` and commit it
    ///
    /// Returns the reply for the sender. Only connection-level failures are
    /// errors; a bad blob is drained and rejected so the session can go on.
    async fn receive_blob<T>(
        &self,
        framed: &mut Framed<T, SyncCodec>,
        raw_key: &str,
        length: u64,
    ) -> Result<Message, ProtocolError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let key = raw_key.parse::<BlobKey>();
        let mut failure: Option<String> = None;
        let mut writer = None;

        match &key {
            Ok(_) => match self.store.writer().await {
                Ok(w) => writer = Some(w),
                Err(e) => failure = Some(e.to_string()),
            },
            Err(e) => failure = Some(e.to_string()),
        }

        let mut received: u64 = 0;
        loop {
            match self.next_frame(framed).await {
                Some(Ok(Frame::Chunk(data))) => {
                    received += data.len() as u64;
                    if received > length && failure.is_none() {
                        failure = Some(format!("more than the announced {} bytes", length));
                        writer = None;
                    }
                    if let Some(w) = writer.as_mut() {
                        if let Err(e) = w.write(&data).await {
                            failure = Some(e.to_string());
                            writer = None;
                        }
                    }
                }
                Some(Ok(Frame::Message(Message::End { key: end_key }))) if end_key == raw_key => {
                    break
                }
                Some(Ok(Frame::Message(other))) => {
                    return Err(ProtocolError::Unexpected(format!(
                        "{:?} during blob transfer",
                        other
                    )))
                }
                Some(Err(e)) => return Err(e),
                None => return Err(ProtocolError::Closed),
            }
        }

        let reject = |reason: String| {
            tracing::warn!(key = %raw_key, reason = %reason, "Rejected incoming blob");
            Message::Rejected {
                key: raw_key.to_string(),
                reason,
            }
        };

        if let Some(reason) = failure {
            return Ok(reject(reason));
        }
        let (Ok(key), Some(writer)) = (key, writer) else {
            return Ok(reject("blob was not staged".to_string()));
        };
        if received != length {
            return Ok(reject(format!(
                "expected {} bytes, received {}",
                length, received
            )));
        }

        let staged = match writer.finish().await {
            Ok(staged) => staged,
            Err(e) => return Ok(reject(e.to_string())),
        };

        // Originals are addressed by their content; thumbnails only borrow the id
        if key.namespace == Namespace::Original && staged.digest() != key.id.digest() {
            return Ok(reject("content does not match its id".to_string()));
        }

        match staged.commit(&key).await {
            Ok(written) => {
                tracing::debug!(key = %key, length, written, "Stored incoming blob");
                Ok(Message::Stored {
                    key: raw_key.to_string(),
                })
            }
            Err(e) => Ok(reject(e.to_string())),
        }
    }
}

/// Registers a peer with the router for as long as it lives
struct Presence {
    connection: ConnectionId,
    commands: mpsc::UnboundedSender<RouterCommand>,
}

impl Presence {
    fn register(
        connection: ConnectionId,
        target: PeerTarget,
        commands: mpsc::UnboundedSender<RouterCommand>,
    ) -> Self {
        let _ = commands.send(RouterCommand::Connected { connection, target });
        Self {
            connection,
            commands,
        }
    }
}

impl Drop for Presence {
    fn drop(&mut self) {
        let _ = self.commands.send(RouterCommand::Disconnected {
            connection: self.connection,
        });
    }
}
