//! Sync wire protocol
//!
//! Frames are length-delimited (4-byte big-endian length prefix). The first
//! payload byte tags the frame:
//! - `0`: JSON control [`Message`]
//! - `1`: raw blob data chunk
//!
//! Transfer conversation (initiator → responder):
//! 1. `hello { purpose: "transfer" }` → `welcome`
//! 2. per key: `has` → `has_reply`; when absent, `begin`, data chunks,
//!    `end` → `stored` | `rejected`
//! 3. `done`
//!
//! An announce link sends `hello { purpose: "announce" }`, receives `welcome`
//! and then stays open. Closing it is the disconnect signal.

use std::io;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

/// Largest frame accepted on the wire
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Size of the data chunks a sender splits blobs into
pub const CHUNK_SIZE: usize = 64 * 1024;

const TAG_MESSAGE: u8 = 0;
const TAG_CHUNK: u8 = 1;

// ============================================================================
// Messages
// ============================================================================

/// Why a connection was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// Long-lived presence link; makes the dialer a connected peer
    Announce,
    /// One sync session streaming blobs
    Transfer,
}

/// Control messages
///
/// Keys travel as plain strings so a responder can reject a malformed key
/// without tearing down the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello {
        name: String,
        purpose: Purpose,
        /// Sync port the dialer accepts transfers on
        #[serde(default, skip_serializing_if = "Option::is_none")]
        listen_port: Option<u16>,
    },
    Welcome {
        name: String,
    },
    Has {
        key: String,
    },
    HasReply {
        key: String,
        present: bool,
    },
    Begin {
        key: String,
        length: u64,
    },
    End {
        key: String,
    },
    Stored {
        key: String,
    },
    Rejected {
        key: String,
        reason: String,
    },
    Done,
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Message),
    Chunk(Bytes),
}

// ============================================================================
// Error Types
// ============================================================================

/// Wire-level failures
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown frame tag: {0}")]
    UnknownTag(u8),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Unexpected {0}")]
    Unexpected(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Peer sent nothing for {0:?}")]
    Idle(Duration),
}

// ============================================================================
// Codec
// ============================================================================

/// Tagged frame codec over [`LengthDelimitedCodec`]
pub struct SyncCodec {
    inner: LengthDelimitedCodec,
}

impl SyncCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for SyncCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SyncCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let Some(mut payload) = self.inner.decode(src)? else {
            return Ok(None);
        };

        if payload.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }

        match payload.get_u8() {
            TAG_MESSAGE => Ok(Some(Frame::Message(serde_json::from_slice(&payload)?))),
            TAG_CHUNK => Ok(Some(Frame::Chunk(payload.freeze()))),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

impl Encoder<Frame> for SyncCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = match frame {
            Frame::Message(message) => {
                let json = serde_json::to_vec(&message)?;
                let mut buf = BytesMut::with_capacity(json.len() + 1);
                buf.put_u8(TAG_MESSAGE);
                buf.extend_from_slice(&json);
                buf
            }
            Frame::Chunk(data) => {
                let mut buf = BytesMut::with_capacity(data.len() + 1);
                buf.put_u8(TAG_CHUNK);
                buf.extend_from_slice(&data);
                buf
            }
        };

        self.inner.encode(payload.freeze(), dst)?;
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Wrap a byte stream in the sync codec
pub fn framed<T>(io: T) -> Framed<T, SyncCodec>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, SyncCodec::new())
}

/// Send one control message and flush
pub async fn send_message<T>(
    framed: &mut Framed<T, SyncCodec>,
    message: Message,
) -> Result<(), ProtocolError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(Frame::Message(message)).await
}

/// Receive the next frame, which must be a control message
pub async fn recv_message<T>(framed: &mut Framed<T, SyncCodec>) -> Result<Message, ProtocolError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(Frame::Message(message))) => Ok(message),
        Some(Ok(Frame::Chunk(_))) => Err(ProtocolError::Unexpected("data chunk".to_string())),
        Some(Err(e)) => Err(e),
        None => Err(ProtocolError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_json_shape() {
        let json = serde_json::to_value(Message::Has {
            key: "original/ab.jpg".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "has", "key": "original/ab.jpg"}));

        let hello = serde_json::to_value(Message::Hello {
            name: "node".to_string(),
            purpose: Purpose::Announce,
            listen_port: None,
        })
        .unwrap();
        assert_eq!(
            hello,
            serde_json::json!({"type": "hello", "name": "node", "purpose": "announce"})
        );
    }

    #[test]
    fn test_codec_message_and_chunk() {
        let mut codec = SyncCodec::new();
        let mut buf = BytesMut::new();

        let message = Message::Begin {
            key: "original/ab.jpg".to_string(),
            length: 3,
        };
        codec.encode(Frame::Message(message.clone()), &mut buf).unwrap();
        codec
            .encode(Frame::Chunk(Bytes::from_static(b"abc")), &mut buf)
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Message(message)));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Chunk(Bytes::from_static(b"abc")))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_codec_waits_for_full_frame() {
        let mut codec = SyncCodec::new();
        let mut full = BytesMut::new();
        codec.encode(Frame::Message(Message::Done), &mut full).unwrap();

        let mut partial = full.split_to(full.len() - 1);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.unsplit(full);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(Frame::Message(Message::Done)));
    }

    #[test]
    fn test_codec_rejects_unknown_tag() {
        let mut codec = SyncCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u8(9);
        buf.put_u8(0);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::UnknownTag(9))
        ));
    }

    #[test]
    fn test_codec_rejects_oversized_frame() {
        let mut codec = SyncCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LENGTH + 1) as u32);
        buf.put_u8(TAG_CHUNK);

        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::Io(_))));
    }

    #[tokio::test]
    async fn test_send_and_receive_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = framed(a);
        let mut right = framed(b);

        send_message(
            &mut left,
            Message::Welcome {
                name: "peer".to_string(),
            },
        )
        .await
        .unwrap();

        let received = recv_message(&mut right).await.unwrap();
        assert_eq!(
            received,
            Message::Welcome {
                name: "peer".to_string()
            }
        );

        drop(left);
        assert!(matches!(
            recv_message(&mut right).await,
            Err(ProtocolError::Closed)
        ));
    }
}
