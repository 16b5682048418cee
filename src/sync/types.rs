//! Sync data types
//!
//! Defines types for peer-to-peer blob synchronization including:
//! - Peer targets and sync policy
//! - Session scope and reports
//! - Router events and errors

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::BlobKey;

// ============================================================================
// Policy
// ============================================================================

/// How a node propagates its blobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Send blobs to every peer as soon as it connects
    Push,
    /// Only sync when explicitly asked
    #[default]
    Manual,
}

impl FromStr for SyncMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(SyncMode::Push),
            "" | "manual" | "pull" => Ok(SyncMode::Manual),
            other => Err(ParseError::SyncMode(other.to_string())),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Push => f.write_str("push"),
            SyncMode::Manual => f.write_str("manual"),
        }
    }
}

// ============================================================================
// Peer Target
// ============================================================================

/// Address and identity of a remote node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerTarget {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PeerTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// `host:port`, the identity used for session bookkeeping
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PeerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}@{}:{}", name, self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl FromStr for PeerTarget {
    type Err = ParseError;

    /// Parse `[name@]host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::PeerAddress(s.to_string());
        let s = s.trim();

        let (name, address) = match s.split_once('@') {
            Some((name, address)) if !name.is_empty() => (Some(name), address),
            Some(_) => return Err(invalid()),
            None => (None, s),
        };

        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;

        let target = PeerTarget::new(host, port);
        Ok(match name {
            Some(name) => target.with_name(name),
            None => target,
        })
    }
}

/// Opaque id of one inbound peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Which blobs a session offers to its peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    /// Sweep the whole local store
    Everything,
    /// Only these keys
    Keys(BTreeSet<BlobKey>),
}

impl SyncScope {
    pub fn keys(keys: impl IntoIterator<Item = BlobKey>) -> Self {
        SyncScope::Keys(keys.into_iter().collect())
    }

    /// Combine two pending scopes; a full sweep absorbs any key set
    pub fn merge(self, other: SyncScope) -> SyncScope {
        match (self, other) {
            (SyncScope::Keys(mut a), SyncScope::Keys(b)) => {
                a.extend(b);
                SyncScope::Keys(a)
            }
            _ => SyncScope::Everything,
        }
    }
}

/// A key the session could not deliver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFailure {
    pub key: BlobKey,
    pub reason: String,
}

/// Outcome of a finished session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub peer: PeerTarget,
    /// Blobs streamed and stored by the peer
    pub sent: usize,
    /// Blobs the peer already had
    pub skipped: usize,
    /// Blobs rejected by the peer or vanished locally
    pub failed: Vec<KeyFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    pub fn new(peer: PeerTarget) -> Self {
        let now = Utc::now();
        Self {
            peer,
            sent: 0,
            skipped: 0,
            failed: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    /// True if every candidate key is now on the peer
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ============================================================================
// Events
// ============================================================================

/// Notifications published by the sync router
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A peer announced itself on an inbound connection
    PeerConnected(PeerTarget),
    /// A peer's announce connection closed
    PeerDisconnected(PeerTarget),
    /// An outbound session ended
    SessionFinished {
        peer: PeerTarget,
        outcome: Result<SyncReport, SyncError>,
    },
}

// ============================================================================
// Error Types
// ============================================================================

/// Sync session error types
///
/// Carries strings rather than sources so events can be cloned to every
/// subscriber.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Peer {peer} unreachable: {reason}")]
    Unreachable { peer: PeerTarget, reason: String },

    #[error("Sync with {peer} aborted: {reason}")]
    Aborted { peer: PeerTarget, reason: String },

    #[error("Sync with {peer} timed out")]
    Timeout { peer: PeerTarget },

    #[error("Sync with {peer} cancelled")]
    Cancelled { peer: PeerTarget },

    #[error("Local store failed during sync with {peer}: {reason}")]
    Store { peer: PeerTarget, reason: String },

    #[error("Cannot announce to {peer}: not listening for sync connections")]
    NotListening { peer: PeerTarget },
}

impl SyncError {
    /// Peer the failed session was talking to
    pub fn peer(&self) -> &PeerTarget {
        match self {
            Self::Unreachable { peer, .. }
            | Self::Aborted { peer, .. }
            | Self::Timeout { peer }
            | Self::Cancelled { peer }
            | Self::Store { peer, .. }
            | Self::NotListening { peer } => peer,
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Unreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::Aborted { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotListening { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Errors parsing sync configuration values
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("unknown sync mode '{0}' (expected push or manual)")]
    SyncMode(String),

    #[error("invalid peer address '{0}' (expected [name@]host:port)")]
    PeerAddress(String),
}
