//! Peer registry
//!
//! Tracks which peers are currently connected, keyed by the inbound
//! connection that announced them. Only the router task mutates it; readers
//! get a consistent snapshot.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::types::{ConnectionId, PeerTarget};

/// Connected peer targets
#[derive(Default)]
pub struct PeerRegistry {
    connections: RwLock<HashMap<ConnectionId, PeerTarget>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn insert(&self, connection: ConnectionId, target: PeerTarget) {
        self.connections.write().insert(connection, target);
    }

    pub(super) fn remove(&self, connection: ConnectionId) -> Option<PeerTarget> {
        self.connections.write().remove(&connection)
    }

    /// Snapshot of connected targets, one entry per `host:port`
    pub fn targets(&self) -> Vec<PeerTarget> {
        let connections = self.connections.read();
        let mut targets: Vec<PeerTarget> = Vec::with_capacity(connections.len());

        for target in connections.values() {
            if !targets.iter().any(|t| t.address() == target.address()) {
                targets.push(target.clone());
            }
        }

        targets.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        targets
    }

    /// Whether any live connection still reaches `address`
    pub fn contains_address(&self, address: &str) -> bool {
        self.connections
            .read()
            .values()
            .any(|target| target.address() == address)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}
