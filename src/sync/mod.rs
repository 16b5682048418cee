//! Peer-to-peer blob synchronization
//!
//! Nodes announce themselves to each other over long-lived TCP links. A node
//! in push mode streams its blobs to every peer that announces to it, and
//! again whenever new media is uploaded. Any node can also be told to push
//! everything to a given address on demand.

pub mod protocol;
mod receiver;
mod registry;
mod router;
mod session;
mod types;

pub use registry::PeerRegistry;
pub use router::{RouterOptions, SyncRouter};
pub use session::SyncSession;
pub use types::*;
