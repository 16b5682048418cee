//! Media Sync Server Library
//!
//! Content-addressed media storage that replicates itself to peer nodes.
//! The server binary is in main.rs.
//!
//! # Modules
//!
//! - `storage`: Blob store with atomic, write-once keys
//! - `media`: Upload handling and content ids
//! - `sync`: Peer protocol, sessions and the push router
//! - `routes`: HTTP API

pub mod config;
pub mod error;
pub mod media;
pub mod routes;
pub mod state;
pub mod storage;
pub mod sync;
