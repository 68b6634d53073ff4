//! Sync Protocol runtime: the Sync Server (component C8) that terminates
//! `/sync/{room}` WebSocket connections and the Sync Client Provider
//! (component C9) that dials out to one as a reconnecting peer.
//!
//! Both live here rather than in `kvsync-proto` because they depend on the
//! CRDT runtime port (`kvsync-crdt`) in addition to the wire codec; the
//! codec itself stays domain-agnostic.

pub mod client;
pub mod server;

pub use client::SyncClient;
pub use server::{ConnectionId, SyncServer};
