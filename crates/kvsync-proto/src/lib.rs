//! # kvsync-proto
//!
//! Framed WebSocket wire protocol for kvsync: the varuint-prefixed
//! SYNC/AWARENESS/AUTH/QUERY_AWARENESS message framing (§4.5), plus
//! WebSocket upgrade validation for the `/sync/{room}` endpoint (§6).
//!
//! This crate is wire-only: it has no opinion about CRDT semantics. SYNC
//! frames carry opaque bytes produced and consumed by whatever CRDT
//! runtime the embedding application wires in; this crate only knows how
//! to split a byte stream into frames and frames into their sub-message
//! tags.
//!
//! ## Quick start
//!
//! ```rust
//! use kvsync_proto::frame::{Frame, SyncMessage, SyncSubType};
//!
//! let frame = Frame::Sync(SyncMessage::new(SyncSubType::Step1, vec![1, 2, 3]));
//! let bytes = frame.encode();
//! let decoded = Frame::decode(&bytes).expect("valid frame");
//! assert_eq!(decoded, frame);
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;
pub mod frame;
#[cfg(feature = "tokio")]
pub mod transport;
#[cfg(feature = "tokio")]
pub mod websocket;

pub use error::{ProtocolError, Result};
pub use frame::{read_varuint, write_varuint, Frame, MessageType, SyncMessage, SyncSubType};
#[cfg(feature = "tokio")]
pub use transport::FrameTransport;
#[cfg(feature = "tokio")]
pub use websocket::{
    build_handshake_response, extract_room, validate_handshake, HandshakeResult, WebSocketConfig,
};
