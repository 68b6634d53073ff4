//! Sync-Aware Telemetry.
//!
//! Structured tracing spans carrying sync-protocol context, enabling
//! correlation of logs across a connection's handshake, message handling,
//! and close.

#![allow(dead_code)]

use std::time::Instant;
use tracing::{span, Level, Span};

/// Sync-specific trace context for structured logging.
#[derive(Debug, Clone, Default)]
pub struct SyncTraceContext {
    /// Room name this connection is joined to.
    pub room: Option<String>,
    /// Opaque connection identifier.
    pub connection_id: Option<u64>,
    /// Origin token used for echo suppression on this connection.
    pub origin: Option<u64>,
    /// This replica's id.
    pub replica_id: Option<u64>,
}

impl SyncTraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn with_connection_id(mut self, id: u64) -> Self {
        self.connection_id = Some(id);
        self
    }

    pub fn with_origin(mut self, origin: u64) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_replica_id(mut self, replica_id: u64) -> Self {
        self.replica_id = Some(replica_id);
        self
    }

    /// Create a tracing span from this context.
    pub fn into_span(self) -> Span {
        let room = self.room.as_deref().unwrap_or("unknown");
        span!(
            Level::INFO,
            "sync.connection",
            room = room,
            connection_id = self.connection_id,
            origin = self.origin,
            replica_id = self.replica_id,
        )
    }
}

/// Guard for timing frame handling and recording metrics on drop.
pub struct FrameTimer {
    label: String,
    start: Instant,
}

impl FrameTimer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Drop for FrameTimer {
    fn drop(&mut self) {
        tracing::trace!(
            label = %self.label,
            elapsed_secs = self.elapsed_secs(),
            "frame handled"
        );
    }
}

/// Create a span for a room-wide broadcast, recording its fan-out size.
pub fn create_broadcast_span(room: &str, recipients: usize) -> Span {
    span!(
        Level::DEBUG,
        "sync.broadcast",
        room = room,
        recipients = recipients,
    )
}
