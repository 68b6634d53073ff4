//! Unified error handling for kvsyncd.
//!
//! One `thiserror` enum per subsystem, each with an `error_code()` for
//! metrics labeling, rather than one monolithic error type.

use thiserror::Error;

/// Errors from the per-room sync connection handler (§4.6, §7).
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room not found: {0}")]
    NotFound(String),

    #[error("send error: {0}")]
    Send(String),

    #[error("transport error: {0}")]
    Transport(#[from] kvsync_proto::ProtocolError),
}

impl RoomError {
    /// Stable error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "room_not_found",
            Self::Send(_) => "send_error",
            Self::Transport(_) => "transport_error",
        }
    }

    /// WebSocket close code this error maps to, where one applies (§6
    /// "close code 4004").
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::NotFound(_) => Some(4004),
            _ => None,
        }
    }
}

/// Result type for room connection handlers.
pub type RoomResult<T> = Result<T, RoomError>;

/// Errors from Workspace Client construction and extension lifecycle
/// (§4.8, §7 "Extension factory failure" / "Extension destroy failure").
///
/// `Clone` lets [`crate::workspace::WorkspaceClient`] cache the settled
/// factory results once and hand the same errors to both `when_synced`
/// and `destroy` without re-awaiting the underlying `JoinHandle`s (which
/// can only be awaited once).
#[derive(Debug, Clone, Error)]
pub enum WorkspaceError {
    #[error("extension {0} failed to initialize: {1}")]
    ExtensionInit(String, String),

    #[error("extension {0} failed to destroy: {1}")]
    ExtensionDestroy(String, String),
}

impl WorkspaceError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ExtensionInit(_, _) => "extension_init_failed",
            Self::ExtensionDestroy(_, _) => "extension_destroy_failed",
        }
    }
}

/// Result type for whenSynced-style readiness futures.
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_error_codes() {
        assert_eq!(
            RoomError::NotFound("blog".into()).error_code(),
            "room_not_found"
        );
        assert_eq!(
            RoomError::NotFound("blog".into()).close_code(),
            Some(4004)
        );
    }

    #[test]
    fn workspace_error_codes() {
        assert_eq!(
            WorkspaceError::ExtensionInit("awareness".into(), "boom".into()).error_code(),
            "extension_init_failed"
        );
    }
}
