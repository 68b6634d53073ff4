//! Error types for the sync wire protocol: frame decoding and
//! WebSocket handshake validation.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Top-level protocol errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// I/O error during reading or writing a frame.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The buffer ended before a varuint or payload finished decoding.
    #[error("frame truncated: expected at least {expected} more byte(s)")]
    Truncated {
        /// Minimum number of additional bytes that were required.
        expected: usize,
    },

    /// A varuint used more than 10 continuation bytes (would overflow u64).
    #[error("varuint too large to fit in a u64")]
    VarintOverflow,

    /// The leading message-type byte did not match SYNC/AWARENESS/AUTH/
    /// QUERY_AWARENESS (§4.5).
    #[error("unknown message type code: {0}")]
    UnknownMessageType(u64),

    /// A SYNC frame's nested sub-message tag did not match step1/step2/update.
    #[error("unknown sync sub-message code: {0}")]
    UnknownSyncSubType(u64),

    /// A WebSocket upgrade request failed origin or subprotocol validation.
    #[error("WebSocket handshake rejected: {0}")]
    HandshakeRejected(String),
}

impl ProtocolError {
    /// Stable label for metrics, independent of the `Display` message's
    /// interpolated fields (mirrors the ambient error taxonomy's
    /// `error_code()` convention).
    pub fn error_code(&self) -> &'static str {
        match self {
            ProtocolError::Io(_) => "io",
            ProtocolError::Truncated { .. } => "truncated_frame",
            ProtocolError::VarintOverflow => "varint_overflow",
            ProtocolError::UnknownMessageType(_) => "unknown_message_type",
            ProtocolError::UnknownSyncSubType(_) => "unknown_sync_subtype",
            ProtocolError::HandshakeRejected(_) => "handshake_rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_is_stable_regardless_of_payload() {
        let a = ProtocolError::UnknownMessageType(7);
        let b = ProtocolError::UnknownMessageType(99);
        assert_eq!(a.error_code(), b.error_code());
    }

    #[test]
    fn display_includes_details() {
        let err = ProtocolError::Truncated { expected: 3 };
        assert!(format!("{err}").contains('3'));
    }
}
