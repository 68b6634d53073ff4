//! WebSocket upgrade handling for the sync protocol (component C8 seam).
//!
//! Connections speak to `/sync/{room}`; this module validates the upgrade
//! request (origin, CORS) and extracts the room name from the path. The
//! codec itself (frame types, varuint) lives in [`crate::frame`].

use std::fmt;
#[cfg(feature = "tokio")]
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
#[cfg(feature = "tokio")]
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Configuration for sync WebSocket connections: origin validation and CORS
/// headers. There is no subprotocol negotiation — room selection travels in
/// the URL path instead (§6 "URL path `/sync/{room}`").
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// List of allowed origin URLs (empty allows all).
    pub allowed_origins: Vec<String>,
    /// Whether an Origin header is required.
    pub require_origin: bool,
    /// Whether to add CORS headers to responses.
    pub enable_cors: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            require_origin: false,
            enable_cors: true,
        }
    }
}

impl WebSocketConfig {
    /// Production configuration requiring origin validation.
    pub fn production() -> Self {
        Self {
            allowed_origins: Vec::new(),
            require_origin: true,
            enable_cors: true,
        }
    }

    /// Development configuration with permissive localhost origins.
    pub fn development() -> Self {
        Self {
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8080".to_string(),
                "http://127.0.0.1:3000".to_string(),
                "http://127.0.0.1:8080".to_string(),
            ],
            require_origin: false,
            enable_cors: true,
        }
    }
}

/// Result of WebSocket handshake validation.
#[derive(Debug)]
#[non_exhaustive]
pub enum HandshakeResult {
    /// Handshake accepted.
    Accept {
        /// The client's origin, if provided.
        origin: Option<String>,
    },
    /// Handshake rejected with error details.
    Reject {
        /// HTTP status code to return.
        status: u16,
        /// Human-readable rejection reason.
        reason: String,
    },
}

impl fmt::Display for HandshakeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeResult::Accept { origin } => {
                write!(f, "Accept")?;
                if let Some(orig) = origin {
                    write!(f, " (origin: {})", orig)?;
                }
                Ok(())
            }
            HandshakeResult::Reject { status, reason } => {
                write!(f, "Reject {} - {}", status, reason)
            }
        }
    }
}

/// Extract the room name from a `/sync/{room}` request path. Returns
/// `None` for any path that doesn't match (the caller closes with 4004
/// per §6/§4.6).
pub fn extract_room(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/sync/")?;
    let room = rest.split('/').next().unwrap_or("");
    if room.is_empty() {
        None
    } else {
        Some(room.to_string())
    }
}

/// Validate a WebSocket upgrade request against the configuration.
#[cfg(feature = "tokio")]
pub fn validate_handshake(req: &Request, config: &WebSocketConfig) -> HandshakeResult {
    let origin = req
        .headers()
        .get("Origin")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if config.require_origin && origin.is_none() {
        return HandshakeResult::Reject {
            status: 403,
            reason: "Origin header required".to_string(),
        };
    }

    if !config.allowed_origins.is_empty() {
        if let Some(ref origin_value) = origin {
            if !config
                .allowed_origins
                .iter()
                .any(|allowed| allowed == origin_value)
            {
                return HandshakeResult::Reject {
                    status: 403,
                    reason: format!("Origin '{}' not allowed", origin_value),
                };
            }
        }
    }

    HandshakeResult::Accept { origin }
}

/// Build an HTTP response for a WebSocket handshake result.
#[cfg(feature = "tokio")]
#[allow(clippy::result_large_err)]
pub fn build_handshake_response(
    result: &HandshakeResult,
    config: &WebSocketConfig,
) -> Result<Response, ErrorResponse> {
    match result {
        HandshakeResult::Accept { origin } => {
            let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);

            if config.enable_cors {
                if let Some(ref origin_value) = origin {
                    builder = builder
                        .header("Access-Control-Allow-Origin", origin_value.as_str())
                        .header("Access-Control-Allow-Credentials", "true")
                        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
                        .header(
                            "Access-Control-Allow-Headers",
                            "Content-Type, Authorization",
                        );
                }
            }

            builder
                .body(())
                .map_err(|e| ErrorResponse::new(Some(format!("Failed to build response: {}", e))))
        }
        HandshakeResult::Reject { status, reason } => Err(ErrorResponse::new(Some(format!(
            "HTTP {}: {}",
            status, reason
        )))),
    }
}
