//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early, before
//! binding any listener.

use super::Config;
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("server.name is required")]
    MissingServerName,
    #[error("server.replica_id must be nonzero")]
    ZeroReplicaId,
    #[error("rooms.{0}.resolution must be \"positional\" or \"lww\", got {1:?}")]
    InvalidResolution(String, String),
    #[error("rooms.{0}.peers[{1}] must start with \"ws://\" or \"wss://\", got {2:?}")]
    InvalidPeerUrl(String, usize, String),
    #[error("reconnect.initial_ms must be <= reconnect.max_ms (got {0} > {1})")]
    BackoffOutOfOrder(u64, u64),
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.name.is_empty() {
        errors.push(ValidationError::MissingServerName);
    }
    if config.server.replica_id == 0 {
        errors.push(ValidationError::ZeroReplicaId);
    }

    for (room, room_config) in &config.rooms {
        if room_config.resolution != "positional" && room_config.resolution != "lww" {
            errors.push(ValidationError::InvalidResolution(
                room.clone(),
                room_config.resolution.clone(),
            ));
        }
        for (idx, peer) in room_config.peers.iter().enumerate() {
            if !peer.starts_with("ws://") && !peer.starts_with("wss://") {
                errors.push(ValidationError::InvalidPeerUrl(
                    room.clone(),
                    idx,
                    peer.clone(),
                ));
            }
        }
    }

    if config.reconnect.initial_ms > config.reconnect.max_ms {
        errors.push(ValidationError::BackoffOutOfOrder(
            config.reconnect.initial_ms,
            config.reconnect.max_ms,
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
