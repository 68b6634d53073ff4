//! Configuration type definitions.
//!
//! All the sub-config structs used by the top-level [`Config`].

use serde::Deserialize;
use std::collections::HashMap;

use super::defaults::{
    default_backoff_initial_ms, default_backoff_max_ms, default_listen_address,
    default_metrics_port, default_resolution, default_true,
};

/// Log output format, toggled at `tracing_subscriber` setup time between
/// pretty and JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Top-level configuration loaded from `config.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server identity and logging.
    pub server: ServerConfig,
    /// WebSocket listen configuration.
    #[serde(default)]
    pub listen: ListenConfig,
    /// Per-room schema and conflict-resolution configuration.
    #[serde(default)]
    pub rooms: HashMap<String, RoomConfig>,
    /// Persistence backend configuration.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Sync client reconnect policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Human-readable server name, used in logs and metrics labels.
    pub name: String,
    /// This replica's id, used as the LWW `by` field and echo-suppression
    /// origin seed (§4.1, §4.6).
    pub replica_id: u64,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Prometheus metrics HTTP port.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// WebSocket listener configuration (§6 "URL path `/sync/{room}`").
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Address to bind the sync WebSocket listener on.
    #[serde(default = "default_listen_address")]
    pub address: String,
    /// Whether an `Origin` header is required on upgrade (§4.6).
    #[serde(default)]
    pub require_origin: bool,
    /// Allow-list of origins; empty allows any.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            require_origin: false,
            allowed_origins: Vec::new(),
        }
    }
}

/// Per-room configuration: which KVLog conflict-resolution strategy its
/// tables use (§3 "Entity: KVLog", §9 "share an identical operation shape"),
/// and which remote servers to autoconnect a Sync Client Provider to
/// (§4.7).
#[derive(Debug, Clone, Deserialize)]
pub struct RoomConfig {
    /// `"positional"` or `"lww"`.
    #[serde(default = "default_resolution")]
    pub resolution: String,
    /// Outbound `ws://` or `wss://` URLs to dial a [`crate::sync::client::SyncClient`]
    /// for, one per remote peer sharing this room.
    #[serde(default)]
    pub peers: Vec<String>,
    /// When `true`, the room's Document is constructed with GC disabled so
    /// superseded state is retained (§4.8 point 1: "GC is disabled when
    /// revision history is required").
    #[serde(default)]
    pub retain_history: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            peers: Vec::new(),
            retain_history: false,
        }
    }
}

/// Persistence backend selection (§6 "Persistence port").
///
/// Only `"null"` (the in-memory, always-synced no-op) ships in this core;
/// concrete backends (filesystem, IndexedDB, etc.) are external and
/// degrade gracefully when none is configured.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Reconnect backoff policy for the Sync Client Provider (§4.7, §9 open
/// question: bounded exponential, full jitter).
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}
