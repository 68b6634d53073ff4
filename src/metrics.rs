//! Prometheus metrics collection for kvsyncd.
//!
//! Provides observability via Prometheus metrics exposed on an HTTP
//! endpoint: a `lazy_static!` global `REGISTRY` with labels for the
//! sync/KV domain (connections, rooms, frames, KVLog compactions).

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry for all metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    // ========================================================================
    // Counters (monotonic increasing)
    // ========================================================================

    /// Total sync frames broadcast to connections.
    pub static ref FRAMES_SENT: IntCounter = IntCounter::new(
        "kvsync_frames_sent_total",
        "Total sync protocol frames sent"
    ).unwrap();

    /// Total bytes sent over sync WebSocket connections.
    pub static ref BYTES_SENT: IntCounter = IntCounter::new(
        "kvsync_bytes_sent_total",
        "Total bytes sent over sync connections"
    ).unwrap();

    /// Total bytes received over sync WebSocket connections.
    pub static ref BYTES_RECEIVED: IntCounter = IntCounter::new(
        "kvsync_bytes_received_total",
        "Total bytes received over sync connections"
    ).unwrap();

    /// Connections closed with 4004 (unknown room).
    pub static ref UNKNOWN_ROOM_CLOSED: IntCounter = IntCounter::new(
        "kvsync_unknown_room_closed_total",
        "Connections closed due to an unresolvable room"
    ).unwrap();

    /// KVLog compaction passes run across all rooms.
    pub static ref KVLOG_COMPACTIONS: IntCounter = IntCounter::new(
        "kvsync_kvlog_compactions_total",
        "KVLog compaction passes run"
    ).unwrap();

    /// Errors by subsystem error code, labeled the way the reference
    /// daemon's `error_code()` methods feed per-kind counters.
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("kvsync_errors_total", "Errors by subsystem error code"),
        &["code"],
    ).unwrap();

    // ========================================================================
    // Gauges (can increase/decrease)
    // ========================================================================

    /// Currently open sync connections.
    pub static ref OPEN_CONNECTIONS: IntGauge = IntGauge::new(
        "kvsync_open_connections",
        "Currently open sync WebSocket connections"
    ).unwrap();

    /// Active rooms (at least one connected peer).
    pub static ref ACTIVE_ROOMS: IntGauge = IntGauge::new(
        "kvsync_active_rooms",
        "Rooms with at least one connected peer"
    ).unwrap();

    /// Awareness states currently advertised across all rooms.
    pub static ref AWARENESS_STATES: IntGauge = IntGauge::new(
        "kvsync_awareness_states",
        "Awareness states currently advertised"
    ).unwrap();
}

/// Initialize the Prometheus metrics registry.
///
/// Idempotent: safe to call more than once (tests and `main` both call it).
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        REGISTRY.register(Box::new(FRAMES_SENT.clone())).unwrap();
        REGISTRY.register(Box::new(BYTES_SENT.clone())).unwrap();
        REGISTRY
            .register(Box::new(BYTES_RECEIVED.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(UNKNOWN_ROOM_CLOSED.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(KVLOG_COMPACTIONS.clone()))
            .unwrap();
        REGISTRY.register(Box::new(ERRORS_TOTAL.clone())).unwrap();
        REGISTRY
            .register(Box::new(OPEN_CONNECTIONS.clone()))
            .unwrap();
        REGISTRY.register(Box::new(ACTIVE_ROOMS.clone())).unwrap();
        REGISTRY
            .register(Box::new(AWARENESS_STATES.clone()))
            .unwrap();
    });
}

/// Record an error by its stable code (see `error_code()` on the
/// per-subsystem error enums in [`crate::error`]).
pub fn record_error(code: &str) {
    ERRORS_TOTAL.with_label_values(&[code]).inc();
}

/// Gather all metrics and encode them in Prometheus text format.
///
/// Returns a string suitable for HTTP response on `/metrics`.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_error_increments_labeled_counter() {
        init();
        let before = ERRORS_TOTAL.with_label_values(&["room_not_found"]).get();
        record_error("room_not_found");
        let after = ERRORS_TOTAL.with_label_values(&["room_not_found"]).get();
        assert_eq!(after, before + 1);
    }
}
