//! Error types for the CRDT runtime port, KVLog, and row projection.
//!
//! Per the storage-layer contract, operations here are infallible once a
//! [`crate::document::CrdtDoc`] exists — `KvLogError` has no live variants
//! today but is kept as a typed alias so call sites never reach for
//! `unwrap()` if a failure mode is added later (e.g. a backing runtime that
//! can report a corrupted operation log).

use thiserror::Error;

/// Errors from KVLog and Row Projection operations.
///
/// `#[non_exhaustive]` because the reference in-memory runtime never
/// produces one of these; a real CRDT engine behind [`crate::document::CrdtDoc`]
/// may.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KvLogError {
    /// The backing CRDT runtime reported a failure applying an operation.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Result type for KVLog / Row Projection / Table operations.
pub type Result<T, E = KvLogError> = std::result::Result<T, E>;
