//! CRDT document port (component C1 extension, §6 "CRDT Runtime port
//! (consumed)"): bulk state exchange over a whole document, as opposed to
//! the per-sequence primitives in [`crate::runtime`].
//!
//! Like the rest of the runtime port, this is an external collaborator in
//! production — a real deployment swaps in a genuine CRDT engine (e.g.
//! `yrs`) that actually computes minimal state-vector diffs. [`MemDocument`]
//! is the reference implementation this workspace tests against: it tracks
//! applied update blobs by content rather than performing real merge
//! semantics, which suffices for the Sync Server mechanics this core
//! specifies (step-1/step-2 handshake shape, echo suppression, broadcast
//! fan-out) without requiring a full CRDT engine to exercise them.

use std::cell::RefCell;

use crate::runtime::Origin;

/// Bulk state exchange for a whole document (§6 `encode_state_as_update`,
/// `apply_update`).
pub trait CrdtDoc {
    /// Encode the full current state as an opaque update blob (used to
    /// answer a peer's SYNC step-1 with SYNC step-2, §4.5).
    fn encode_state_as_update(&self) -> Vec<u8>;

    /// Apply an update blob received from a peer or produced locally.
    /// Returns `true` if the update changed local state (used to decide
    /// whether a SYNC reply has anything worth sending, §4.6).
    fn apply_update(&self, update: &[u8], origin: Origin) -> bool;

    /// Register a callback invoked with every applied update and the
    /// origin that produced it, for the Sync Server's broadcast listener
    /// (§4.6 "install a document-update listener").
    fn observe_updates(&self, f: Box<dyn Fn(&[u8], Origin) + Send>) -> SubscriptionId;

    /// Stop receiving update notifications.
    fn unobserve_updates(&self, id: SubscriptionId);

    /// Release any resources held by the document (§6 "new Document(guid,
    /// { gc }), destroy()"). [`MemDocument`] holds nothing beyond its own
    /// memory, so this is a no-op kept for interface parity with a real
    /// CRDT engine that would free native-side state here.
    fn destroy(&self) {}

    /// The GUID this document was constructed with (§4.8 point 1, §4.9).
    fn guid(&self) -> &str;

    /// Whether garbage collection of superseded state is enabled. A real
    /// CRDT engine uses this to decide whether to keep tombstones/old
    /// values around; disabled when callers need full revision history
    /// (§4.8 point 1: "GC is disabled when revision history is
    /// required").
    fn gc_enabled(&self) -> bool;
}

/// Handle to an active `observe_updates` registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type UpdateObserver = Box<dyn Fn(&[u8], Origin) + Send>;

struct Inner {
    /// Applied update blobs, in application order. A real CRDT engine
    /// would instead hold merged state plus a state vector; this reference
    /// implementation keeps the raw blobs so `encode_state_as_update` can
    /// replay them and so duplicate application is detectable by content.
    log: Vec<Vec<u8>>,
    next_sub: u64,
    observers: Vec<(u64, UpdateObserver)>,
}

/// Reference in-memory [`CrdtDoc`]. See module docs for the simplification
/// this makes relative to a real CRDT engine.
pub struct MemDocument {
    guid: String,
    gc: bool,
    inner: RefCell<Inner>,
}

impl MemDocument {
    /// `guid` is the `{id}-{epoch}` document namespace (§4.8 point 1,
    /// §4.9); `gc` matches `new Document(guid, { gc })`'s `gc` option —
    /// pass `false` when the caller needs full revision history.
    pub fn new(guid: impl Into<String>, gc: bool) -> Self {
        Self {
            guid: guid.into(),
            gc,
            inner: RefCell::new(Inner {
                log: Vec::new(),
                next_sub: 1,
                observers: Vec::new(),
            }),
        }
    }
}

impl CrdtDoc for MemDocument {
    fn encode_state_as_update(&self) -> Vec<u8> {
        let inner = self.inner.borrow();
        let mut buf = Vec::new();
        for blob in &inner.log {
            kvsync_proto::write_varuint(&mut buf, blob.len() as u64);
            buf.extend_from_slice(blob);
        }
        buf
    }

    fn apply_update(&self, update: &[u8], origin: Origin) -> bool {
        if update.is_empty() {
            return false;
        }
        {
            let mut inner = self.inner.borrow_mut();
            if inner.log.iter().any(|blob| blob == update) {
                return false;
            }
            inner.log.push(update.to_vec());
        }
        let inner = self.inner.borrow();
        for (_, observer) in &inner.observers {
            observer(update, origin);
        }
        true
    }

    fn observe_updates(&self, f: UpdateObserver) -> SubscriptionId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_sub;
        inner.next_sub += 1;
        inner.observers.push((id, f));
        SubscriptionId(id)
    }

    fn unobserve_updates(&self, id: SubscriptionId) {
        let mut inner = self.inner.borrow_mut();
        inner.observers.retain(|(sub_id, _)| *sub_id != id.0);
    }

    fn guid(&self) -> &str {
        &self.guid
    }

    fn gc_enabled(&self) -> bool {
        self.gc
    }
}
