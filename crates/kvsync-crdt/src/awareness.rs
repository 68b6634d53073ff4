//! Awareness (component C1 extension, §6, glossary "Awareness"): ephemeral
//! per-client presence state (cursors, names) that is never persisted.
//!
//! One instance lives per room (§4.6 "State per room: ... one shared
//! awareness instance"). Unlike [`crate::kvlog::KvLog`], awareness has no
//! conflict resolution: the latest state for a client id simply replaces
//! the previous one, and a `None` state means the client removed itself
//! (§4.6 "add on non-null state, remove on null").

use std::cell::RefCell;
use std::collections::HashMap;

use crate::runtime::Origin;

type ChangeObserver = Box<dyn Fn(&[u64], Origin) + Send>;

struct Inner {
    states: HashMap<u64, Vec<u8>>,
    next_sub: u64,
    observers: Vec<(u64, ChangeObserver)>,
}

/// Handle to an active `observe` registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwarenessSubscriptionId(u64);

/// Opaque per-client-id state table (§6 "Awareness: opaque state table").
pub struct Awareness {
    inner: RefCell<Inner>,
}

impl Default for Awareness {
    fn default() -> Self {
        Self::new()
    }
}

impl Awareness {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(Inner {
                states: HashMap::new(),
                next_sub: 1,
                observers: Vec::new(),
            }),
        }
    }

    /// Current states for every client id that has one.
    pub fn get_states(&self) -> HashMap<u64, Vec<u8>> {
        self.inner.borrow().states.clone()
    }

    /// Whether any client currently has advertised state.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().states.is_empty()
    }

    /// Encode a subset of client states for the wire (§4.5 AWARENESS
    /// payload). The reference encoding is a simple varuint-count, then
    /// per-entry `(client_id: u64 LE, len: varuint, state bytes)`, or
    /// `(client_id, 0)` for a removal — a real deployment's encoding is
    /// owned by the CRDT runtime; this is this workspace's own.
    pub fn encode_update(&self, client_ids: &[u64]) -> Vec<u8> {
        let inner = self.inner.borrow();
        let mut buf = Vec::new();
        kvsync_proto::write_varuint(&mut buf, client_ids.len() as u64);
        for id in client_ids {
            buf.extend_from_slice(&id.to_le_bytes());
            match inner.states.get(id) {
                Some(state) => {
                    kvsync_proto::write_varuint(&mut buf, (state.len() + 1) as u64);
                    buf.extend_from_slice(state);
                }
                None => kvsync_proto::write_varuint(&mut buf, 0),
            }
        }
        buf
    }

    /// Apply a decoded awareness update, setting or removing each client
    /// id's state. Returns the list of client ids that changed, for
    /// broadcasting and `controlled_client_ids` bookkeeping (§4.6).
    ///
    /// Malformed bytes return an empty list rather than an error: the
    /// wire tolerates malformed awareness frames without killing the
    /// connection (§7 "at the wire").
    pub fn apply_update(&self, bytes: &[u8], origin: Origin) -> Vec<u64> {
        self.apply_update_detailed(bytes, origin)
            .into_iter()
            .map(|(id, _present)| id)
            .collect()
    }

    /// Same as [`Self::apply_update`], but also reports whether each
    /// changed client id ended up present (`true`) or was removed
    /// (`false`) — the Sync Server needs this distinction to maintain
    /// `controlled_client_ids` ("add on non-null state, remove on null",
    /// §4.6).
    pub fn apply_update_detailed(&self, bytes: &[u8], origin: Origin) -> Vec<(u64, bool)> {
        let mut changed = Vec::new();
        let mut pos = 0usize;
        let Ok(count) = kvsync_proto::read_varuint(bytes, &mut pos) else {
            return changed;
        };
        let mut inner = self.inner.borrow_mut();
        for _ in 0..count {
            if pos + 8 > bytes.len() {
                break;
            }
            let mut id_bytes = [0u8; 8];
            id_bytes.copy_from_slice(&bytes[pos..pos + 8]);
            let client_id = u64::from_le_bytes(id_bytes);
            pos += 8;
            let Ok(len) = kvsync_proto::read_varuint(bytes, &mut pos) else {
                break;
            };
            let present = len != 0;
            if len == 0 {
                inner.states.remove(&client_id);
            } else {
                let len = (len - 1) as usize;
                if pos + len > bytes.len() {
                    break;
                }
                inner
                    .states
                    .insert(client_id, bytes[pos..pos + len].to_vec());
                pos += len;
            }
            changed.push((client_id, present));
        }
        drop(inner);
        if !changed.is_empty() {
            let ids: Vec<u64> = changed.iter().map(|(id, _)| *id).collect();
            self.notify(&ids, origin);
        }
        changed
    }

    /// Directly set a client id's state (used by the local peer rather
    /// than decoded off the wire).
    pub fn set_local_state(&self, client_id: u64, state: Vec<u8>, origin: Origin) {
        self.inner.borrow_mut().states.insert(client_id, state);
        self.notify(&[client_id], origin);
    }

    /// Remove states for the given client ids (§4.6 "Close:
    /// `remove_awareness_states(controlled_client_ids, origin=null)`").
    pub fn remove_states(&self, client_ids: &[u64], origin: Origin) {
        {
            let mut inner = self.inner.borrow_mut();
            for id in client_ids {
                inner.states.remove(id);
            }
        }
        if !client_ids.is_empty() {
            self.notify(client_ids, origin);
        }
    }

    /// Register a callback invoked with the client ids that changed and
    /// the origin of the change, for room broadcast (§4.6).
    pub fn observe(&self, f: ChangeObserver) -> AwarenessSubscriptionId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_sub;
        inner.next_sub += 1;
        inner.observers.push((id, f));
        AwarenessSubscriptionId(id)
    }

    pub fn unobserve(&self, id: AwarenessSubscriptionId) {
        let mut inner = self.inner.borrow_mut();
        inner.observers.retain(|(sub_id, _)| *sub_id != id.0);
    }

    fn notify(&self, client_ids: &[u64], origin: Origin) {
        let inner = self.inner.borrow();
        for (_, observer) in &inner.observers {
            observer(client_ids, origin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn set_then_get_states_roundtrips() {
        let awareness = Awareness::new();
        awareness.set_local_state(101, b"alice".to_vec(), Origin::LOCAL);
        assert_eq!(awareness.get_states().get(&101), Some(&b"alice".to_vec()));
    }

    #[test]
    fn encode_then_apply_update_roundtrips_on_another_instance() {
        let source = Awareness::new();
        source.set_local_state(101, b"alice".to_vec(), Origin::LOCAL);
        let encoded = source.encode_update(&[101]);

        let target = Awareness::new();
        let changed = target.apply_update(&encoded, Origin::new(9));
        assert_eq!(changed, vec![101]);
        assert_eq!(target.get_states().get(&101), Some(&b"alice".to_vec()));
    }

    #[test]
    fn apply_update_with_zero_length_state_removes_the_client() {
        let awareness = Awareness::new();
        awareness.set_local_state(101, b"alice".to_vec(), Origin::LOCAL);
        let encoded = awareness.encode_update(&[101]); // captures current state
        awareness.remove_states(&[101], Origin::LOCAL);
        assert!(awareness.is_empty());

        // Re-seed then remove via the wire encoding of an empty state.
        awareness.set_local_state(101, b"alice".to_vec(), Origin::LOCAL);
        let mut removal = Vec::new();
        kvsync_proto::write_varuint(&mut removal, 1);
        removal.extend_from_slice(&101u64.to_le_bytes());
        kvsync_proto::write_varuint(&mut removal, 0);
        awareness.apply_update(&removal, Origin::LOCAL);
        assert!(awareness.is_empty());
        let _ = encoded;
    }

    #[test]
    fn malformed_bytes_are_skipped_without_panicking() {
        let awareness = Awareness::new();
        let changed = awareness.apply_update(&[0x80], Origin::LOCAL); // truncated varuint
        assert!(changed.is_empty());
    }

    #[test]
    fn observe_receives_changed_ids_and_origin() {
        let awareness = Awareness::new();
        let seen = Rc::new(RefCell::new(None));
        let seen_clone = seen.clone();
        awareness.observe(Box::new(move |ids, origin| {
            *seen_clone.borrow_mut() = Some((ids.to_vec(), origin));
        }));
        awareness.set_local_state(5, b"x".to_vec(), Origin::new(3));
        assert_eq!(*seen.borrow(), Some((vec![5], Origin::new(3))));
    }

    #[test]
    fn remove_states_notifies_observers() {
        let awareness = Awareness::new();
        awareness.set_local_state(101, b"alice".to_vec(), Origin::LOCAL);
        let removed = Rc::new(RefCell::new(Vec::new()));
        let removed_clone = removed.clone();
        awareness.observe(Box::new(move |ids, _| {
            removed_clone.borrow_mut().extend_from_slice(ids);
        }));
        awareness.remove_states(&[101], Origin::LOCAL);
        assert_eq!(*removed.borrow(), vec![101]);
    }
}
