//! KVLog: an append-and-cleanup key→value store over a CRDT ordered
//! sequence (component C3, §4.2).
//!
//! The positional ("rightmost-wins") and LWW ("last-write-wins") variants
//! share one generic implementation parameterized by a [`ResolutionStrategy`]
//! (§9 design note: "implement as a single generic wrapper"). Both variants
//! reduce to the same winner-selection fold: walk entries for a key and keep
//! the one with the greatest [`ResolutionStrategy::precedence`], breaking
//! ties (including the positional variant's *only* comparison) in favor of
//! the rightmost occurrence.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::clock::Clock;
use crate::runtime::mem::MemSequence;
use crate::runtime::{ItemId, Origin, OrderedSequence, SeqEvent};

/// Identifies the replica performing a write, used by the LWW variant's
/// `(ts, by)` ordering (§3 "Entity: KVLog Entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId(pub u64);

/// A conflict-resolution policy for KVLog entries.
///
/// `precedence` returning `Ordering::Equal` for every pair is exactly how
/// the positional variant is expressed — ties (which, for positional, is
/// *every* comparison) always defer to rightmost-wins.
pub trait ResolutionStrategy: Clone {
    /// The plain value type stored under each key.
    type Value: Clone;

    /// Construct a fresh live entry for `set`.
    fn new_entry(key: &str, value: Self::Value, clock: &Clock, replica: ReplicaId) -> Self;

    /// Construct a tombstone entry for `delete`, or `None` if this strategy
    /// has no tombstone concept (the positional variant: deletion just
    /// removes the entry outright).
    fn new_tombstone(key: &str, clock: &Clock, replica: ReplicaId) -> Option<Self>;

    /// The entry's key.
    fn key(&self) -> &str;

    /// The live value, or `None` if this entry is a tombstone.
    fn value(&self) -> Option<&Self::Value>;

    /// Absorb any timestamp this entry carries into `clock` (called during
    /// the initialization scan so a reloaded log doesn't reissue timestamps
    /// a remote peer already used).
    fn observe_into(&self, clock: &Clock);

    /// Conflict-resolution precedence, ignoring position.
    fn precedence(&self, other: &Self) -> Ordering;
}

/// Positional ("rightmost-wins") KVLog entry. No timestamp, no tombstone:
/// `delete` simply removes the sequence element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionalEntry<V> {
    key: String,
    val: V,
}

impl<V: Clone> ResolutionStrategy for PositionalEntry<V> {
    type Value = V;

    fn new_entry(key: &str, value: V, _clock: &Clock, _replica: ReplicaId) -> Self {
        Self {
            key: key.to_string(),
            val: value,
        }
    }

    fn new_tombstone(_key: &str, _clock: &Clock, _replica: ReplicaId) -> Option<Self> {
        None
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn value(&self) -> Option<&V> {
        Some(&self.val)
    }

    fn observe_into(&self, _clock: &Clock) {}

    fn precedence(&self, _other: &Self) -> Ordering {
        Ordering::Equal
    }
}

/// LWW ("last-write-wins") KVLog entry. `val: None` denotes a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LwwEntry<V> {
    key: String,
    val: Option<V>,
    ts: u64,
    by: u64,
}

impl<V: Clone> ResolutionStrategy for LwwEntry<V> {
    type Value = V;

    fn new_entry(key: &str, value: V, clock: &Clock, replica: ReplicaId) -> Self {
        Self {
            key: key.to_string(),
            val: Some(value),
            ts: clock.next(),
            by: replica.0,
        }
    }

    fn new_tombstone(key: &str, clock: &Clock, replica: ReplicaId) -> Option<Self> {
        Some(Self {
            key: key.to_string(),
            val: None,
            ts: clock.next(),
            by: replica.0,
        })
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn value(&self) -> Option<&V> {
        self.val.as_ref()
    }

    fn observe_into(&self, clock: &Clock) {
        clock.observe(self.ts);
    }

    fn precedence(&self, other: &Self) -> Ordering {
        (self.ts, self.by).cmp(&(other.ts, other.by))
    }
}

/// A semantic change emitted by KVLog after observer translation (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<V> {
    Add { key: String, value: V },
    Update { key: String, old: V, new: V },
    Delete { key: String, old: V },
}

type ChangeHandler<V> = Box<dyn Fn(&[Change<V>])>;
type CompactionHandler = Rc<dyn Fn(usize)>;

struct Shared<E: ResolutionStrategy> {
    index: HashMap<String, (ItemId, E)>,
    id_to_key: HashMap<ItemId, String>,
    handlers: Vec<Rc<ChangeHandler<E::Value>>>,
    compaction_handlers: Vec<CompactionHandler>,
    clock: Clock,
}

/// Handle returned by [`KvLog::subscribe`]; pass to `unsubscribe` to stop
/// receiving change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(usize);

/// Key→value store layered on one CRDT ordered sequence (§3 "Entity: KVLog").
pub struct KvLog<E: ResolutionStrategy + 'static> {
    seq: Arc<MemSequence<E>>,
    shared: Rc<RefCell<Shared<E>>>,
    replica: ReplicaId,
}

impl<E: ResolutionStrategy + 'static> KvLog<E> {
    /// Wrap a (possibly already-populated) sequence, replaying its current
    /// contents through the initialization/cleanup pass (§4.2
    /// "Initialization").
    pub fn new(seq: Arc<MemSequence<E>>, replica: ReplicaId) -> Self {
        let shared = Rc::new(RefCell::new(Shared {
            index: HashMap::new(),
            id_to_key: HashMap::new(),
            handlers: Vec::new(),
            compaction_handlers: Vec::new(),
            clock: Clock::new(),
        }));

        initialize(&seq, &shared);

        {
            let seq_for_observer = seq.clone();
            let shared_for_observer = shared.clone();
            seq.observe(Box::new(move |event| {
                handle_seq_event(event, &shared_for_observer, &seq_for_observer);
            }));
        }

        Self {
            seq,
            shared,
            replica,
        }
    }

    /// O(1) lookup of the current winning value for `key`.
    pub fn get(&self, key: &str) -> Option<E::Value>
    where
        E::Value: Clone,
    {
        self.shared
            .borrow()
            .index
            .get(key)
            .and_then(|(_, entry)| entry.value().cloned())
    }

    /// O(1) membership check.
    pub fn has(&self, key: &str) -> bool {
        self.shared.borrow().index.contains_key(key)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.shared.borrow().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently present, in unspecified order.
    pub fn keys(&self) -> Vec<String> {
        self.shared.borrow().index.keys().cloned().collect()
    }

    /// Delete the existing entry for `key` (if any) and append a new one,
    /// as a single transaction. The in-memory index reflects the new value
    /// before this call returns (§4.2).
    pub fn set(&self, key: &str, value: E::Value) {
        let (entry, existing_id) = {
            // Borrow once for both reads; dropped before `transact` runs,
            // since its observer callback also needs to borrow `shared`.
            let shared = self.shared.borrow();
            let entry = E::new_entry(key, value, &shared.clock, self.replica);
            let existing_id = shared.index.get(key).map(|(id, _)| *id);
            (entry, existing_id)
        };
        self.seq.transact(Origin::LOCAL, |txn| {
            if let Some(id) = existing_id {
                txn.delete(id);
            }
            txn.push(entry);
        });
    }

    /// Remove `key`. Positional: removes the entry outright. LWW: appends a
    /// tombstone so concurrent writers converge.
    pub fn delete(&self, key: &str) {
        let existing_id = self.shared.borrow().index.get(key).map(|(id, _)| *id);
        let Some(existing_id) = existing_id else {
            return;
        };
        let tombstone = {
            let shared = self.shared.borrow();
            E::new_tombstone(key, &shared.clock, self.replica)
        };
        self.seq.transact(Origin::LOCAL, |txn| {
            txn.delete(existing_id);
            if let Some(tombstone) = tombstone {
                txn.push(tombstone);
            }
        });
    }

    /// Register a handler invoked with the aggregated changes of every
    /// dispatch (local write or applied remote merge). A handler that
    /// panics does not prevent sibling handlers from running (§4.2,
    /// §7 "Observer handler throw").
    pub fn subscribe(&self, handler: impl Fn(&[Change<E::Value>]) + 'static) -> HandlerId {
        let mut shared = self.shared.borrow_mut();
        shared.handlers.push(Rc::new(Box::new(handler)));
        HandlerId(shared.handlers.len() - 1)
    }

    /// Number of live entries in the backing sequence — used by tests to
    /// verify the compaction invariant (`live_entries == keys_in_index`,
    /// §8 property 1) together with [`KvLog::len`].
    pub fn live_entry_count(&self) -> usize {
        self.seq.len()
    }

    /// Register a handler invoked with the number of entries removed each
    /// time a compaction batch runs — the initial load cleanup pass and
    /// every subsequent loser-deletion batch after a local write or merged
    /// remote update. Lets an embedder (e.g. a metrics counter) observe
    /// compaction activity without this crate depending on anything
    /// outside itself.
    pub fn on_compaction(&self, handler: impl Fn(usize) + 'static) {
        self.shared
            .borrow_mut()
            .compaction_handlers
            .push(Rc::new(handler));
    }

    /// Access to the underlying sequence, e.g. to drive sync-protocol state
    /// vector exchange or to apply a remote update.
    pub fn sequence(&self) -> &Arc<MemSequence<E>> {
        &self.seq
    }
}

fn initialize<E: ResolutionStrategy>(seq: &MemSequence<E>, shared: &Rc<RefCell<Shared<E>>>) {
    let items = seq.iter();
    if items.is_empty() {
        return;
    }

    let mut winner_idx: HashMap<String, usize> = HashMap::new();
    for (idx, item) in items.iter().enumerate().rev() {
        item.value.observe_into(&shared.borrow().clock);
        let key = item.value.key().to_string();
        match winner_idx.get(&key) {
            None => {
                winner_idx.insert(key, idx);
            }
            Some(&cur_idx) => {
                if item.value.precedence(&items[cur_idx].value) == Ordering::Greater {
                    winner_idx.insert(key, idx);
                }
            }
        }
    }

    let mut shared_mut = shared.borrow_mut();
    let mut keep: HashMap<ItemId, ()> = HashMap::new();
    for (key, idx) in &winner_idx {
        let item = &items[*idx];
        keep.insert(item.id, ());
        if item.value.value().is_some() {
            shared_mut
                .index
                .insert(key.clone(), (item.id, item.value.clone()));
            shared_mut.id_to_key.insert(item.id, key.clone());
        }
    }
    let losers: Vec<ItemId> = items
        .iter()
        .filter(|item| !keep.contains_key(&item.id))
        .map(|item| item.id)
        .collect();
    drop(shared_mut);

    if !losers.is_empty() {
        let removed = losers.len();
        seq.transact(Origin::LOCAL, |txn| {
            for id in losers {
                txn.delete(id);
            }
        });
        for handler in &shared.borrow().compaction_handlers {
            handler(removed);
        }
    }
}

fn handle_seq_event<E: ResolutionStrategy>(
    event: &SeqEvent<E>,
    shared: &Rc<RefCell<Shared<E>>>,
    seq: &MemSequence<E>,
) {
    let mut cleanup: Vec<ItemId> = Vec::new();
    let mut changes: Vec<Change<E::Value>> = Vec::new();

    {
        let mut shared_mut = shared.borrow_mut();

        // Step 1: deletions, by reference identity (ItemId).
        let mut pending_deletes: HashMap<String, E::Value> = HashMap::new();
        for id in &event.deleted {
            if let Some(key) = shared_mut.id_to_key.remove(id) {
                if let Some((_, entry)) = shared_mut.index.remove(&key) {
                    if let Some(old) = entry.value().cloned() {
                        pending_deletes.insert(key, old);
                    }
                }
            }
        }

        // Step 2: group added entries by key, preserving push order.
        let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
        for (pos, item) in event.added.iter().enumerate() {
            by_key
                .entry(item.value.key().to_string())
                .or_default()
                .push(pos);
        }

        // Step 3: resolve the winning occurrence per key in this batch.
        for (key, positions) in by_key {
            let mut winner_pos = positions[0];
            for &pos in &positions[1..] {
                let candidate = &event.added[pos].value;
                let current = &event.added[winner_pos].value;
                if candidate.precedence(current) != Ordering::Less {
                    winner_pos = pos;
                }
            }
            for &pos in &positions {
                if pos != winner_pos {
                    cleanup.push(event.added[pos].id);
                }
            }

            let winner = &event.added[winner_pos];
            let new_val = winner.value.value().cloned();

            let prior_in_index = shared_mut.index.get(&key).cloned();
            let prior_pending = pending_deletes.remove(&key);

            match (prior_in_index, prior_pending) {
                (Some((old_id, old_entry)), _) => {
                    cleanup.push(old_id);
                    if let Some(new_val) = new_val.clone() {
                        if let Some(old_val) = old_entry.value().cloned() {
                            changes.push(Change::Update {
                                key: key.clone(),
                                old: old_val,
                                new: new_val,
                            });
                        } else {
                            changes.push(Change::Add {
                                key: key.clone(),
                                value: new_val,
                            });
                        }
                    } else if let Some(old_val) = old_entry.value().cloned() {
                        changes.push(Change::Delete {
                            key: key.clone(),
                            old: old_val,
                        });
                    }
                }
                (None, Some(old_val)) => {
                    if let Some(new_val) = new_val.clone() {
                        changes.push(Change::Update {
                            key: key.clone(),
                            old: old_val,
                            new: new_val,
                        });
                    }
                    // else: tombstone replacing a pending delete — stays
                    // deleted, already accounted for below as a leftover
                    // pending delete would double report; nothing to do.
                }
                (None, None) => {
                    if let Some(new_val) = new_val.clone() {
                        changes.push(Change::Add {
                            key: key.clone(),
                            value: new_val,
                        });
                    }
                }
            }

            if let Some(new_val) = new_val {
                let _ = new_val;
                shared_mut
                    .index
                    .insert(key.clone(), (winner.id, winner.value.clone()));
                shared_mut.id_to_key.insert(winner.id, key.clone());
            }
        }

        // Any pending delete not upgraded to an update is a genuine delete.
        for (key, old) in pending_deletes {
            changes.push(Change::Delete { key, old });
        }
    }

    if !cleanup.is_empty() {
        let removed = cleanup.len();
        seq.transact(Origin::LOCAL, |txn| {
            for id in cleanup {
                txn.delete(id);
            }
        });
        for handler in &shared.borrow().compaction_handlers {
            handler(removed);
        }
    }

    if !changes.is_empty() {
        let handlers = shared.borrow().handlers.clone();
        for handler in handlers {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&changes)));
        }
    }
}
