//! CRDT runtime port (component C1).
//!
//! The CRDT runtime is treated as an external collaborator, interface
//! only. KVLog, Row Projection, and the Table/KV store are written against
//! the traits in this module, not against a concrete engine, so a
//! production deployment can swap in a real operation-based CRDT engine
//! (e.g. `yrs`) behind the same seam. [`mem`] is the reference
//! implementation used by every test in this workspace; it is deliberately
//! simple — reference building blocks rather than a production distributed
//! engine.

pub mod mem;

use std::fmt;

/// Opaque identifier for the transaction that caused a change, used for
/// echo suppression (§4.6, §9 glossary: "Origin token").
///
/// `Origin::LOCAL` marks a change whose transaction carried no origin
/// (purely local mutation, no connection to suppress an echo to).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Origin(u64);

impl Origin {
    /// The origin used for purely local mutations.
    pub const LOCAL: Origin = Origin(0);

    /// Wrap an arbitrary numeric token (e.g. a connection id) as an origin.
    pub fn new(token: u64) -> Self {
        Origin(token)
    }

    /// The raw token, for callers that need to compare or log it.
    pub fn token(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "origin({})", self.0)
    }
}

/// Stable identity for an element of an [`OrderedSequence`].
///
/// Never reused within a sequence's lifetime. KVLog relies on `ItemId`
/// equality (not value equality) to detect whether the entry it has
/// cached in its index is still the live occurrence during observer
/// dispatch (§4.2, §9 "CRDT container references").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u64);

impl ItemId {
    pub(crate) fn new(raw: u64) -> Self {
        ItemId(raw)
    }
}

/// One element of an ordered sequence, as returned by `iter`.
#[derive(Debug, Clone)]
pub struct SeqItem<T> {
    pub id: ItemId,
    pub value: T,
}

/// The result of a merge (or a local transaction), reported to observers.
///
/// Deletions are reported before additions are processed for a given key,
/// matching the observer translation order in §4.2.
#[derive(Debug, Clone)]
pub struct SeqEvent<T> {
    pub added: Vec<SeqItem<T>>,
    pub deleted: Vec<ItemId>,
    pub origin: Origin,
}

/// Handle to an active observer registration; drop or pass to `unobserve`
/// to stop receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn new(raw: u64) -> Self {
        SubscriptionId(raw)
    }
}

/// A CRDT list whose elements have stable identities and a total order.
///
/// KVLog is the sole direct consumer: it wraps exactly one
/// `OrderedSequence<KvEntry<T>>` (§3 "Entity: KVLog").
pub trait OrderedSequence<T: Clone> {
    /// Append `value` at the end of the sequence in a new transaction,
    /// tagged with `origin`. Returns the new element's identity.
    fn push(&self, value: T, origin: Origin) -> ItemId;

    /// Remove the element identified by `id`, if still present.
    fn delete(&self, id: ItemId, origin: Origin);

    /// Run `f` inside a single transaction; every `push`/`delete` called
    /// through the passed [`SeqTxn`] is applied atomically and reported
    /// as one aggregated [`SeqEvent`]. Required for KVLog's `set`, which
    /// must delete the old entry and append the new one as one operation
    /// (§4.2).
    fn transact<F, R>(&self, origin: Origin, f: F) -> R
    where
        F: FnOnce(&mem::SeqTxn<'_, T>) -> R;

    /// Current elements, in order.
    fn iter(&self) -> Vec<SeqItem<T>>;

    /// Number of live elements.
    fn len(&self) -> usize;

    /// Whether the sequence has no live elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a callback invoked once per committed transaction (local
    /// or merged-in) with the aggregated change set.
    ///
    /// Not `Send + Sync`: the concurrency model (§5) is single-threaded
    /// cooperative per document, so observers may freely close over `Rc`/
    /// `RefCell` state the way [`crate::kvlog::KvLog`] does.
    fn observe(&self, f: Box<dyn Fn(&SeqEvent<T>)>) -> SubscriptionId;

    /// Stop receiving events for a prior `observe` call.
    fn unobserve(&self, id: SubscriptionId);
}

/// A collaborative rich-text container (§3 "Row.Entity" composite cell).
///
/// Indices are character offsets, matching the minimal text diff in §4.3.1.
pub trait CrdtText {
    /// The current contents as a plain string.
    fn to_string_value(&self) -> String;
    /// Insert `s` at character offset `at`.
    fn insert(&mut self, at: usize, s: &str);
    /// Delete `len` characters starting at offset `at`.
    fn delete(&mut self, at: usize, len: usize);
    /// Number of characters currently stored.
    fn len(&self) -> usize {
        self.to_string_value().chars().count()
    }
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A collaborative ordered-array container (§3 "Row.Entity" composite cell).
pub trait CrdtArray<T: Clone + PartialEq> {
    /// The current contents, in order.
    fn to_vec_value(&self) -> Vec<T>;
    /// Insert `items` starting at index `at`.
    fn insert(&mut self, at: usize, items: &[T]);
    /// Delete `len` elements starting at index `at`.
    fn delete(&mut self, at: usize, len: usize);
    fn len(&self) -> usize {
        self.to_vec_value().len()
    }
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
