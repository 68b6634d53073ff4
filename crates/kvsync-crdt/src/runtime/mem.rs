//! Reference in-memory implementation of the CRDT runtime port.
//!
//! Single-threaded-cooperative per §5: every mutation takes `&self` (not
//! `&mut self`) via an internal `RefCell`, reserving real concurrency
//! primitives (`DashMap`, `parking_lot`) for state that is genuinely shared
//! across tasks and using plain interior mutability where the concurrency
//! model already guarantees single-writer access.

use std::cell::RefCell;

use super::{CrdtArray, CrdtText, ItemId, OrderedSequence, Origin, SeqEvent, SeqItem, SubscriptionId};

type Observer<T> = Box<dyn Fn(&SeqEvent<T>)>;

struct SeqInner<T> {
    items: Vec<(ItemId, T)>,
    next_id: u64,
    next_sub: u64,
    observers: Vec<(u64, Observer<T>)>,
}

/// In-memory [`OrderedSequence`]. Backs every KVLog in this workspace's
/// tests and the reference `kvsyncd` binary.
pub struct MemSequence<T> {
    inner: RefCell<SeqInner<T>>,
}

impl<T> Default for MemSequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MemSequence<T> {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(SeqInner {
                items: Vec::new(),
                next_id: 1,
                next_sub: 1,
                observers: Vec::new(),
            }),
        }
    }
}

/// A live transaction handle passed to the closure given to
/// [`OrderedSequence::transact`]. Collects pushes/deletes and reports them
/// as a single aggregated event when the closure returns.
pub struct SeqTxn<'a, T> {
    seq: &'a MemSequence<T>,
    added: RefCell<Vec<SeqItem<T>>>,
    deleted: RefCell<Vec<ItemId>>,
}

impl<'a, T: Clone> SeqTxn<'a, T> {
    /// Append `value`, returning its new identity.
    pub fn push(&self, value: T) -> ItemId {
        let mut inner = self.seq.inner.borrow_mut();
        let id = ItemId::new(inner.next_id);
        inner.next_id += 1;
        inner.items.push((id, value.clone()));
        drop(inner);
        self.added.borrow_mut().push(SeqItem { id, value });
        id
    }

    /// Delete the element identified by `id`, if still present.
    pub fn delete(&self, id: ItemId) {
        let mut inner = self.seq.inner.borrow_mut();
        let before = inner.items.len();
        inner.items.retain(|(item_id, _)| *item_id != id);
        let removed = inner.items.len() != before;
        drop(inner);
        if removed {
            self.deleted.borrow_mut().push(id);
        }
    }
}

impl<T: Clone> OrderedSequence<T> for MemSequence<T> {
    fn push(&self, value: T, origin: Origin) -> ItemId {
        self.transact(origin, |txn| txn.push(value))
    }

    fn delete(&self, id: ItemId, origin: Origin) {
        self.transact(origin, |txn| txn.delete(id));
    }

    fn transact<F, R>(&self, origin: Origin, f: F) -> R
    where
        F: FnOnce(&SeqTxn<'_, T>) -> R,
    {
        let txn = SeqTxn {
            seq: self,
            added: RefCell::new(Vec::new()),
            deleted: RefCell::new(Vec::new()),
        };
        let result = f(&txn);
        let added = txn.added.into_inner();
        let deleted = txn.deleted.into_inner();
        if !added.is_empty() || !deleted.is_empty() {
            let event = SeqEvent {
                added,
                deleted,
                origin,
            };
            let inner = self.inner.borrow();
            for (_, observer) in &inner.observers {
                observer(&event);
            }
        }
        result
    }

    fn iter(&self) -> Vec<SeqItem<T>> {
        self.inner
            .borrow()
            .items
            .iter()
            .map(|(id, value)| SeqItem {
                id: *id,
                value: value.clone(),
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    fn observe(&self, f: Observer<T>) -> SubscriptionId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_sub;
        inner.next_sub += 1;
        inner.observers.push((id, f));
        SubscriptionId::new(id)
    }

    fn unobserve(&self, id: SubscriptionId) {
        let mut inner = self.inner.borrow_mut();
        inner.observers.retain(|(sub_id, _)| SubscriptionId::new(*sub_id) != id);
    }
}

/// In-memory [`CrdtText`]: a plain `String` mutated by character offset.
///
/// A real CRDT text type keeps per-character identities so concurrent
/// inserts interleave deterministically; this reference type does not
/// (out of scope — the core only needs the diff algorithm's write path to
/// exercise `insert`/`delete` correctly, per §4.3.1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemText {
    value: String,
}

impl MemText {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            value: initial.into(),
        }
    }
}

impl CrdtText for MemText {
    fn to_string_value(&self) -> String {
        self.value.clone()
    }

    fn insert(&mut self, at: usize, s: &str) {
        let byte_idx = char_to_byte_index(&self.value, at);
        self.value.insert_str(byte_idx, s);
    }

    fn delete(&mut self, at: usize, len: usize) {
        let start = char_to_byte_index(&self.value, at);
        let end = char_to_byte_index(&self.value, at + len);
        self.value.replace_range(start..end, "");
    }
}

fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(byte_idx, _)| byte_idx)
        .unwrap_or(s.len())
}

/// In-memory [`CrdtArray`]: a plain `Vec<T>` mutated by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemArray<T> {
    items: Vec<T>,
}

impl<T: Clone + PartialEq> MemArray<T> {
    pub fn new(initial: Vec<T>) -> Self {
        Self { items: initial }
    }
}

impl<T: Clone + PartialEq> CrdtArray<T> for MemArray<T> {
    fn to_vec_value(&self) -> Vec<T> {
        self.items.clone()
    }

    fn insert(&mut self, at: usize, items: &[T]) {
        self.items.splice(at..at, items.iter().cloned());
    }

    fn delete(&mut self, at: usize, len: usize) {
        self.items.drain(at..at + len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn push_then_iter_preserves_order() {
        let seq: MemSequence<&'static str> = MemSequence::new();
        seq.push("a", Origin::LOCAL);
        seq.push("b", Origin::LOCAL);
        seq.push("c", Origin::LOCAL);
        let values: Vec<_> = seq.iter().into_iter().map(|i| i.value).collect();
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[test]
    fn delete_removes_only_that_item() {
        let seq: MemSequence<&'static str> = MemSequence::new();
        let a = seq.push("a", Origin::LOCAL);
        seq.push("b", Origin::LOCAL);
        seq.delete(a, Origin::LOCAL);
        let values: Vec<_> = seq.iter().into_iter().map(|i| i.value).collect();
        assert_eq!(values, vec!["b"]);
    }

    #[test]
    fn transact_batches_delete_and_push_into_one_event() {
        let seq: MemSequence<&'static str> = MemSequence::new();
        let old = seq.push("old", Origin::LOCAL);

        let events: Arc<Mutex<Vec<SeqEvent<&'static str>>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        seq.observe(Box::new(move |event| {
            events_clone.lock().unwrap().push(event.clone());
        }));

        seq.transact(Origin::LOCAL, |txn| {
            txn.delete(old);
            txn.push("new");
        });

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].deleted, vec![old]);
        assert_eq!(events[0].added.len(), 1);
        assert_eq!(events[0].added[0].value, "new");
    }

    #[test]
    fn observers_see_origin_for_echo_suppression() {
        let seq: MemSequence<&'static str> = MemSequence::new();
        let seen_origin = Arc::new(Mutex::new(None));
        let seen_clone = seen_origin.clone();
        seq.observe(Box::new(move |event| {
            *seen_clone.lock().unwrap() = Some(event.origin);
        }));
        seq.push("x", Origin::new(42));
        assert_eq!(*seen_origin.lock().unwrap(), Some(Origin::new(42)));
    }

    #[test]
    fn unobserve_stops_delivery() {
        let seq: MemSequence<&'static str> = MemSequence::new();
        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        let sub = seq.observe(Box::new(move |_| {
            *count_clone.lock().unwrap() += 1;
        }));
        seq.push("a", Origin::LOCAL);
        seq.unobserve(sub);
        seq.push("b", Origin::LOCAL);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn text_insert_delete_by_char_offset() {
        let mut text = MemText::new("Hello World");
        text.insert(5, " Beautiful");
        assert_eq!(text.to_string_value(), "Hello Beautiful World");
        text.delete(5, 10);
        assert_eq!(text.to_string_value(), "Hello World");
    }

    #[test]
    fn text_handles_multibyte_chars_by_char_offset() {
        let mut text = MemText::new("caf\u{e9}s"); // "cafés"
        text.insert(4, "!");
        assert_eq!(text.to_string_value(), "caf\u{e9}!s");
    }

    #[test]
    fn array_insert_delete_by_index() {
        let mut array = MemArray::new(vec!["typescript", "javascript"]);
        array.insert(1, &["svelte"]);
        assert_eq!(array.to_vec_value(), vec!["typescript", "svelte", "javascript"]);
        array.delete(1, 1);
        assert_eq!(array.to_vec_value(), vec!["typescript", "javascript"]);
    }
}
