//! CRDT runtime port, monotonic clock, KVLog, row projection, and typed
//! table storage for the kvsync replication core.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐     ┌─────────────────────┐
//! │   Table<Row>        │     │   KvStore<Cell>     │
//! │   (typed CRUD)       │     │   (singleton keys)   │
//! └──────────┬──────────┘     └──────────┬──────────┘
//!            │                           │
//!            ▼                           ▼
//! ┌──────────────────────────────────────────────────┐
//! │                    KVLog (C3)                     │
//! │   positional rightmost-wins / LWW (ts, by)        │
//! └──────────────────────────────────────────────────┘
//!            │
//!            ▼
//! ┌──────────────────────────────────────────────────┐
//! │            CRDT Runtime port (C1)                 │
//! │        OrderedSequence / CrdtText / CrdtArray      │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Row Projection (C4) sits beside KVLog: it encodes typed row fields onto
//! the cells KVLog stores and carries the minimal text/array diff
//! algorithms that keep nested collaborative containers from being
//! needlessly rewritten on every update.

pub mod awareness;
pub mod clock;
pub mod document;
pub mod error;
pub mod kvlog;
pub mod row;
pub mod runtime;
pub mod table;

pub use awareness::{Awareness, AwarenessSubscriptionId};
pub use clock::Clock;
pub use document::{CrdtDoc, MemDocument};
pub use error::{KvLogError, Result};
pub use kvlog::{Change, HandlerId, KvLog, LwwEntry, PositionalEntry, ReplicaId, ResolutionStrategy};
pub use row::{apply_field, diff_array, diff_text, Cell, FieldSchema, FieldType, InputValue, Row, RowSchema, ScalarValue};
pub use runtime::mem::{MemArray, MemSequence, MemText};
pub use runtime::{CrdtArray, CrdtText, ItemId, Origin, OrderedSequence, SeqEvent, SeqItem, SubscriptionId};
pub use table::{KvStore, Table};
