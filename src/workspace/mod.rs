//! Workspace Client Lifecycle (component C10, §4.8): synchronous
//! construction of an in-memory Document plus Table/KV helpers, with
//! asynchronous extension initialization surfaced as a `when_synced`
//! barrier rather than blocking construction.
//!
//! A two-phase construction shape: build the shared state synchronously,
//! spawn background work, let callers await readiness separately.
//! Construction here never awaits anything, extension factories launch as
//! `spawn_local` tasks on the same `LocalSet` as
//! [`crate::sync::client::SyncClient`], and `doc`/`awareness` are the same
//! `Rc`-based single-threaded-cooperative objects for the same reason (§5).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::{join_all, try_join_all};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use kvsync_crdt::{
    Awareness, Cell, CrdtDoc, FieldType, LwwEntry, MemDocument, MemSequence, PositionalEntry,
    ReplicaId, Row, RowSchema, ScalarValue,
};

use crate::error::{WorkspaceError, WorkspaceResult};

/// Runtime dispatch over the two [`kvsync_crdt::Table`] instantiations a
/// room's `resolution` setting can select (§4.4, §9 "share an identical
/// operation shape"). The resolution strategy is only known once
/// configuration loads, so callers can't pick the generic parameter at
/// compile time.
pub enum AnyTable {
    Positional(kvsync_crdt::Table<PositionalEntry<Row>>),
    Lww(kvsync_crdt::Table<LwwEntry<Row>>),
}

impl AnyTable {
    fn new(resolution: &str, replica: ReplicaId, schema: RowSchema) -> Self {
        let table = if resolution == "lww" {
            Self::Lww(kvsync_crdt::Table::new(
                Arc::new(MemSequence::new()),
                replica,
                schema,
            ))
        } else {
            Self::Positional(kvsync_crdt::Table::new(
                Arc::new(MemSequence::new()),
                replica,
                schema,
            ))
        };
        table.on_compaction(|removed| crate::metrics::KVLOG_COMPACTIONS.inc_by(removed as u64));
        table
    }

    fn on_compaction(&self, handler: impl Fn(usize) + 'static) {
        match self {
            Self::Positional(t) => t.on_compaction(handler),
            Self::Lww(t) => t.on_compaction(handler),
        }
    }

    pub fn upsert(&self, id: &str, fields: HashMap<String, kvsync_crdt::InputValue>) {
        match self {
            Self::Positional(t) => t.upsert(id, fields),
            Self::Lww(t) => t.upsert(id, fields),
        }
    }

    pub fn upsert_many(&self, rows: Vec<(String, HashMap<String, kvsync_crdt::InputValue>)>) {
        match self {
            Self::Positional(t) => t.upsert_many(rows),
            Self::Lww(t) => t.upsert_many(rows),
        }
    }

    pub fn get(&self, id: &str) -> Option<Row> {
        match self {
            Self::Positional(t) => t.get(id),
            Self::Lww(t) => t.get(id),
        }
    }

    pub fn get_all_valid(&self) -> Vec<(String, Row)> {
        match self {
            Self::Positional(t) => t.get_all_valid(),
            Self::Lww(t) => t.get_all_valid(),
        }
    }

    pub fn delete(&self, id: &str) {
        match self {
            Self::Positional(t) => t.delete(id),
            Self::Lww(t) => t.delete(id),
        }
    }

    pub fn delete_many(&self, ids: &[String]) {
        match self {
            Self::Positional(t) => t.delete_many(ids),
            Self::Lww(t) => t.delete_many(ids),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Positional(t) => t.len(),
            Self::Lww(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Positional(t) => t.is_empty(),
            Self::Lww(t) => t.is_empty(),
        }
    }
}

/// Runtime dispatch over the two [`kvsync_crdt::KvStore`] instantiations,
/// for the same reason as [`AnyTable`].
pub enum AnyKvStore {
    Positional(kvsync_crdt::KvStore<PositionalEntry<Cell>>),
    Lww(kvsync_crdt::KvStore<LwwEntry<Cell>>),
}

impl AnyKvStore {
    fn new(resolution: &str, replica: ReplicaId, schema: HashMap<String, FieldType>) -> Self {
        let store = if resolution == "lww" {
            Self::Lww(kvsync_crdt::KvStore::new(
                Arc::new(MemSequence::new()),
                replica,
                schema,
            ))
        } else {
            Self::Positional(kvsync_crdt::KvStore::new(
                Arc::new(MemSequence::new()),
                replica,
                schema,
            ))
        };
        store.on_compaction(|removed| crate::metrics::KVLOG_COMPACTIONS.inc_by(removed as u64));
        store
    }

    fn on_compaction(&self, handler: impl Fn(usize) + 'static) {
        match self {
            Self::Positional(s) => s.on_compaction(handler),
            Self::Lww(s) => s.on_compaction(handler),
        }
    }

    pub fn set_scalar(&self, key: &str, value: ScalarValue) {
        match self {
            Self::Positional(s) => s.set_scalar(key, value),
            Self::Lww(s) => s.set_scalar(key, value),
        }
    }

    pub fn get(&self, key: &str) -> Option<Cell> {
        match self {
            Self::Positional(s) => s.get(key),
            Self::Lww(s) => s.get(key),
        }
    }

    pub fn delete(&self, key: &str) {
        match self {
            Self::Positional(s) => s.delete(key),
            Self::Lww(s) => s.delete(key),
        }
    }
}

/// Declared shape and resolution policy for one table (§4.8 point 2,
/// §4.4).
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub schema: RowSchema,
    pub resolution: String,
}

/// Declared shape and resolution policy for one singleton KV store.
#[derive(Debug, Clone, PartialEq)]
pub struct KvSpec {
    pub schema: HashMap<String, FieldType>,
    pub resolution: String,
}

/// `definition.tables` / `definition.kv` (§3 "Entity: Workspace
/// Document"): the schema a workspace's tables and KV stores are merged
/// against on construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceDefinition {
    pub tables: HashMap<String, TableSpec>,
    pub kv: HashMap<String, KvSpec>,
}

/// Merge `incoming`'s table/KV specs into `target` by field-by-field
/// value equality; specs that are unchanged are left alone (§4.8 point 2:
/// "unchanged fields are not re-written", preventing churn on repeated
/// starts). Returns the number of specs actually inserted or changed, so
/// a repeated merge against an identical definition can be asserted as a
/// true no-op.
pub fn merge_definition(target: &mut WorkspaceDefinition, incoming: &WorkspaceDefinition) -> usize {
    let mut changed = 0;
    for (name, spec) in &incoming.tables {
        if target.tables.get(name) != Some(spec) {
            target.tables.insert(name.clone(), spec.clone());
            changed += 1;
        }
    }
    for (name, spec) in &incoming.kv {
        if target.kv.get(name) != Some(spec) {
            target.kv.insert(name.clone(), spec.clone());
            changed += 1;
        }
    }
    changed
}

/// Shared in-memory objects handed to each [`ExtensionFactory`] (§4.8
/// point 5).
pub struct ExtensionContext {
    pub doc: Rc<MemDocument>,
    pub awareness: Rc<Awareness>,
}

/// One pluggable extension's readiness and teardown (§4.8 "exports
/// object with its own whenSynced and optional destroy"). Both methods
/// default to immediately ready / no-op, so an extension that only cares
/// about one of them doesn't have to stub out the other.
#[async_trait(?Send)]
pub trait Extension {
    async fn when_synced(&self) -> WorkspaceResult<()> {
        Ok(())
    }

    async fn destroy(&self) -> WorkspaceResult<()> {
        Ok(())
    }
}

/// Builds one [`Extension`] asynchronously from shared workspace state
/// (§4.8 point 5).
#[async_trait(?Send)]
pub trait ExtensionFactory {
    async fn create(&self, ctx: ExtensionContext) -> Result<Rc<dyn Extension>, WorkspaceError>;
}

/// Stand-in for an extension whose factory hasn't resolved yet, or never
/// will because it failed (§4.8 point 4: "exports object with no-op
/// lifecycles so the runtime shape matches the static type of
/// extensions").
struct NoOpExtension;

impl Extension for NoOpExtension {}

/// In-memory client for one workspace Document: Table/KV helpers bound to
/// the Document, plus the extensions declared for it (§4.8).
pub struct WorkspaceClient {
    guid: String,
    doc: Rc<MemDocument>,
    awareness: Rc<Awareness>,
    tables: HashMap<String, Rc<AnyTable>>,
    kv: HashMap<String, Rc<AnyKvStore>>,
    extensions: RefCell<HashMap<String, Rc<dyn Extension>>>,
    factory_handles: RefCell<Vec<(String, JoinHandle<Result<Rc<dyn Extension>, WorkspaceError>>)>>,
    settled: OnceCell<Vec<WorkspaceError>>,
    destroyed: OnceCell<WorkspaceResult<()>>,
}

impl WorkspaceClient {
    /// Construct the client and launch every extension factory. Returns
    /// immediately; nothing here awaits the factories (§4.8 "Client
    /// creation returns immediately").
    ///
    /// `loaded` is whatever definition the persistence port last had on
    /// disk (empty on first boot); `target` is the schema the calling
    /// code declares it wants. The merged result is what Table/KV helpers
    /// are built against.
    ///
    /// `retain_history` disables the Document's GC (§4.8 point 1: "GC is
    /// disabled when revision history is required").
    pub fn new(
        id: &str,
        epoch: u64,
        replica: ReplicaId,
        mut loaded: WorkspaceDefinition,
        target: &WorkspaceDefinition,
        factories: HashMap<String, Rc<dyn ExtensionFactory>>,
        retain_history: bool,
    ) -> Rc<Self> {
        merge_definition(&mut loaded, target);

        let guid = format!("{id}-{epoch}");
        let doc = Rc::new(MemDocument::new(guid.clone(), !retain_history));
        let awareness = Rc::new(Awareness::new());

        let tables = loaded
            .tables
            .into_iter()
            .map(|(name, spec)| {
                let table = AnyTable::new(&spec.resolution, replica, spec.schema);
                (name, Rc::new(table))
            })
            .collect();
        let kv = loaded
            .kv
            .into_iter()
            .map(|(name, spec)| {
                let store = AnyKvStore::new(&spec.resolution, replica, spec.schema);
                (name, Rc::new(store))
            })
            .collect();

        let extensions = factories
            .keys()
            .map(|name| (name.clone(), Rc::new(NoOpExtension) as Rc<dyn Extension>))
            .collect();

        let client = Rc::new(Self {
            guid,
            doc: doc.clone(),
            awareness: awareness.clone(),
            tables,
            kv,
            extensions: RefCell::new(extensions),
            factory_handles: RefCell::new(Vec::new()),
            settled: OnceCell::new(),
            destroyed: OnceCell::new(),
        });

        let handles = factories
            .into_iter()
            .map(|(name, factory)| {
                let ctx = ExtensionContext {
                    doc: doc.clone(),
                    awareness: awareness.clone(),
                };
                let handle = tokio::task::spawn_local(async move { factory.create(ctx).await });
                (name, handle)
            })
            .collect();
        *client.factory_handles.borrow_mut() = handles;

        client
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn doc(&self) -> &Rc<MemDocument> {
        &self.doc
    }

    pub fn awareness(&self) -> &Rc<Awareness> {
        &self.awareness
    }

    pub fn table(&self, name: &str) -> Option<&Rc<AnyTable>> {
        self.tables.get(name)
    }

    pub fn kv_store(&self, name: &str) -> Option<&Rc<AnyKvStore>> {
        self.kv.get(name)
    }

    /// Await every factory exactly once, win or lose, filling in
    /// `extensions` for the ones that resolved and collecting the errors
    /// for the ones that didn't. Shared by `when_synced` and `destroy` so
    /// neither re-awaits a `JoinHandle` (which can only be awaited once).
    async fn settle(&self) -> &Vec<WorkspaceError> {
        self.settled
            .get_or_init(|| async {
                let handles: Vec<_> = self.factory_handles.borrow_mut().drain(..).collect();
                let mut errors = Vec::new();
                for (name, handle) in handles {
                    match handle.await {
                        Ok(Ok(extension)) => {
                            self.extensions.borrow_mut().insert(name, extension);
                        }
                        Ok(Err(err)) => errors.push(err),
                        Err(join_err) => {
                            errors.push(WorkspaceError::ExtensionInit(name, join_err.to_string()));
                        }
                    }
                }
                errors
            })
            .await
    }

    /// Settle all factories (errors don't block this from completing),
    /// then await every settled extension's own readiness, failing fast
    /// on the first error (§4.8 point 6).
    pub async fn when_synced(&self) -> WorkspaceResult<()> {
        if let Some(err) = self.settle().await.first() {
            return Err(err.clone());
        }
        let exts: Vec<Rc<dyn Extension>> = self.extensions.borrow().values().cloned().collect();
        try_join_all(exts.iter().map(|ext| ext.when_synced())).await?;
        Ok(())
    }

    /// Await the same factory-settled barrier `when_synced` uses, then
    /// destroy every extension via all-settled (one failure doesn't block
    /// the others), then destroy the Document. Idempotent: repeated calls
    /// return the same cached result without re-running teardown (§4.8
    /// "Destroy").
    pub async fn destroy(&self) -> WorkspaceResult<()> {
        self.destroyed
            .get_or_init(|| async {
                let mut errors = self.settle().await.clone();
                let exts: Vec<Rc<dyn Extension>> =
                    self.extensions.borrow().values().cloned().collect();
                let results = join_all(exts.iter().map(|ext| ext.destroy())).await;
                self.doc.destroy();
                errors.extend(results.into_iter().filter_map(Result::err));
                match errors.into_iter().next() {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            })
            .await
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvsync_crdt::FieldSchema;

    fn replica() -> ReplicaId {
        ReplicaId(1)
    }

    fn blog_definition() -> WorkspaceDefinition {
        let mut tables = HashMap::new();
        tables.insert(
            "posts".to_string(),
            TableSpec {
                schema: RowSchema::new(vec![FieldSchema {
                    name: "title".to_string(),
                    field_type: FieldType::Text,
                }]),
                resolution: "lww".to_string(),
            },
        );
        WorkspaceDefinition {
            tables,
            kv: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn guid_joins_id_and_epoch() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = WorkspaceClient::new(
                    "blog",
                    7,
                    replica(),
                    WorkspaceDefinition::default(),
                    &blog_definition(),
                    HashMap::new(),
                    false,
                );
                assert_eq!(client.guid(), "blog-7");
            })
            .await;
    }

    #[tokio::test]
    async fn retain_history_disables_document_gc() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = WorkspaceClient::new(
                    "blog",
                    1,
                    replica(),
                    WorkspaceDefinition::default(),
                    &blog_definition(),
                    HashMap::new(),
                    true,
                );
                assert!(!client.doc().gc_enabled());
            })
            .await;
    }

    #[test]
    fn merge_definition_is_a_no_op_on_repeated_identical_merge() {
        let mut target = WorkspaceDefinition::default();
        let incoming = blog_definition();
        assert_eq!(merge_definition(&mut target, &incoming), 1);
        assert_eq!(merge_definition(&mut target, &incoming), 0);
    }

    #[test]
    fn merge_definition_detects_a_changed_field() {
        let mut target = blog_definition();
        let mut changed = blog_definition();
        changed
            .tables
            .get_mut("posts")
            .unwrap()
            .schema
            .fields
            .push(FieldSchema {
                name: "views".to_string(),
                field_type: FieldType::Scalar,
            });
        assert_eq!(merge_definition(&mut target, &changed), 1);
    }

    #[tokio::test]
    async fn when_synced_resolves_immediately_with_no_extensions() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = WorkspaceClient::new(
                    "blog",
                    1,
                    replica(),
                    WorkspaceDefinition::default(),
                    &blog_definition(),
                    HashMap::new(),
                    false,
                );
                assert!(client.when_synced().await.is_ok());
            })
            .await;
    }

    struct FailingFactory;

    #[async_trait(?Send)]
    impl ExtensionFactory for FailingFactory {
        async fn create(&self, _ctx: ExtensionContext) -> Result<Rc<dyn Extension>, WorkspaceError> {
            Err(WorkspaceError::ExtensionInit(
                "persistence".to_string(),
                "disk full".to_string(),
            ))
        }
    }

    #[tokio::test]
    async fn when_synced_surfaces_a_factory_error() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut factories: HashMap<String, Rc<dyn ExtensionFactory>> = HashMap::new();
                factories.insert("persistence".to_string(), Rc::new(FailingFactory));
                let client = WorkspaceClient::new(
                    "blog",
                    1,
                    replica(),
                    WorkspaceDefinition::default(),
                    &blog_definition(),
                    factories,
                    false,
                );
                let err = client.when_synced().await.unwrap_err();
                assert_eq!(err.error_code(), "extension_init_failed");
                // the no-op placeholder stays in place for a failed factory
                assert!(client.table("posts").is_some());
            })
            .await;
    }

    struct CountingFactory {
        destroyed: Rc<RefCell<bool>>,
    }

    struct CountingExtension {
        destroyed: Rc<RefCell<bool>>,
    }

    #[async_trait(?Send)]
    impl Extension for CountingExtension {
        async fn destroy(&self) -> WorkspaceResult<()> {
            *self.destroyed.borrow_mut() = true;
            Ok(())
        }
    }

    #[async_trait(?Send)]
    impl ExtensionFactory for CountingFactory {
        async fn create(&self, _ctx: ExtensionContext) -> Result<Rc<dyn Extension>, WorkspaceError> {
            Ok(Rc::new(CountingExtension {
                destroyed: self.destroyed.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_runs_every_extension_once() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let destroyed = Rc::new(RefCell::new(false));
                let mut factories: HashMap<String, Rc<dyn ExtensionFactory>> = HashMap::new();
                factories.insert(
                    "counter".to_string(),
                    Rc::new(CountingFactory {
                        destroyed: destroyed.clone(),
                    }),
                );
                let client = WorkspaceClient::new(
                    "blog",
                    1,
                    replica(),
                    WorkspaceDefinition::default(),
                    &blog_definition(),
                    factories,
                    false,
                );
                client.when_synced().await.unwrap();
                assert!(client.destroy().await.is_ok());
                assert!(client.destroy().await.is_ok());
                assert!(*destroyed.borrow());
            })
            .await;
    }
}
