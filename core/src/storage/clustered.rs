//! Clustered row storage.
//!
//! Every table keeps a row directory (row id to stored versions), a
//! transaction log and a header in relocatable blobs. A fixed one-page
//! anchor cluster, recorded in the catalog, points at the header so the
//! catalog never has to be rewritten when the header moves. Row payloads
//! are bincode records in their own clusters; long text and binary values
//! are split out into extension clusters.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::{
    ConstraintDef, DataType, DefaultValueDef, ForeignKeyDef, IdentityDef, TableId, TableSchema,
};
use crate::database::DatabaseShared;
use crate::error::{StrataError, StrataResult};
use crate::expression::{Evaluator, ExpressionCompiler, truth};
use crate::filter::{FilterBody, FilterType, IdentitySource};
use crate::lock::LockHandle;
use crate::row::{Extension, RefPosition, Row, RowId, RowShape, Value};
use crate::storage::ClusterStore;
use crate::storage::blob::{self, BlobSlot};
use crate::storage::object::{Operation, RowPersistence, StorageObject, VersionRef};
use crate::storage::relation::{Relation, RelationRole};
use crate::transaction::{Session, TransactionLog, TransactionStatus, TxnId};

/// A storage object over clustered storage
pub type ClusteredRowSet = StorageObject<ClusterStorage>;

type Directory = BTreeMap<RowId, Vec<VersionRef>>;

/// Default values and identity high-water marks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultRow {
    pub values: Vec<Value>,
    pub last_identity: Vec<Option<i64>>,
    pub version: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableHeader {
    pub row_count: u64,
    pub last_row_id: u32,
    pub schema_version: u64,
    /// Highest version counter value at the last persist
    pub version_stamp: u64,
    pub default_row: DefaultRow,
    pub directory: BlobSlot,
    pub translog: BlobSlot,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Anchor {
    header: BlobSlot,
}

#[derive(Debug, Serialize, Deserialize)]
struct RowRecord {
    row_id: RowId,
    values: Vec<Value>,
    extensions: BTreeMap<usize, Extension>,
}

/// Reversible record of one change inside a unit of work
#[derive(Debug, Clone)]
enum UndoEntry {
    /// Version list of a row before and after the change; empty means absent
    Row {
        row_id: RowId,
        before: Vec<VersionRef>,
        after: Vec<VersionRef>,
    },
    RowCount { txn: TxnId, delta: i64 },
}

/// Open options for a row set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub read_only: bool,
    /// Sole handle on the table; locking is skipped
    pub exclusive: bool,
}

fn apply_delta(count: u64, delta: i64) -> u64 {
    (count as i64).saturating_add(delta).max(0) as u64
}

fn versions_missing_from(from: &[VersionRef], other: &[VersionRef]) -> Vec<VersionRef> {
    from.iter()
        .filter(|v| !other.iter().any(|o| o.position == v.position))
        .copied()
        .collect()
}

/// Free a row cluster and its extension clusters
fn release_version(store: &dyn ClusterStore, version: &VersionRef) -> StrataResult<()> {
    match store
        .read_cluster(version.position)
        .map_err(|e| e.to_string())
        .and_then(|bytes| bincode::deserialize::<RowRecord>(&bytes).map_err(|e| e.to_string()))
    {
        Ok(record) => {
            for extension in record.extensions.values() {
                store.set_free_cluster(extension.position, extension.pages)?;
            }
        }
        Err(e) => warn!(
            "Releasing unreadable row cluster {}: {}",
            version.position, e
        ),
    }
    store.set_free_cluster(version.position, version.pages)
}

#[derive(Debug)]
struct TableState {
    header: TableHeader,
    header_slot: BlobSlot,
    directory: Directory,
    log: TransactionLog,
    dirty: bool,
}

impl TableState {
    /// Write directory, log and header; repoint the anchor when the header
    /// moved
    fn persist(
        &mut self,
        store: &dyn ClusterStore,
        anchor: RefPosition,
        stamp: u64,
    ) -> StrataResult<()> {
        let directory = bincode::serialize(&self.directory)?;
        self.header.directory = blob::store(store, self.header.directory, &directory)?;
        let log = bincode::serialize(&self.log)?;
        self.header.translog = blob::store(store, self.header.translog, &log)?;
        self.header.version_stamp = self.header.version_stamp.max(stamp);

        let header = bincode::serialize(&self.header)?;
        let slot = blob::store(store, self.header_slot, &header)?;
        if slot != self.header_slot {
            store.write_cluster(anchor, &bincode::serialize(&Anchor { header: slot })?)?;
            self.header_slot = slot;
        }

        store.flush()?;
        self.log.clear_modified();
        self.dirty = false;
        Ok(())
    }

    /// Undo every version change of `txn`: drop its new versions and give
    /// outdated ones back their previous stamp
    fn revert_versions(&mut self, store: &dyn ClusterStore, txn: TxnId) -> StrataResult<usize> {
        let mut released = Vec::new();
        let mut emptied = Vec::new();
        let mut touched = 0;

        for (row_id, versions) in self.directory.iter_mut() {
            let before = versions.len();
            versions.retain(|v| {
                let discard = !v.outdated && v.row_version == txn.0;
                if discard {
                    released.push(*v);
                }
                !discard
            });
            touched += before - versions.len();

            for version in versions.iter_mut() {
                if version.outdated && version.row_version == txn.0 {
                    version.row_version = version.prior_version;
                    version.prior_version = 0;
                    version.outdated = false;
                    touched += 1;
                }
            }
            if versions.is_empty() {
                emptied.push(*row_id);
            }
        }

        for row_id in emptied {
            self.directory.remove(&row_id);
        }
        for version in &released {
            release_version(store, version)?;
        }
        if touched > 0 {
            self.dirty = true;
        }
        Ok(touched)
    }
}

/// Per-table state shared by every handle
#[derive(Debug)]
pub struct TableShared {
    id: TableId,
    anchor: RefPosition,
    schema: RwLock<TableSchema>,
    state: Mutex<TableState>,
    handles: AtomicUsize,
    exclusive: AtomicBool,
}

impl TableShared {
    /// Lay out an empty table and record its anchor in `schema`
    pub fn create(store: &dyn ClusterStore, schema: &mut TableSchema) -> StrataResult<Self> {
        let anchor = store.get_free_cluster(1)?;
        schema.header = BlobSlot {
            position: anchor,
            pages: 1,
        };

        let columns = schema.columns.len();
        let header = TableHeader {
            schema_version: schema.version,
            default_row: DefaultRow {
                values: vec![Value::Null; columns],
                last_identity: vec![None; columns],
                version: 0,
            },
            ..TableHeader::default()
        };

        let table = Self {
            id: schema.id,
            anchor,
            schema: RwLock::new(schema.clone()),
            state: Mutex::new(TableState {
                header,
                header_slot: BlobSlot::default(),
                directory: Directory::new(),
                log: TransactionLog::new(),
                dirty: true,
            }),
            handles: AtomicUsize::new(0),
            exclusive: AtomicBool::new(false),
        };
        table.state.lock().persist(store, anchor, 0)?;
        Ok(table)
    }

    pub fn load(store: &dyn ClusterStore, schema: TableSchema) -> StrataResult<Self> {
        let corrupt = |message: String| StrataError::Corruption {
            table: schema.name.clone(),
            message,
        };
        let anchor_position = schema.header.position;
        if anchor_position.is_empty() {
            return Err(corrupt("no header anchor".into()));
        }

        let anchor: Anchor = store
            .read_cluster(anchor_position)
            .map_err(|e| e.to_string())
            .and_then(|bytes| bincode::deserialize(&bytes).map_err(|e| e.to_string()))
            .map_err(|e| corrupt(format!("anchor: {}", e)))?;
        let header: TableHeader = blob::load(store, anchor.header)
            .map_err(|e| e.to_string())
            .and_then(|bytes| bincode::deserialize(&bytes).map_err(|e| e.to_string()))
            .map_err(|e| corrupt(format!("header: {}", e)))?;

        let directory: Directory = if header.directory.is_empty() {
            Directory::new()
        } else {
            blob::load(store, header.directory)
                .map_err(|e| e.to_string())
                .and_then(|bytes| bincode::deserialize(&bytes).map_err(|e| e.to_string()))
                .map_err(|e| corrupt(format!("row directory: {}", e)))?
        };
        let log: TransactionLog = if header.translog.is_empty() {
            TransactionLog::new()
        } else {
            blob::load(store, header.translog)
                .map_err(|e| e.to_string())
                .and_then(|bytes| bincode::deserialize(&bytes).map_err(|e| e.to_string()))
                .map_err(|e| corrupt(format!("transaction log: {}", e)))?
        };

        debug!(
            "Loaded '{}': {} rows, {} directory entries",
            schema.name,
            header.row_count,
            directory.len()
        );

        Ok(Self {
            id: schema.id,
            anchor: anchor_position,
            schema: RwLock::new(schema),
            state: Mutex::new(TableState {
                header,
                header_slot: anchor.header,
                directory,
                log,
                dirty: false,
            }),
            handles: AtomicUsize::new(0),
            exclusive: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> String {
        self.schema.read().name.clone()
    }

    pub fn schema(&self) -> TableSchema {
        self.schema.read().clone()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }

    /// Highest version stamp this table has seen
    pub fn max_version(&self) -> u64 {
        let state = self.state.lock();
        let in_directory = state
            .directory
            .values()
            .flatten()
            .map(|v| v.row_version.max(v.prior_version))
            .max()
            .unwrap_or(0);
        let in_log = state.log.active().into_iter().map(|t| t.0).max().unwrap_or(0);
        state.header.version_stamp.max(in_directory).max(in_log)
    }

    /// Row count as stored in the header
    pub fn committed_row_count(&self) -> u64 {
        self.state.lock().header.row_count
    }

    pub fn directory_len(&self) -> usize {
        self.state.lock().directory.len()
    }

    pub fn involves(&self, txn: TxnId) -> bool {
        self.state.lock().log.status(txn).is_some()
    }

    /// Fold the transaction's row delta into the header and forget it
    pub fn commit_transaction(&self, db: &DatabaseShared, txn: TxnId) -> StrataResult<bool> {
        let mut state = self.state.lock();
        if state.log.status(txn).is_none() {
            return Ok(false);
        }

        let delta = state.log.commit(txn);
        state.header.row_count = apply_delta(state.header.row_count, delta);
        state.log.finalize(txn);
        state.persist(db.store.as_ref(), self.anchor, db.registry.current_version())?;
        debug!("{} committed on '{}' (delta {})", txn, self.name(), delta);
        Ok(true)
    }

    pub fn rollback_transaction(&self, db: &DatabaseShared, txn: TxnId) -> StrataResult<bool> {
        let mut state = self.state.lock();
        if state.log.status(txn).is_none() {
            return Ok(false);
        }

        state.log.rollback(txn);
        let reverted = state.revert_versions(db.store.as_ref(), txn)?;
        state.log.finalize(txn);
        state.persist(db.store.as_ref(), self.anchor, db.registry.current_version())?;
        debug!("{} rolled back on '{}' ({} versions)", txn, self.name(), reverted);
        Ok(true)
    }

    /// Settle what a crash left in the log: active transactions are rolled
    /// back, committed ones folded in
    pub fn recover(&self, store: &dyn ClusterStore) -> StrataResult<usize> {
        let mut state = self.state.lock();
        if state.log.is_empty() {
            return Ok(0);
        }

        let mut settled = 0;
        for txn in state.log.active() {
            state.log.rollback(txn);
            state.revert_versions(store, txn)?;
            state.log.finalize(txn);
            settled += 1;
        }

        for txn in state.log.committed() {
            let delta = state.log.delta(txn);
            state.log.finalize(txn);
            state.header.row_count = apply_delta(state.header.row_count, delta);
            settled += 1;
        }

        if settled > 0 {
            info!("Recovered {} interrupted transaction(s) on '{}'", settled, self.name());
            let stamp = state.header.version_stamp;
            state.persist(store, self.anchor, stamp)?;
        }
        Ok(settled)
    }

    /// Drop versions superseded by committed writers. Only safe while no
    /// transaction is running.
    pub fn vacuum(&self, db: &DatabaseShared) -> StrataResult<usize> {
        let store = db.store.as_ref();
        let mut state = self.state.lock();
        let mut released = Vec::new();
        let mut emptied = Vec::new();

        let TableState { directory, log, .. } = &mut *state;
        for (row_id, versions) in directory.iter_mut() {
            versions.retain(|v| {
                let stale = v.outdated && log.writer_status(v.row_version) == TransactionStatus::Committed;
                if stale {
                    released.push(*v);
                }
                !stale
            });
            if versions.is_empty() {
                emptied.push(*row_id);
            }
        }

        if released.is_empty() {
            return Ok(0);
        }
        for row_id in emptied {
            state.directory.remove(&row_id);
        }
        for version in &released {
            release_version(store, version)?;
        }
        state.persist(store, self.anchor, db.registry.current_version())?;
        debug!("Vacuumed {} versions from '{}'", released.len(), self.name());
        Ok(released.len())
    }

    /// Free every cluster the table owns
    pub fn destroy(&self, store: &dyn ClusterStore) -> StrataResult<()> {
        let mut state = self.state.lock();
        let directory = std::mem::take(&mut state.directory);
        for version in directory.values().flatten() {
            release_version(store, version)?;
        }
        blob::release(store, state.header.directory)?;
        blob::release(store, state.header.translog)?;
        blob::release(store, state.header_slot)?;
        store.set_free_cluster(self.anchor, 1)?;
        Ok(())
    }
}

/// Row persistence over clustered storage; one per open row set
pub struct ClusterStorage {
    db: Arc<DatabaseShared>,
    table: Arc<TableShared>,
    journal: Vec<UndoEntry>,
    read_only: bool,
    exclusive: bool,
}

impl ClusterStorage {
    /// Open a row set on `name` with filters and relations from its schema
    pub fn open(
        db: &Arc<DatabaseShared>,
        name: &str,
        session: Arc<Session>,
        options: OpenOptions,
    ) -> StrataResult<ClusteredRowSet> {
        let table = db.table(name)?;

        if table.exclusive.load(Ordering::SeqCst) {
            return Err(StrataError::Storage(format!(
                "Table '{}' is opened exclusively",
                name
            )));
        }
        if options.exclusive {
            if table.handles.load(Ordering::SeqCst) > 0
                || table
                    .exclusive
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                return Err(StrataError::Storage(format!(
                    "Table '{}' is in use and cannot be opened exclusively",
                    name
                )));
            }
        }
        table.handles.fetch_add(1, Ordering::SeqCst);

        let storage = ClusterStorage {
            db: Arc::clone(db),
            table: Arc::clone(&table),
            journal: Vec::new(),
            read_only: options.read_only || db.config.read_only,
            exclusive: options.exclusive,
        };
        let locks = LockHandle::new(
            Arc::clone(&db.locks),
            session.owner(),
            table.id,
            session.lock_timeout(),
            options.exclusive || db.config.virtual_locks,
        );

        let mut object = StorageObject::new(storage, session, locks, options.read_only);
        let schema = table.schema();
        attach_schema_filters(&mut object, db.compiler.as_ref(), &schema)?;
        attach_relations(&mut object, db, &schema)?;

        debug!(
            "Opened '{}' ({} filters, {} relations)",
            schema.name,
            object.filters().count(FilterType::Identity)
                + object.filters().count(FilterType::DefaultValueInsert)
                + object.filters().count(FilterType::ReadOnly),
            object.relations().len()
        );
        Ok(object)
    }

    pub fn database(&self) -> &Arc<DatabaseShared> {
        &self.db
    }

    pub fn table(&self) -> &Arc<TableShared> {
        &self.table
    }

    fn name(&self) -> String {
        self.table.name()
    }

    fn corruption(&self, message: String) -> StrataError {
        StrataError::Corruption {
            table: self.name(),
            message,
        }
    }

    /// Rewrite this table's schema in the catalog and in memory
    pub fn update_schema<F>(&self, change: F) -> StrataResult<TableSchema>
    where
        F: FnOnce(&mut TableSchema) -> StrataResult<()>,
    {
        let name = self.name();
        let mut catalog = self.db.catalog.write();
        let schema = catalog
            .get_table_mut(&name)
            .ok_or_else(|| StrataError::NotFound(format!("table '{}'", name)))?;

        let mut updated = schema.clone();
        change(&mut updated)?;
        updated.version += 1;
        *schema = updated.clone();
        catalog.save(self.db.store.as_ref())?;

        *self.table.schema.write() = updated.clone();
        let mut state = self.table.state.lock();
        state.header.schema_version = updated.version;
        state.dirty = true;
        Ok(updated)
    }

    pub fn set_default_value(&self, column: usize, value: Value) {
        let mut state = self.table.state.lock();
        let default_row = &mut state.header.default_row;
        if default_row.values.len() <= column {
            default_row.values.resize(column + 1, Value::Null);
        }
        default_row.values[column] = value;
        default_row.version += 1;
        state.dirty = true;
    }

    /// Write `row` as a new record; the row picks up its extension map
    fn write_record(&self, row: &mut Row) -> StrataResult<(RefPosition, u32)> {
        let store = self.db.store.as_ref();
        let threshold = self.db.config.extension_threshold;

        let mut values = Vec::with_capacity(row.len());
        let mut extensions = BTreeMap::new();
        for (column, value) in row.values().iter().enumerate() {
            if value.payload_len() > threshold {
                let bytes = bincode::serialize(value)?;
                let pages = store.pages_for(bytes.len());
                let position = store.get_free_cluster(pages)?;
                store.write_cluster(position, &bytes)?;
                extensions.insert(column, Extension { position, pages });
                values.push(Value::Null);
            } else {
                values.push(value.clone());
            }
        }

        let record = RowRecord {
            row_id: row.row_id(),
            values,
            extensions,
        };
        let bytes = bincode::serialize(&record)?;
        let pages = store.pages_for(bytes.len());
        let position = store.get_free_cluster(pages)?;
        store.write_cluster(position, &bytes)?;
        row.set_extensions(record.extensions);
        Ok((position, pages))
    }

    fn read_extension(&self, extension: &Extension) -> Result<Value, String> {
        let bytes = self
            .db
            .store
            .read_cluster(extension.position)
            .map_err(|e| e.to_string())?;
        bincode::deserialize(&bytes).map_err(|e| e.to_string())
    }

    /// Replace (`Some`) or delete (`None`) the current version of a row.
    /// Returns the stamp of the change.
    fn replace_version(
        &mut self,
        row_id: RowId,
        txn: TxnId,
        replacement: Option<(RefPosition, u32)>,
    ) -> StrataResult<u64> {
        let name = self.name();
        let mut state = self.table.state.lock();
        let before = state
            .directory
            .get(&row_id)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(format!("row {} of '{}'", row_id, name)))?;

        if let Some(writer) = before
            .iter()
            .find_map(|v| state.log.active_writer(v.row_version, txn))
        {
            return Err(StrataError::TransactionConflict {
                table: name,
                row_id,
                writer,
            });
        }

        let index = before
            .iter()
            .rposition(|v| !v.outdated)
            .ok_or_else(|| StrataError::NotFound(format!("row {} of '{}'", row_id, name)))?;
        let target = before[index];
        let mut after = before.clone();

        // Running transactions may still need the version being replaced
        let in_place = if txn.is_none() {
            self.db.registry.active_count() == 0
        } else {
            target.row_version == txn.0
        };

        let stamp = if in_place {
            let stamp = if txn.is_none() {
                self.db.registry.next_version()
            } else {
                txn.0
            };
            match replacement {
                Some((position, pages)) => {
                    after[index] = VersionRef {
                        position,
                        pages,
                        row_version: stamp,
                        outdated: false,
                        prior_version: target.prior_version,
                    };
                }
                None => {
                    after.remove(index);
                }
            }
            stamp
        } else {
            let stamp = if txn.is_none() {
                self.db.registry.next_version()
            } else {
                state.log.register(txn);
                txn.0
            };
            after[index] = VersionRef {
                row_version: stamp,
                outdated: true,
                prior_version: target.row_version,
                ..target
            };
            if let Some((position, pages)) = replacement {
                after.push(VersionRef {
                    position,
                    pages,
                    row_version: stamp,
                    outdated: false,
                    prior_version: 0,
                });
            }
            stamp
        };

        if after.is_empty() {
            state.directory.remove(&row_id);
        } else {
            state.directory.insert(row_id, after.clone());
        }
        state.dirty = true;
        drop(state);

        self.journal.push(UndoEntry::Row {
            row_id,
            before,
            after,
        });
        Ok(stamp)
    }
}

impl Drop for ClusterStorage {
    fn drop(&mut self) {
        self.table.handles.fetch_sub(1, Ordering::SeqCst);
        if self.exclusive {
            self.table.exclusive.store(false, Ordering::SeqCst);
        }
    }
}

impl IdentitySource for ClusterStorage {
    fn next_identity(&mut self, column: usize, seed: i64, step: i64) -> StrataResult<i64> {
        let mut state = self.table.state.lock();
        let marks = &mut state.header.default_row.last_identity;
        if marks.len() <= column {
            marks.resize(column + 1, None);
        }

        let next = match marks[column] {
            None => Some(seed),
            Some(last) => last.checked_add(step),
        };
        let Some(next) = next else {
            return Err(StrataError::Identity {
                table: self.name(),
                column: self.table.schema.read().shape().column_name(column),
                message: "identity value out of range".into(),
            });
        };

        marks[column] = Some(next);
        state.dirty = true;
        Ok(next)
    }

    fn observe_identity(&mut self, column: usize, value: i64, step: i64) -> StrataResult<()> {
        let mut state = self.table.state.lock();
        let marks = &mut state.header.default_row.last_identity;
        if marks.len() <= column {
            marks.resize(column + 1, None);
        }

        let ahead = |mark: i64| if step >= 0 { value > mark } else { value < mark };
        let raise = match marks[column] {
            Some(last) => ahead(last),
            None => {
                // Before the first generated value the seed is the mark
                let schema = self.table.schema.read();
                let seed = schema
                    .identities
                    .iter()
                    .find(|i| schema.column_index(&i.column).ok() == Some(column))
                    .map(|i| i.seed)
                    .unwrap_or(value);
                value == seed || ahead(seed)
            }
        };
        if raise {
            marks[column] = Some(value);
            state.dirty = true;
        }
        Ok(())
    }
}

impl RowPersistence for ClusterStorage {
    fn table_id(&self) -> TableId {
        self.table.id
    }

    fn table_name(&self) -> String {
        self.name()
    }

    fn shape(&self) -> RowShape {
        self.table.schema.read().shape()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn repair_mode(&self) -> bool {
        self.db.config.repair_mode
    }

    fn scan(&self, from: RowId, forward: bool) -> StrataResult<Option<(RowId, Vec<VersionRef>)>> {
        let state = self.table.state.lock();
        let found = if forward {
            state
                .directory
                .range((Bound::Excluded(from), Bound::Unbounded))
                .next()
        } else {
            state.directory.range(..from).next_back()
        };
        Ok(found.map(|(row_id, versions)| (*row_id, versions.clone())))
    }

    fn versions(&self, row_id: RowId) -> StrataResult<Vec<VersionRef>> {
        Ok(self
            .table
            .state
            .lock()
            .directory
            .get(&row_id)
            .cloned()
            .unwrap_or_default())
    }

    fn writer_status(&self, row_version: u64) -> TransactionStatus {
        self.table.state.lock().log.writer_status(row_version)
    }

    fn read_row(&self, row_id: RowId, version: &VersionRef, row: &mut Row) -> StrataResult<()> {
        let bytes = self
            .db
            .store
            .read_cluster(version.position)
            .map_err(|e| self.corruption(format!("row {} unreadable: {}", row_id, e)))?;
        let record: RowRecord = bincode::deserialize(&bytes)
            .map_err(|e| self.corruption(format!("row {} undecodable: {}", row_id, e)))?;
        if record.row_id != row_id {
            return Err(self.corruption(format!(
                "row {} found under directory entry {}",
                record.row_id, row_id
            )));
        }

        row.clear();
        for (column, value) in record.values.into_iter().enumerate() {
            row.put_value(column, value);
        }
        for (column, extension) in &record.extensions {
            match self.read_extension(extension) {
                Ok(value) => row.put_value(*column, value),
                Err(e) if self.repair_mode() => {
                    warn!(
                        "Repair mode: column {} of row {} in '{}' lost: {}",
                        column,
                        row_id,
                        self.name(),
                        e
                    );
                    row.put_value(*column, Value::Null);
                }
                Err(e) => {
                    return Err(self.corruption(format!(
                        "extension of column {} in row {}: {}",
                        column, row_id, e
                    )));
                }
            }
        }

        row.set_extensions(record.extensions);
        row.set_row_id(row_id);
        row.set_row_version(version.row_version);
        row.set_outdated(version.outdated);
        row.set_position(version.position);
        Ok(())
    }

    fn allocate_row_id(&mut self) -> StrataResult<RowId> {
        let mut state = self.table.state.lock();
        let next = state
            .header
            .last_row_id
            .checked_add(1)
            .filter(|id| RowId(*id).is_valid())
            .ok_or_else(|| StrataError::Storage(format!("Row ids of '{}' exhausted", self.name())))?;
        state.header.last_row_id = next;
        state.dirty = true;
        Ok(RowId(next))
    }

    fn insert_row(&mut self, row: &mut Row, txn: TxnId) -> StrataResult<()> {
        let (position, pages) = self.write_record(row)?;
        let stamp = if txn.is_none() {
            self.db.registry.next_version()
        } else {
            txn.0
        };
        let version = VersionRef {
            position,
            pages,
            row_version: stamp,
            outdated: false,
            prior_version: 0,
        };

        let row_id = row.row_id();
        {
            let mut state = self.table.state.lock();
            state.log.register(txn);
            state.directory.insert(row_id, vec![version]);
            state.dirty = true;
        }
        self.journal.push(UndoEntry::Row {
            row_id,
            before: Vec::new(),
            after: vec![version],
        });

        row.set_row_version(stamp);
        row.set_position(position);
        row.set_outdated(false);
        Ok(())
    }

    fn update_row(&mut self, row: &mut Row, txn: TxnId) -> StrataResult<()> {
        let (position, pages) = self.write_record(row)?;
        match self.replace_version(row.row_id(), txn, Some((position, pages))) {
            Ok(stamp) => {
                row.set_row_version(stamp);
                row.set_position(position);
                row.set_outdated(false);
                Ok(())
            }
            Err(e) => {
                let orphan = VersionRef {
                    position,
                    pages,
                    row_version: 0,
                    outdated: false,
                    prior_version: 0,
                };
                if let Err(release) = release_version(self.db.store.as_ref(), &orphan) {
                    warn!("Could not release unused row cluster: {}", release);
                }
                Err(e)
            }
        }
    }

    fn delete_row(&mut self, row_id: RowId, txn: TxnId) -> StrataResult<()> {
        self.replace_version(row_id, txn, None).map(|_| ())
    }

    fn adjust_row_count(&mut self, delta: i64, txn: TxnId) {
        let mut state = self.table.state.lock();
        if txn.is_none() {
            state.header.row_count = apply_delta(state.header.row_count, delta);
        } else {
            state.log.add_delta(txn, delta);
        }
        state.dirty = true;
        drop(state);
        self.journal.push(UndoEntry::RowCount { txn, delta });
    }

    fn row_count(&self, txn: TxnId) -> u64 {
        let state = self.table.state.lock();
        apply_delta(state.header.row_count, state.log.visible_delta(txn))
    }

    fn finalize(&mut self, commit: bool) -> StrataResult<()> {
        let journal = std::mem::take(&mut self.journal);
        let store = self.db.store.as_ref();
        let mut state = self.table.state.lock();
        let mut released = Vec::new();

        if commit {
            for entry in &journal {
                if let UndoEntry::Row { before, after, .. } = entry {
                    released.extend(versions_missing_from(before, after));
                }
            }
        } else {
            for entry in journal.iter().rev() {
                match entry {
                    UndoEntry::Row {
                        row_id,
                        before,
                        after,
                    } => {
                        if before.is_empty() {
                            state.directory.remove(row_id);
                        } else {
                            state.directory.insert(*row_id, before.clone());
                        }
                        released.extend(versions_missing_from(after, before));
                    }
                    UndoEntry::RowCount { txn, delta } => {
                        if txn.is_none() {
                            state.header.row_count = apply_delta(state.header.row_count, -delta);
                        } else {
                            state.log.add_delta(*txn, -delta);
                        }
                    }
                }
                state.dirty = true;
            }
            if !journal.is_empty() {
                debug!("Undid {} change(s) on '{}'", journal.len(), self.name());
            }
        }

        for version in &released {
            release_version(store, version)?;
        }
        if state.dirty || state.log.is_modified() {
            state.persist(store, self.table.anchor, self.db.registry.current_version())?;
        }
        Ok(())
    }

    fn has_pending(&self) -> bool {
        !self.journal.is_empty()
    }

    fn default_row(&self) -> Row {
        let columns = self.table.schema.read().columns.len();
        let mut values = self.table.state.lock().header.default_row.values.clone();
        values.resize(columns, Value::Null);
        Row::from_values(values)
    }

    fn open_related(&self, table: &str, session: &Arc<Session>) -> StrataResult<ClusteredRowSet> {
        ClusterStorage::open(&self.db, table, Arc::clone(session), OpenOptions::default())
    }
}

fn attach_schema_filters(
    object: &mut ClusteredRowSet,
    compiler: &dyn ExpressionCompiler,
    schema: &TableSchema,
) -> StrataResult<()> {
    let shape = schema.shape();

    for identity in &schema.identities {
        let column = schema.column_index(&identity.column)?;
        object.filters_mut().attach_filter(
            FilterType::Identity,
            0,
            FilterBody::Identity {
                column,
                seed: identity.seed,
                step: identity.step,
            },
        )?;
    }

    for default in &schema.defaults {
        let column = schema.column_index(&default.column)?;
        let evaluator = compiler.compile(&default.expression, &shape)?;
        object.filters_mut().attach_filter(
            FilterType::DefaultValueInsert,
            0,
            FilterBody::DefaultValue {
                column,
                evaluator: Arc::clone(&evaluator),
            },
        )?;
        if default.use_in_update {
            object.filters_mut().attach_filter(
                FilterType::DefaultValueUpdate,
                0,
                FilterBody::DefaultValue { column, evaluator },
            )?;
        }
    }

    for (column, definition) in schema.columns.iter().enumerate() {
        if definition.read_only {
            object.filters_mut().attach_filter(
                FilterType::ReadOnly,
                0,
                FilterBody::ReadOnly { column },
            )?;
        }
    }

    for constraint in &schema.constraints {
        let evaluator = compiler.compile(&constraint.expression, &shape)?;
        attach_constraint(object, evaluator, constraint)?;
    }
    Ok(())
}

fn attach_constraint(
    object: &mut ClusteredRowSet,
    evaluator: Arc<dyn Evaluator>,
    constraint: &ConstraintDef,
) -> StrataResult<()> {
    for (enabled, filter_type) in [
        (constraint.on_insert, FilterType::ConstraintInsert),
        (constraint.on_update, FilterType::ConstraintUpdate),
        (constraint.on_delete, FilterType::ConstraintDelete),
    ] {
        if enabled {
            object.filters_mut().attach_filter(
                filter_type,
                0,
                FilterBody::Constraint {
                    name: constraint.name.clone(),
                    evaluator: Arc::clone(&evaluator),
                },
            )?;
        }
    }
    Ok(())
}

fn attach_relations(
    object: &mut ClusteredRowSet,
    db: &DatabaseShared,
    schema: &TableSchema,
) -> StrataResult<()> {
    let local = schema.shape();
    let catalog = db.catalog.read();

    for fk in &schema.foreign_keys {
        let master = catalog
            .get_table(&fk.references)
            .ok_or_else(|| StrataError::NotFound(format!("table '{}'", fk.references)))?;
        let relation = Relation::from_foreign_key(fk, RelationRole::Slave, &local, &master.shape())?;
        object.relations_mut().push(relation);
    }

    for fk in catalog.references_to(&schema.name) {
        let slave = catalog
            .get_table(&fk.table)
            .ok_or_else(|| StrataError::NotFound(format!("table '{}'", fk.table)))?;
        let relation = Relation::from_foreign_key(&fk, RelationRole::Master, &local, &slave.shape())?;
        object.relations_mut().push(relation);
    }
    Ok(())
}

/// Schema changes on an open row set. Each runs under the storage lock as
/// one unit of work.
impl StorageObject<ClusterStorage> {
    fn schema_change<F>(&mut self, change: F) -> StrataResult<()>
    where
        F: FnOnce(&mut Self) -> StrataResult<()>,
    {
        if self.is_read_only() {
            return Err(StrataError::ReadOnly {
                table: self.name().to_string(),
            });
        }
        self.lock_storage()?;
        let result = change(self);
        let finalized = self.finalize_changes(result.is_ok());
        self.unlock_storage();
        result.and(finalized)
    }

    fn compiler(&self) -> Arc<dyn ExpressionCompiler> {
        Arc::clone(&self.persistence().database().compiler)
    }

    pub fn create_identity(&mut self, column: &str, seed: i64, step: i64) -> StrataResult<()> {
        self.schema_change(|object| {
            let index = object.column_index(column)?;
            if object.shape().columns()[index].data_type != DataType::Integer {
                return Err(StrataError::InvalidInput(format!(
                    "Identity column '{}.{}' must be INTEGER",
                    object.name(),
                    column
                )));
            }
            if step == 0 {
                return Err(StrataError::InvalidInput("Identity step cannot be zero".into()));
            }

            let schema = object.persistence().table().schema();
            if schema
                .identities
                .iter()
                .any(|i| i.column.eq_ignore_ascii_case(column))
            {
                return Err(StrataError::InvalidInput(format!(
                    "Column '{}.{}' already has an identity",
                    schema.name, column
                )));
            }

            // Existing values count as handed out
            let mut existing = Vec::new();
            object.for_each_visible(|row| {
                if let Value::Integer(value) = row.value(index) {
                    existing.push(*value);
                }
                Ok(())
            })?;

            object.persistence().update_schema(|schema| {
                schema.identities.push(IdentityDef {
                    column: column.to_string(),
                    seed,
                    step,
                });
                Ok(())
            })?;
            for value in existing {
                object
                    .persistence_mut()
                    .observe_identity(index, value, step)?;
            }

            object.filters_mut().attach_filter(
                FilterType::Identity,
                0,
                FilterBody::Identity {
                    column: index,
                    seed,
                    step,
                },
            )?;
            Ok(())
        })
    }

    pub fn drop_identity(&mut self, column: &str) -> StrataResult<()> {
        self.schema_change(|object| {
            let index = object.column_index(column)?;
            object.persistence().update_schema(|schema| {
                let before = schema.identities.len();
                schema
                    .identities
                    .retain(|i| !i.column.eq_ignore_ascii_case(column));
                if schema.identities.len() == before {
                    return Err(StrataError::NotFound(format!(
                        "identity on '{}.{}'",
                        schema.name, column
                    )));
                }
                Ok(())
            })?;
            object
                .filters_mut()
                .detach_column_filter(FilterType::Identity, index);
            Ok(())
        })
    }

    /// A constant expression also becomes the column's value in the
    /// default row
    pub fn create_default_value(
        &mut self,
        column: &str,
        expression: &str,
        use_in_update: bool,
    ) -> StrataResult<()> {
        let compiler = self.compiler();
        self.schema_change(|object| {
            let index = object.column_index(column)?;
            let evaluator = compiler.compile(expression, object.shape())?;

            let constant = if evaluator.columns().is_empty() {
                let value = evaluator.exec(&Row::new(object.shape().len()))?;
                if !object.shape().columns()[index].data_type.accepts(&value) {
                    return Err(StrataError::DefaultValue {
                        table: object.name().to_string(),
                        column: column.to_string(),
                        message: format!("'{}' yields {}", expression, value.type_name()),
                    });
                }
                Some(value)
            } else {
                None
            };

            let schema = object.persistence().table().schema();
            if schema
                .defaults
                .iter()
                .any(|d| d.column.eq_ignore_ascii_case(column))
            {
                return Err(StrataError::InvalidInput(format!(
                    "Column '{}.{}' already has a default value",
                    schema.name, column
                )));
            }

            object.persistence().update_schema(|schema| {
                schema.defaults.push(DefaultValueDef {
                    column: column.to_string(),
                    expression: expression.to_string(),
                    use_in_update,
                });
                Ok(())
            })?;
            if let Some(value) = constant {
                object.persistence().set_default_value(index, value);
            }

            object.filters_mut().attach_filter(
                FilterType::DefaultValueInsert,
                0,
                FilterBody::DefaultValue {
                    column: index,
                    evaluator: Arc::clone(&evaluator),
                },
            )?;
            if use_in_update {
                object.filters_mut().attach_filter(
                    FilterType::DefaultValueUpdate,
                    0,
                    FilterBody::DefaultValue {
                        column: index,
                        evaluator,
                    },
                )?;
            }
            object.refresh_default_row();
            Ok(())
        })
    }

    pub fn drop_default_value(&mut self, column: &str) -> StrataResult<()> {
        self.schema_change(|object| {
            let index = object.column_index(column)?;
            object.persistence().update_schema(|schema| {
                let before = schema.defaults.len();
                schema
                    .defaults
                    .retain(|d| !d.column.eq_ignore_ascii_case(column));
                if schema.defaults.len() == before {
                    return Err(StrataError::NotFound(format!(
                        "default value on '{}.{}'",
                        schema.name, column
                    )));
                }
                Ok(())
            })?;

            let filters = object.filters_mut();
            filters.detach_column_filter(FilterType::DefaultValueInsert, index);
            filters.detach_column_filter(FilterType::DefaultValueUpdate, index);
            object.persistence().set_default_value(index, Value::Null);
            object.refresh_default_row();
            Ok(())
        })
    }

    /// Existing rows must already satisfy a constraint checked on insert
    /// or update. A delete-only constraint is a condition on deletion and
    /// leaves stored rows alone.
    pub fn create_constraint(&mut self, constraint: ConstraintDef) -> StrataResult<()> {
        let compiler = self.compiler();
        self.schema_change(|object| {
            let evaluator = compiler.compile(&constraint.expression, object.shape())?;

            let schema = object.persistence().table().schema();
            if schema
                .constraints
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&constraint.name))
            {
                return Err(StrataError::InvalidInput(format!(
                    "Constraint '{}' already exists on '{}'",
                    constraint.name, schema.name
                )));
            }

            let mut offending = None;
            if constraint.on_insert || constraint.on_update {
                object.for_each_visible(|row| {
                    if offending.is_none() && truth(&evaluator.exec(row)?)? == Some(false) {
                        offending = Some(row.row_id());
                    }
                    Ok(())
                })?;
            }
            if let Some(row_id) = offending {
                debug!("Row {} violates new constraint '{}'", row_id, constraint.name);
                return Err(StrataError::ConstraintViolation {
                    table: object.name().to_string(),
                    constraint: constraint.name.clone(),
                    operation: Operation::None,
                });
            }

            object.persistence().update_schema(|schema| {
                schema.constraints.push(constraint.clone());
                Ok(())
            })?;

            attach_constraint(object, evaluator, &constraint)
        })
    }

    pub fn drop_constraint(&mut self, name: &str) -> StrataResult<()> {
        self.schema_change(|object| {
            object.persistence().update_schema(|schema| {
                let before = schema.constraints.len();
                schema
                    .constraints
                    .retain(|c| !c.name.eq_ignore_ascii_case(name));
                if schema.constraints.len() == before {
                    return Err(StrataError::NotFound(format!(
                        "constraint '{}' on '{}'",
                        name, schema.name
                    )));
                }
                Ok(())
            })?;
            object.filters_mut().detach_constraint(name);
            Ok(())
        })
    }

    /// Add a foreign key with this table as the slave. Every existing row
    /// must reference an existing master row.
    pub fn create_foreign_key(&mut self, fk: ForeignKeyDef) -> StrataResult<()> {
        self.schema_change(|object| {
            if !fk.table.eq_ignore_ascii_case(object.name()) {
                return Err(StrataError::InvalidInput(format!(
                    "Foreign key '{}' belongs to '{}', not '{}'",
                    fk.name,
                    fk.table,
                    object.name()
                )));
            }
            let master_shape = object
                .persistence()
                .database()
                .catalog
                .read()
                .get_table(&fk.references)
                .map(TableSchema::shape)
                .ok_or_else(|| StrataError::NotFound(format!("table '{}'", fk.references)))?;

            let schema = object.persistence().table().schema();
            if schema
                .foreign_keys
                .iter()
                .any(|k| k.name.eq_ignore_ascii_case(&fk.name))
            {
                return Err(StrataError::InvalidInput(format!(
                    "Foreign key '{}' already exists on '{}'",
                    fk.name, schema.name
                )));
            }

            let relation =
                Relation::from_foreign_key(&fk, RelationRole::Slave, object.shape(), &master_shape)?;
            object.relations_mut().push(relation);

            let mut rows = Vec::new();
            object.for_each_visible(|row| {
                rows.push(row.clone());
                Ok(())
            })?;
            let checked = rows
                .iter()
                .try_for_each(|row| object.check_references(row));
            if let Err(e) = checked {
                object.relations_mut().remove(&fk.name);
                return Err(e);
            }

            let added = object.persistence().update_schema(|schema| {
                schema.foreign_keys.push(fk.clone());
                Ok(())
            });
            if added.is_err() {
                object.relations_mut().remove(&fk.name);
            }
            added.map(|_| ())
        })
    }

    pub fn drop_foreign_key(&mut self, name: &str) -> StrataResult<()> {
        self.schema_change(|object| {
            object.persistence().update_schema(|schema| {
                let before = schema.foreign_keys.len();
                schema
                    .foreign_keys
                    .retain(|k| !k.name.eq_ignore_ascii_case(name));
                if schema.foreign_keys.len() == before {
                    return Err(StrataError::NotFound(format!(
                        "foreign key '{}' on '{}'",
                        name, schema.name
                    )));
                }
                Ok(())
            })?;
            object.relations_mut().remove(name);
            Ok(())
        })
    }
}
