//! Storage objects: row buffers, the MVCC cursor and the modification
//! pipeline shared by every concrete row set.
//!
//! A storage object owns five row buffers. `current` is the row under the
//! cursor, `satellite` collects pending edits, `top` and `bottom` bound the
//! cursor scope and `default` holds the table's default values. Concrete
//! row sets plug in through [`RowPersistence`]; the pipeline itself is fixed:
//!
//! 1. reject read-only storage
//! 2. lock the row
//! 3. event hooks, then before-filters (identities, defaults, read-only)
//! 4. physical write
//! 5. relationship cascade
//! 6. row count and bitmap filters
//! 7. after-filters (constraints), then event hooks
//! 8. finalize: commit or undo the unit of work, release row locks
//!
//! A failure anywhere in 2-7 undoes the unit of work and parks the cursor
//! past the end.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::TableId;
use crate::error::{StrataError, StrataResult};
use crate::expression::Evaluator;
use crate::filter::{
    FilterBody, FilterCollection, FilterContext, FilterId, FilterType, IdentitySource, RowFilter,
};
use crate::lock::LockHandle;
use crate::row::{RefPosition, Row, RowId, RowShape, Value};
use crate::storage::relation::RelationSet;
use crate::transaction::{IsolationLevel, Session, TransactionStatus, TxnId, pass_transaction};

/// What the storage object is doing right now, for hooks that need to
/// know what triggered them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Seek,
    None,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Seek => "SEEK",
            Operation::None => "NONE",
        };
        f.write_str(name)
    }
}

/// One stored version of a row, as the row directory records it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRef {
    pub position: RefPosition,
    pub pages: u32,
    /// Writer of this version, or of the version that superseded it
    pub row_version: u64,
    pub outdated: bool,
    /// Stamp held before an uncommitted writer outdated this version
    pub prior_version: u64,
}

/// Trigger-style callbacks around each mutation; returning an error vetoes
/// the operation.
pub trait RowEventHook: Send {
    fn before(&mut self, _operation: Operation, _row: &Row) -> Result<(), String> {
        Ok(())
    }

    fn after(&mut self, _operation: Operation, _row: &Row) -> Result<(), String> {
        Ok(())
    }
}

/// How a concrete row set stores its rows. The storage object drives
/// these stages in a fixed order.
pub trait RowPersistence: IdentitySource + Sized {
    fn table_id(&self) -> TableId;
    fn table_name(&self) -> String;
    fn shape(&self) -> RowShape;
    fn is_read_only(&self) -> bool;
    fn repair_mode(&self) -> bool;

    /// Nearest row id strictly after (`forward`) or before `from`, with all
    /// of its stored versions
    fn scan(&self, from: RowId, forward: bool) -> StrataResult<Option<(RowId, Vec<VersionRef>)>>;
    fn versions(&self, row_id: RowId) -> StrataResult<Vec<VersionRef>>;
    /// Status of the transaction stamped into a version
    fn writer_status(&self, row_version: u64) -> TransactionStatus;
    fn read_row(&self, row_id: RowId, version: &VersionRef, row: &mut Row) -> StrataResult<()>;

    fn allocate_row_id(&mut self) -> StrataResult<RowId>;
    fn insert_row(&mut self, row: &mut Row, txn: TxnId) -> StrataResult<()>;
    fn update_row(&mut self, row: &mut Row, txn: TxnId) -> StrataResult<()>;
    fn delete_row(&mut self, row_id: RowId, txn: TxnId) -> StrataResult<()>;
    /// Directly to the header outside a transaction, to the log inside one
    fn adjust_row_count(&mut self, delta: i64, txn: TxnId);
    fn row_count(&self, txn: TxnId) -> u64;

    /// Make the unit of work durable, or undo it
    fn finalize(&mut self, commit: bool) -> StrataResult<()>;
    fn has_pending(&self) -> bool;
    fn default_row(&self) -> Row;

    /// Open another row set of the same database for cascades
    fn open_related(&self, table: &str, session: &Arc<Session>) -> StrataResult<StorageObject<Self>>;
}

/// Opens relationship partners on behalf of a storage object
pub struct PartnerOpener<'a, P: RowPersistence> {
    persistence: &'a P,
    session: &'a Arc<Session>,
}

impl<P: RowPersistence> PartnerOpener<'_, P> {
    pub fn open(&self, table: &str) -> StrataResult<StorageObject<P>> {
        self.persistence.open_related(table, self.session)
    }
}

pub struct StorageObject<P: RowPersistence> {
    persistence: P,
    session: Arc<Session>,
    locks: LockHandle,
    name: String,
    shape: RowShape,
    current: Row,
    satellite: Row,
    top: Row,
    bottom: Row,
    default: Row,
    operation: Operation,
    read_only: bool,
    repair_mode: bool,
    filters: FilterCollection,
    relations: RelationSet<P>,
    hooks: Vec<Box<dyn RowEventHook>>,
    postpone_unlock: bool,
    held_rows: Vec<RowId>,
}

impl<P: RowPersistence> StorageObject<P> {
    pub fn new(persistence: P, session: Arc<Session>, locks: LockHandle, read_only: bool) -> Self {
        let shape = persistence.shape();
        let name = persistence.table_name();
        let columns = shape.len();

        let mut top = Row::new(columns);
        top.set_row_id(RowId::MIN);
        let mut bottom = Row::new(columns);
        bottom.set_row_id(RowId::MAX);

        Self {
            repair_mode: persistence.repair_mode(),
            default: persistence.default_row(),
            relations: RelationSet::new(&name),
            persistence,
            session,
            locks,
            name,
            current: Row::new(columns),
            satellite: Row::new(columns),
            top,
            bottom,
            shape,
            operation: Operation::None,
            read_only,
            filters: FilterCollection::new(),
            hooks: Vec::new(),
            postpone_unlock: false,
            held_rows: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &RowShape {
        &self.shape
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    pub fn persistence_mut(&mut self) -> &mut P {
        &mut self.persistence
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn locks(&self) -> &LockHandle {
        &self.locks
    }

    /// Running transaction, `TxnId::NONE` outside one
    pub fn transaction_id(&self) -> TxnId {
        self.session.transaction_id()
    }

    /// Readers outside a transaction always read committed data
    pub fn isolation(&self) -> IsolationLevel {
        if self.transaction_id().is_none() {
            IsolationLevel::ReadCommitted
        } else {
            self.session.isolation()
        }
    }

    pub fn current_operation(&self) -> Operation {
        self.operation
    }

    pub fn current(&self) -> &Row {
        &self.current
    }

    pub fn satellite(&self) -> &Row {
        &self.satellite
    }

    pub fn satellite_mut(&mut self) -> &mut Row {
        &mut self.satellite
    }

    pub fn default_row(&self) -> &Row {
        &self.default
    }

    /// Reload the default row after a schema change
    pub fn refresh_default_row(&mut self) {
        self.default = self.persistence.default_row();
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only || self.persistence.is_read_only()
    }

    pub fn filters(&self) -> &FilterCollection {
        &self.filters
    }

    pub fn filters_mut(&mut self) -> &mut FilterCollection {
        &mut self.filters
    }

    pub fn relations(&self) -> &RelationSet<P> {
        &self.relations
    }

    pub fn relations_mut(&mut self) -> &mut RelationSet<P> {
        &mut self.relations
    }

    pub fn add_hook(&mut self, hook: Box<dyn RowEventHook>) {
        self.hooks.push(hook);
    }

    /// Keep row locks after finalizing, for compound operations
    pub fn set_postpone_unlock(&mut self, postpone: bool) {
        self.postpone_unlock = postpone;
    }

    pub fn release_postponed(&mut self) {
        for row_id in self.held_rows.drain(..) {
            self.locks.unlock_row(row_id);
        }
    }

    pub fn lock_storage(&self) -> StrataResult<()> {
        self.locks.lock_storage()
    }

    pub fn unlock_storage(&self) {
        self.locks.unlock_storage();
    }

    // Cursor

    pub fn eof(&self) -> bool {
        self.current.row_id() == RowId::MAX
    }

    pub fn bof(&self) -> bool {
        self.current.row_id() == RowId::MIN
    }

    /// Restrict the cursor to `low..=high`
    pub fn set_scope(&mut self, low: RowId, high: RowId) {
        self.top.set_row_id(low);
        self.bottom.set_row_id(high);
    }

    pub fn clear_scope(&mut self) {
        self.set_scope(RowId::MIN, RowId::MAX);
    }

    fn in_scope(&self, row_id: RowId) -> bool {
        row_id >= self.top.row_id() && row_id <= self.bottom.row_id()
    }

    pub(crate) fn move_to_eof(&mut self) {
        self.current.clear();
        self.current.set_row_id(RowId::MAX);
    }

    fn move_to_bof(&mut self) {
        self.current.clear();
        self.current.set_row_id(RowId::MIN);
    }

    /// The newest version of a row this handle may see. A version this
    /// transaction itself outdated is gone for it.
    ///
    /// An outdated version is ordered against the reader by the stamp it
    /// was written with; the status consulted is that of the writer that
    /// superseded it.
    fn visible_version(&self, versions: &[VersionRef]) -> Option<VersionRef> {
        let txn = self.transaction_id();
        let isolation = self.isolation();

        versions
            .iter()
            .rev()
            .find(|v| {
                if v.outdated && !txn.is_none() && v.row_version == txn.0 {
                    return false;
                }
                let status = self.persistence.writer_status(v.row_version);
                let written = if v.outdated { v.prior_version } else { v.row_version };
                pass_transaction(written, v.outdated, txn, status, isolation)
            })
            .copied()
    }

    /// Re-check bitmap rows written by a transaction that has since ended
    fn settle_bitmaps(&mut self) -> StrataResult<()> {
        let running = self.transaction_id();
        let Some((txn, changes)) = self.filters.take_finished(running) else {
            return Ok(());
        };
        let mut rows: Vec<RowId> = changes.iter().map(|c| c.row_id).collect();
        rows.sort();
        rows.dedup();

        let mut row = Row::new(self.shape.len());
        for row_id in rows {
            let versions = self.persistence.versions(row_id)?;
            let visible = self.visible_version(&versions);
            if let Some(version) = &visible {
                self.persistence.read_row(row_id, version, &mut row)?;
            }
            let kept = visible.is_some_and(|v| v.row_version == txn.0);
            self.filters
                .resettle(row_id, visible.map(|_| &row), kept, &changes)?;
        }
        debug!("Re-checked bitmap rows of {} on '{}'", txn, self.name);
        Ok(())
    }

    fn advance(&mut self, from: RowId, forward: bool) -> StrataResult<bool> {
        if let Err(e) = self.settle_bitmaps() {
            self.move_to_eof();
            return Err(e);
        }
        let previous = self.operation;
        self.operation = Operation::Seek;
        let found = self.advance_inner(from, forward);
        self.operation = previous;

        match found {
            Ok(true) => Ok(true),
            Ok(false) => {
                if forward {
                    self.move_to_eof();
                } else {
                    self.move_to_bof();
                }
                Ok(false)
            }
            Err(e) => {
                self.move_to_eof();
                Err(e)
            }
        }
    }

    fn advance_inner(&mut self, from: RowId, forward: bool) -> StrataResult<bool> {
        let mut cursor = from;
        while let Some((row_id, versions)) = self.persistence.scan(cursor, forward)? {
            cursor = row_id;
            if !self.in_scope(row_id) {
                return Ok(false);
            }
            if self.accept(row_id, &versions)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// MVCC rule, then bitmap filters, then ordinary filters. On success the
    /// row is loaded into `current`.
    fn accept(&mut self, row_id: RowId, versions: &[VersionRef]) -> StrataResult<bool> {
        let Some(version) = self.visible_version(versions) else {
            return Ok(false);
        };
        if !self.filters.pass_optimized_filters(row_id) {
            return Ok(false);
        }
        self.persistence
            .read_row(row_id, &version, &mut self.current)?;
        self.filters.pass_ordinary_filters(&self.current)
    }

    pub fn first(&mut self) -> StrataResult<bool> {
        let from = RowId(self.top.row_id().0.saturating_sub(1));
        self.advance(from, true)
    }

    pub fn last(&mut self) -> StrataResult<bool> {
        let from = RowId(self.bottom.row_id().0.saturating_add(1));
        self.advance(from, false)
    }

    pub fn next(&mut self) -> StrataResult<bool> {
        if self.eof() {
            return Ok(false);
        }
        let from = self.current.row_id();
        self.advance(from, true)
    }

    pub fn prev(&mut self) -> StrataResult<bool> {
        if self.bof() {
            return Ok(false);
        }
        let from = self.current.row_id();
        self.advance(from, false)
    }

    /// Position on `row_id` if this handle can see it
    pub fn seek(&mut self, row_id: RowId) -> StrataResult<bool> {
        if !row_id.is_valid() || !self.in_scope(row_id) {
            self.move_to_eof();
            return Ok(false);
        }

        let previous = self.operation;
        self.operation = Operation::Seek;
        let found = self
            .settle_bitmaps()
            .and_then(|()| self.persistence.versions(row_id))
            .and_then(|versions| self.accept(row_id, &versions));
        self.operation = previous;

        match found {
            Ok(true) => Ok(true),
            other => {
                self.move_to_eof();
                other
            }
        }
    }

    /// Rows visible to this handle's transaction
    pub fn row_count(&self) -> u64 {
        self.persistence.row_count(self.transaction_id())
    }

    /// Re-read the current row with relationships frozen
    pub fn reload_current(&mut self) -> StrataResult<bool> {
        let row_id = self.current.row_id();
        self.relations.freeze();
        let found = self.seek(row_id);
        self.relations.unfreeze();
        found
    }

    /// Visit every row visible to this transaction, ignoring row filters
    pub fn for_each_visible<F>(&self, mut visit: F) -> StrataResult<()>
    where
        F: FnMut(&Row) -> StrataResult<()>,
    {
        let mut row = Row::new(self.shape.len());
        let mut cursor = RowId::MIN;
        while let Some((row_id, versions)) = self.persistence.scan(cursor, true)? {
            cursor = row_id;
            if let Some(version) = self.visible_version(&versions) {
                self.persistence.read_row(row_id, &version, &mut row)?;
                visit(&row)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, column: &str) -> StrataResult<&Value> {
        let index = self.column_index(column)?;
        Ok(self.current.value(index))
    }

    /// Edit the satellite row
    pub fn set(&mut self, column: &str, value: Value) -> StrataResult<()> {
        let index = self.column_index(column)?;
        self.satellite.set_value(index, value);
        Ok(())
    }

    pub fn column_index(&self, column: &str) -> StrataResult<usize> {
        self.shape
            .index_of(column)
            .ok_or_else(|| StrataError::NotFound(format!("column '{}.{}'", self.name, column)))
    }

    // Filters

    pub fn attach_ordinary_filter(
        &mut self,
        predicate: Arc<dyn Evaluator>,
        priority: i32,
    ) -> StrataResult<FilterId> {
        self.filters
            .attach_filter(FilterType::Ordinary, priority, FilterBody::Predicate(predicate))
    }

    /// Evaluate `predicate` once over all visible rows into a bitmap
    pub fn attach_optimized_filter(
        &mut self,
        predicate: Arc<dyn Evaluator>,
        priority: i32,
    ) -> StrataResult<FilterId> {
        let mut rows = Vec::new();
        let mut capacity = 1;
        self.for_each_visible(|row| {
            capacity = capacity.max(row.row_id().0 as usize + 1);
            rows.push(row.clone());
            Ok(())
        })?;

        let map = RowFilter::build(capacity, rows.iter(), predicate.as_ref())?;
        debug!(
            "Optimized filter on '{}' matches {} of {} rows",
            self.name,
            map.count(),
            rows.len()
        );
        self.filters.attach_filter(
            FilterType::Optimized,
            priority,
            FilterBody::Bitmap {
                map,
                source: Some(predicate),
            },
        )
    }

    pub fn detach_filter(&mut self, id: FilterId) -> bool {
        self.filters.detach_filter(id).is_some()
    }

    // Modification pipeline

    /// Load the default row into the satellite, nothing marked edited
    pub fn prepare_insert(&mut self) {
        self.satellite.clear();
        for column in 0..self.shape.len() {
            self.satellite
                .put_value(column, self.default.value(column).clone());
        }
    }

    /// Start editing the current row
    pub fn prepare_update(&mut self) {
        self.satellite.copy_from(&self.current);
        self.satellite.clear_edits();
    }

    fn check_writable(&mut self) -> StrataResult<()> {
        if self.is_read_only() {
            return Err(StrataError::ReadOnly {
                table: self.name.clone(),
            });
        }
        self.settle_bitmaps()
    }

    fn check_positioned(&self) -> StrataResult<()> {
        if !self.current.row_id().is_valid() {
            return Err(StrataError::NotFound(format!(
                "no current row in '{}'",
                self.name
            )));
        }
        Ok(())
    }

    fn validate(&self, row: &Row) -> StrataResult<()> {
        for (index, column) in self.shape.columns().iter().enumerate() {
            let value = row.value(index);
            if !column.data_type.accepts(value) {
                return Err(StrataError::InvalidInput(format!(
                    "Column '{}.{}' cannot hold {}",
                    self.name,
                    column.name,
                    value.type_name()
                )));
            }
            if value.is_null() && !column.nullable {
                return Err(StrataError::InvalidInput(format!(
                    "Column '{}.{}' does not allow NULL",
                    self.name, column.name
                )));
            }
        }
        Ok(())
    }

    fn fire_hooks(
        hooks: &mut [Box<dyn RowEventHook>],
        table: &str,
        operation: Operation,
        row: &Row,
        before: bool,
    ) -> StrataResult<()> {
        for hook in hooks.iter_mut() {
            let outcome = if before {
                hook.before(operation, row)
            } else {
                hook.after(operation, row)
            };
            if let Err(reason) = outcome {
                return Err(StrataError::Vetoed {
                    table: table.to_string(),
                    operation,
                    reason,
                });
            }
        }
        Ok(())
    }

    fn lock_row(&mut self, row_id: RowId) -> StrataResult<()> {
        self.locks.lock_row(row_id)?;
        self.held_rows.push(row_id);
        Ok(())
    }

    fn cascade(&mut self, operation: Operation) -> StrataResult<()> {
        let opener = PartnerOpener {
            persistence: &self.persistence,
            session: &self.session,
        };
        match operation {
            Operation::Insert => self.relations.create(&self.satellite, &opener),
            Operation::Update => self
                .relations
                .update(&self.current, &self.satellite, &opener),
            Operation::Delete => self.relations.delete(&self.current, &opener),
            _ => Ok(()),
        }
    }

    /// Check that `row` references existing master rows
    pub fn check_references(&mut self, row: &Row) -> StrataResult<()> {
        let opener = PartnerOpener {
            persistence: &self.persistence,
            session: &self.session,
        };
        self.relations.create(row, &opener)
    }

    /// Position the partner of `relation` on the first row related to the
    /// current row
    pub fn related(&mut self, relation: &str) -> StrataResult<&mut StorageObject<P>> {
        let opener = PartnerOpener {
            persistence: &self.persistence,
            session: &self.session,
        };
        self.relations.activate(relation, &self.current, &opener)
    }

    /// Insert the satellite row. With `blank` the satellite is first reset
    /// to the table defaults.
    pub fn create_row(&mut self, commit: bool, blank: bool) -> StrataResult<()> {
        self.check_writable()?;
        if blank {
            self.prepare_insert();
        }

        self.operation = Operation::Insert;
        let suppressed = self
            .filters
            .suppress_generators(Operation::Insert, &self.satellite);
        let result = self.do_create_row();
        self.filters.restore_generators(&suppressed);
        self.complete(result, commit)
    }

    /// Write the satellite row over the current row
    pub fn update_row(&mut self, commit: bool) -> StrataResult<()> {
        self.check_writable()?;
        self.check_positioned()?;

        self.operation = Operation::Update;
        let suppressed = self
            .filters
            .suppress_generators(Operation::Update, &self.satellite);
        let result = self.do_update_row();
        self.filters.restore_generators(&suppressed);
        self.complete(result, commit)
    }

    pub fn delete_row(&mut self, commit: bool) -> StrataResult<()> {
        self.check_writable()?;
        self.check_positioned()?;

        self.operation = Operation::Delete;
        let result = self.do_delete_row();
        self.complete(result, commit)
    }

    fn do_create_row(&mut self) -> StrataResult<()> {
        let row_id = self.persistence.allocate_row_id()?;
        self.satellite.set_row_id(row_id);
        self.lock_row(row_id)?;

        Self::fire_hooks(&mut self.hooks, &self.name, Operation::Insert, &self.satellite, true)?;
        let mut ctx = FilterContext {
            table: &self.name,
            shape: &self.shape,
            identity: &mut self.persistence,
            repair_mode: self.repair_mode,
        };
        self.filters.run_before_create(&mut self.satellite, &mut ctx)?;
        self.validate(&self.satellite)?;

        let txn = self.transaction_id();
        self.persistence.insert_row(&mut self.satellite, txn)?;
        self.cascade(Operation::Insert)?;

        self.persistence.adjust_row_count(1, txn);
        self.filters.sync_optimized(row_id, Some(&self.satellite))?;

        let ctx = FilterContext {
            table: &self.name,
            shape: &self.shape,
            identity: &mut self.persistence,
            repair_mode: self.repair_mode,
        };
        self.filters
            .run_after(Operation::Insert, &self.satellite, &ctx)?;
        Self::fire_hooks(&mut self.hooks, &self.name, Operation::Insert, &self.satellite, false)?;

        self.current.copy_from(&self.satellite);
        Ok(())
    }

    fn do_update_row(&mut self) -> StrataResult<()> {
        let row_id = self.current.row_id();
        self.satellite.set_row_id(row_id);
        self.lock_row(row_id)?;

        Self::fire_hooks(&mut self.hooks, &self.name, Operation::Update, &self.satellite, true)?;
        let mut ctx = FilterContext {
            table: &self.name,
            shape: &self.shape,
            identity: &mut self.persistence,
            repair_mode: self.repair_mode,
        };
        self.filters
            .run_before_update(&mut self.satellite, &self.current, &mut ctx)?;
        self.validate(&self.satellite)?;

        let txn = self.transaction_id();
        self.persistence.update_row(&mut self.satellite, txn)?;
        self.cascade(Operation::Update)?;

        self.filters.sync_optimized(row_id, Some(&self.satellite))?;

        let ctx = FilterContext {
            table: &self.name,
            shape: &self.shape,
            identity: &mut self.persistence,
            repair_mode: self.repair_mode,
        };
        self.filters
            .run_after(Operation::Update, &self.satellite, &ctx)?;
        Self::fire_hooks(&mut self.hooks, &self.name, Operation::Update, &self.satellite, false)?;

        self.current.copy_from(&self.satellite);
        Ok(())
    }

    fn do_delete_row(&mut self) -> StrataResult<()> {
        let row_id = self.current.row_id();
        self.lock_row(row_id)?;

        Self::fire_hooks(&mut self.hooks, &self.name, Operation::Delete, &self.current, true)?;

        let txn = self.transaction_id();
        self.persistence.delete_row(row_id, txn)?;
        self.cascade(Operation::Delete)?;

        self.persistence.adjust_row_count(-1, txn);
        self.filters.sync_optimized(row_id, None)?;

        let ctx = FilterContext {
            table: &self.name,
            shape: &self.shape,
            identity: &mut self.persistence,
            repair_mode: self.repair_mode,
        };
        self.filters.run_after(Operation::Delete, &self.current, &ctx)?;
        Self::fire_hooks(&mut self.hooks, &self.name, Operation::Delete, &self.current, false)?;
        Ok(())
    }

    /// Step 8: finalize on success when asked to, undo on failure
    fn complete(&mut self, result: StrataResult<()>, commit: bool) -> StrataResult<()> {
        let outcome = match result {
            Ok(()) if commit => self.finalize_changes(true),
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("{} on '{}' failed: {}", self.operation, self.name, e);
                if let Err(undo) = self.finalize_changes(false) {
                    warn!("Undo after failed {} on '{}' failed: {}", self.operation, self.name, undo);
                }
                Err(e)
            }
        };

        if outcome.is_err() {
            self.move_to_eof();
            self.satellite.clear();
        }
        self.satellite.clear_edits();
        self.operation = Operation::None;
        outcome
    }

    /// Commit or undo everything since the last finalize, partners
    /// included. Relationships stay masked meanwhile.
    pub fn finalize_changes(&mut self, commit: bool) -> StrataResult<()> {
        self.relations.freeze();
        let partners = self.relations.finalize_partners(commit);
        self.relations.unfreeze();

        let own = self.persistence.finalize(commit);
        match (commit, &own) {
            (true, Ok(())) => self.filters.commit_bitmaps(self.transaction_id()),
            _ => self.filters.rollback_bitmaps(),
        }

        if !self.postpone_unlock {
            self.release_postponed();
        }
        self.satellite.clear_edits();
        partners.and(own)
    }
}

impl<P: RowPersistence> Drop for StorageObject<P> {
    fn drop(&mut self) {
        if self.persistence.has_pending() || self.relations.has_pending() {
            if let Err(e) = self.finalize_changes(false) {
                warn!("Discarding pending changes of '{}' failed: {}", self.name, e);
            }
        }
        self.release_postponed();
    }
}
