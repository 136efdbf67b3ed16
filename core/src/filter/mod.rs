//! Typed, prioritized filters attached to a storage object.
//!
//! Each filter category lives in its own bucket. Predicate buckets decide
//! whether a row is visible through a cursor; the before/after buckets run
//! around row mutations to generate identities and default values, guard
//! read-only columns and check constraints.

pub mod bitmap;

use std::sync::Arc;

use tracing::warn;

use crate::error::{StrataError, StrataResult};
use crate::expression::{Evaluator, truth};
use crate::row::{Row, RowId, RowShape, Value};
use crate::storage::Operation;
use crate::transaction::TxnId;

pub use bitmap::{RowFilter, TriState};

pub type FilterId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    Ordinary,
    Optimized,
    Identity,
    DefaultValueInsert,
    DefaultValueUpdate,
    ReadOnly,
    ConstraintInsert,
    ConstraintUpdate,
    ConstraintDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Ordinary,
    Optimized,
    BeforeCreate,
    BeforeUpdate,
    AfterCreate,
    AfterUpdate,
    AfterDelete,
}

impl FilterType {
    fn bucket(self) -> Bucket {
        match self {
            FilterType::Ordinary => Bucket::Ordinary,
            FilterType::Optimized => Bucket::Optimized,
            FilterType::Identity | FilterType::DefaultValueInsert => Bucket::BeforeCreate,
            FilterType::DefaultValueUpdate | FilterType::ReadOnly => Bucket::BeforeUpdate,
            FilterType::ConstraintInsert => Bucket::AfterCreate,
            FilterType::ConstraintUpdate => Bucket::AfterUpdate,
            FilterType::ConstraintDelete => Bucket::AfterDelete,
        }
    }
}

/// What a filter does
#[derive(Debug, Clone)]
pub enum FilterBody {
    /// Row passes when the expression is true
    Predicate(Arc<dyn Evaluator>),
    /// Precomputed row map; `source`, when known, re-evaluates rows that
    /// are written after the map was built
    Bitmap {
        map: RowFilter,
        source: Option<Arc<dyn Evaluator>>,
    },
    Identity {
        column: usize,
        seed: i64,
        step: i64,
    },
    DefaultValue {
        column: usize,
        evaluator: Arc<dyn Evaluator>,
    },
    ReadOnly {
        column: usize,
    },
    Constraint {
        name: String,
        evaluator: Arc<dyn Evaluator>,
    },
}

impl FilterBody {
    fn fits(&self, filter_type: FilterType) -> bool {
        matches!(
            (filter_type, self),
            (FilterType::Ordinary, FilterBody::Predicate(_))
                | (FilterType::Optimized, FilterBody::Bitmap { .. })
                | (FilterType::Identity, FilterBody::Identity { .. })
                | (FilterType::DefaultValueInsert, FilterBody::DefaultValue { .. })
                | (FilterType::DefaultValueUpdate, FilterBody::DefaultValue { .. })
                | (FilterType::ReadOnly, FilterBody::ReadOnly { .. })
                | (FilterType::ConstraintInsert, FilterBody::Constraint { .. })
                | (FilterType::ConstraintUpdate, FilterBody::Constraint { .. })
                | (FilterType::ConstraintDelete, FilterBody::Constraint { .. })
        )
    }

    /// Target column of a generator or guard
    pub fn column(&self) -> Option<usize> {
        match self {
            FilterBody::Identity { column, .. }
            | FilterBody::DefaultValue { column, .. }
            | FilterBody::ReadOnly { column } => Some(*column),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub id: FilterId,
    pub filter_type: FilterType,
    pub priority: i32,
    pub active: bool,
    pub body: FilterBody,
}

/// Supplies identity values; the table keeps the high-water mark in its
/// default row.
pub trait IdentitySource {
    fn next_identity(&mut self, column: usize, seed: i64, step: i64) -> StrataResult<i64>;

    /// Record an explicitly supplied identity value
    fn observe_identity(&mut self, column: usize, value: i64, step: i64) -> StrataResult<()>;
}

/// Everything the mutation buckets need besides the row itself
pub struct FilterContext<'a> {
    pub table: &'a str,
    pub shape: &'a RowShape,
    pub identity: &'a mut dyn IdentitySource,
    pub repair_mode: bool,
}

impl FilterContext<'_> {
    /// Generator failures become warnings in repair mode
    fn tolerate_result(&self, result: StrataResult<()>) -> StrataResult<()> {
        match result {
            Err(error) if self.repair_mode && error.is_repairable() => {
                warn!("Repair mode: ignoring {}", error);
                Ok(())
            }
            other => other,
        }
    }
}

/// Bitmap state a write replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapChange {
    pub filter: FilterId,
    pub row_id: RowId,
    pub prior: TriState,
}

#[derive(Debug, Default)]
pub struct FilterCollection {
    next_id: FilterId,
    /// Bitmap writes of the open unit of work
    pending: Vec<BitmapChange>,
    /// Finalized bitmap writes of a transaction that has not ended yet
    transactional: Vec<BitmapChange>,
    transaction: TxnId,
    ordinary: Vec<Filter>,
    optimized: Vec<Filter>,
    before_create: Vec<Filter>,
    before_update: Vec<Filter>,
    after_create: Vec<Filter>,
    after_update: Vec<Filter>,
    after_delete: Vec<Filter>,
}

impl FilterCollection {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, bucket: Bucket) -> &Vec<Filter> {
        match bucket {
            Bucket::Ordinary => &self.ordinary,
            Bucket::Optimized => &self.optimized,
            Bucket::BeforeCreate => &self.before_create,
            Bucket::BeforeUpdate => &self.before_update,
            Bucket::AfterCreate => &self.after_create,
            Bucket::AfterUpdate => &self.after_update,
            Bucket::AfterDelete => &self.after_delete,
        }
    }

    fn bucket_mut(&mut self, bucket: Bucket) -> &mut Vec<Filter> {
        match bucket {
            Bucket::Ordinary => &mut self.ordinary,
            Bucket::Optimized => &mut self.optimized,
            Bucket::BeforeCreate => &mut self.before_create,
            Bucket::BeforeUpdate => &mut self.before_update,
            Bucket::AfterCreate => &mut self.after_create,
            Bucket::AfterUpdate => &mut self.after_update,
            Bucket::AfterDelete => &mut self.after_delete,
        }
    }

    fn buckets_mut(&mut self) -> [&mut Vec<Filter>; 7] {
        [
            &mut self.ordinary,
            &mut self.optimized,
            &mut self.before_create,
            &mut self.before_update,
            &mut self.after_create,
            &mut self.after_update,
            &mut self.after_delete,
        ]
    }

    /// Highest priority first; equal priorities keep attach order
    fn sorted(&mut self, bucket: Bucket) -> &mut Vec<Filter> {
        let filters = self.bucket_mut(bucket);
        filters.sort_by(|a, b| b.priority.cmp(&a.priority));
        filters
    }

    pub fn attach_filter(
        &mut self,
        filter_type: FilterType,
        priority: i32,
        body: FilterBody,
    ) -> StrataResult<FilterId> {
        if !body.fits(filter_type) {
            return Err(StrataError::InvalidInput(format!(
                "Filter body does not match filter type {:?}",
                filter_type
            )));
        }

        self.next_id += 1;
        let id = self.next_id;
        self.bucket_mut(filter_type.bucket()).push(Filter {
            id,
            filter_type,
            priority,
            active: true,
            body,
        });
        Ok(id)
    }

    pub fn detach_filter(&mut self, id: FilterId) -> Option<Filter> {
        for bucket in self.buckets_mut() {
            if let Some(index) = bucket.iter().position(|f| f.id == id) {
                return Some(bucket.remove(index));
            }
        }
        None
    }

    /// Remove every filter of a type; returns how many went
    pub fn detach_filters_by_type(&mut self, filter_type: FilterType) -> usize {
        let bucket = self.bucket_mut(filter_type.bucket());
        let before = bucket.len();
        bucket.retain(|f| f.filter_type != filter_type);
        before - bucket.len()
    }

    /// Detach the generator or guard of `filter_type` bound to `column`
    pub fn detach_column_filter(&mut self, filter_type: FilterType, column: usize) -> usize {
        let bucket = self.bucket_mut(filter_type.bucket());
        let before = bucket.len();
        bucket.retain(|f| !(f.filter_type == filter_type && f.body.column() == Some(column)));
        before - bucket.len()
    }

    /// Detach the constraint filters called `name`
    pub fn detach_constraint(&mut self, name: &str) -> usize {
        let mut removed = 0;
        for bucket in self.buckets_mut() {
            let before = bucket.len();
            bucket.retain(|f| {
                !matches!(&f.body, FilterBody::Constraint { name: n, .. } if n.eq_ignore_ascii_case(name))
            });
            removed += before - bucket.len();
        }
        removed
    }

    pub fn filter(&self, id: FilterId) -> Option<&Filter> {
        [
            &self.ordinary,
            &self.optimized,
            &self.before_create,
            &self.before_update,
            &self.after_create,
            &self.after_update,
            &self.after_delete,
        ]
        .into_iter()
        .flat_map(|bucket| bucket.iter())
        .find(|f| f.id == id)
    }

    pub fn filter_mut(&mut self, id: FilterId) -> Option<&mut Filter> {
        self.buckets_mut()
            .into_iter()
            .flat_map(|bucket| bucket.iter_mut())
            .find(|f| f.id == id)
    }

    /// Toggle a filter without removing it
    pub fn set_active(&mut self, id: FilterId, active: bool) -> bool {
        match self.filter_mut(id) {
            Some(filter) => {
                filter.active = active;
                true
            }
            None => false,
        }
    }

    pub fn count(&self, filter_type: FilterType) -> usize {
        self.bucket(filter_type.bucket())
            .iter()
            .filter(|f| f.filter_type == filter_type)
            .count()
    }

    pub fn has_row_filters(&self) -> bool {
        self.ordinary.iter().chain(&self.optimized).any(|f| f.active)
    }

    /// Evaluate active predicates; stops at the first that does not hold.
    /// NULL counts as failing.
    pub fn pass_ordinary_filters(&mut self, row: &Row) -> StrataResult<bool> {
        for filter in self.sorted(Bucket::Ordinary).iter() {
            if !filter.active {
                continue;
            }
            if let FilterBody::Predicate(evaluator) = &filter.body {
                if truth(&evaluator.exec(row)?)? != Some(true) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    pub fn pass_optimized_filters(&mut self, row_id: RowId) -> bool {
        self.sorted(Bucket::Optimized).iter().all(|filter| {
            !filter.active
                || match &filter.body {
                    FilterBody::Bitmap { map, .. } => map.get_valid_status(row_id),
                    _ => true,
                }
        })
    }

    /// Keep bitmap filters in step with a row that was written (`Some`) or
    /// removed (`None`). The replaced states are journaled until the unit
    /// of work is finalized.
    pub fn sync_optimized(&mut self, row_id: RowId, row: Option<&Row>) -> StrataResult<()> {
        for filter in self.optimized.iter_mut() {
            if let FilterBody::Bitmap { map, source } = &mut filter.body {
                let state = match (row, source) {
                    (None, _) => TriState::False,
                    (Some(row), Some(source)) => TriState::from(truth(&source.exec(row)?)?),
                    (Some(_), None) => TriState::True,
                };
                self.pending.push(BitmapChange {
                    filter: filter.id,
                    row_id,
                    prior: map.get(row_id),
                });
                map.set(row_id, state);
            }
        }
        Ok(())
    }

    fn bitmap_mut(&mut self, id: FilterId) -> Option<(&mut RowFilter, &Option<Arc<dyn Evaluator>>)> {
        self.optimized
            .iter_mut()
            .find(|f| f.id == id)
            .and_then(|f| match &mut f.body {
                FilterBody::Bitmap { map, source } => Some((map, &*source)),
                _ => None,
            })
    }

    /// Write back what the open unit of work changed in the bitmaps
    pub fn rollback_bitmaps(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for change in pending.iter().rev() {
            if let Some((map, _)) = self.bitmap_mut(change.filter) {
                map.set(change.row_id, change.prior);
            }
        }
    }

    /// Accept the open unit of work. Inside a transaction its bitmap writes
    /// stay journaled until the transaction ends.
    pub fn commit_bitmaps(&mut self, txn: TxnId) {
        if txn.is_none() {
            self.pending.clear();
            return;
        }
        if self.transaction != txn {
            self.transactional.clear();
            self.transaction = txn;
        }
        self.transactional.append(&mut self.pending);
    }

    /// Journaled writes of a transaction other than `current`, which has
    /// therefore ended
    pub fn take_finished(&mut self, current: TxnId) -> Option<(TxnId, Vec<BitmapChange>)> {
        if self.transactional.is_empty() || self.transaction == current {
            return None;
        }
        let changes = std::mem::take(&mut self.transactional);
        Some((std::mem::replace(&mut self.transaction, TxnId::NONE), changes))
    }

    /// Bring one row of every bitmap back in line after its transaction
    /// ended. `row` is the version now visible, `kept` tells whether that
    /// version is the transaction's own write. Bitmaps without a source
    /// predicate fall back to the state the transaction found.
    pub fn resettle(
        &mut self,
        row_id: RowId,
        row: Option<&Row>,
        kept: bool,
        changes: &[BitmapChange],
    ) -> StrataResult<()> {
        let ids: Vec<FilterId> = self.optimized.iter().map(|f| f.id).collect();
        for id in ids {
            let Some((map, source)) = self.bitmap_mut(id) else {
                continue;
            };
            let state = match (row, source) {
                (None, _) => TriState::False,
                (Some(row), Some(source)) => TriState::from(truth(&source.exec(row)?)?),
                (Some(_), None) if kept => continue,
                (Some(_), None) => match changes
                    .iter()
                    .find(|c| c.filter == id && c.row_id == row_id)
                {
                    Some(change) => change.prior,
                    None => continue,
                },
            };
            map.set(row_id, state);
        }
        Ok(())
    }

    /// Deactivate default-value generators whose column the caller already
    /// set. Returns the filters to re-enable once the operation is over.
    pub fn suppress_generators(&mut self, operation: Operation, row: &Row) -> Vec<FilterId> {
        let bucket = match operation {
            Operation::Insert => Bucket::BeforeCreate,
            Operation::Update => Bucket::BeforeUpdate,
            _ => return Vec::new(),
        };

        let mut suppressed = Vec::new();
        for filter in self.bucket_mut(bucket).iter_mut() {
            if let FilterBody::DefaultValue { column, .. } = filter.body {
                if filter.active && row.is_edited(column) {
                    filter.active = false;
                    suppressed.push(filter.id);
                }
            }
        }
        suppressed
    }

    pub fn restore_generators(&mut self, suppressed: &[FilterId]) {
        for id in suppressed {
            self.set_active(*id, true);
        }
    }

    /// Identities and insert defaults
    pub fn run_before_create(&mut self, row: &mut Row, ctx: &mut FilterContext<'_>) -> StrataResult<()> {
        for filter in self.sorted(Bucket::BeforeCreate).iter() {
            if !filter.active {
                continue;
            }
            match &filter.body {
                FilterBody::Identity { column, seed, step } => {
                    let result = assign_identity(row, *column, *seed, *step, ctx);
                    ctx.tolerate_result(result)?;
                }
                FilterBody::DefaultValue { column, evaluator } => {
                    let result = generate_default(row, *column, evaluator.as_ref(), ctx);
                    ctx.tolerate_result(result)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Read-only guards and update defaults; `old` is the stored version
    pub fn run_before_update(
        &mut self,
        row: &mut Row,
        old: &Row,
        ctx: &mut FilterContext<'_>,
    ) -> StrataResult<()> {
        for filter in self.sorted(Bucket::BeforeUpdate).iter() {
            if !filter.active {
                continue;
            }
            match &filter.body {
                FilterBody::ReadOnly { column } => {
                    if row.is_edited(*column) && row.value(*column) != old.value(*column) {
                        return Err(StrataError::ReadOnlyColumn {
                            table: ctx.table.to_string(),
                            column: ctx.shape.column_name(*column),
                        });
                    }
                }
                FilterBody::DefaultValue { column, evaluator } => {
                    let result = generate_default(row, *column, evaluator.as_ref(), ctx);
                    ctx.tolerate_result(result)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Constraint checks after a mutation. A NULL result passes.
    pub fn run_after(
        &mut self,
        operation: Operation,
        row: &Row,
        ctx: &FilterContext<'_>,
    ) -> StrataResult<()> {
        let bucket = match operation {
            Operation::Insert => Bucket::AfterCreate,
            Operation::Update => Bucket::AfterUpdate,
            Operation::Delete => Bucket::AfterDelete,
            _ => return Ok(()),
        };

        for filter in self.sorted(bucket).iter() {
            if !filter.active {
                continue;
            }
            if let FilterBody::Constraint { name, evaluator } = &filter.body {
                if truth(&evaluator.exec(row)?)? == Some(false) {
                    return Err(StrataError::ConstraintViolation {
                        table: ctx.table.to_string(),
                        constraint: name.clone(),
                        operation,
                    });
                }
            }
        }
        Ok(())
    }
}

fn assign_identity(
    row: &mut Row,
    column: usize,
    seed: i64,
    step: i64,
    ctx: &mut FilterContext<'_>,
) -> StrataResult<()> {
    if row.is_edited(column) {
        match row.value(column) {
            Value::Integer(explicit) => {
                let explicit = *explicit;
                return ctx.identity.observe_identity(column, explicit, step);
            }
            Value::Null => {}
            other => {
                return Err(StrataError::Identity {
                    table: ctx.table.to_string(),
                    column: ctx.shape.column_name(column),
                    message: format!("expected INTEGER, got {}", other.type_name()),
                });
            }
        }
    }

    let next = ctx.identity.next_identity(column, seed, step)?;
    row.put_value(column, Value::Integer(next));
    Ok(())
}

fn generate_default(
    row: &mut Row,
    column: usize,
    evaluator: &dyn Evaluator,
    ctx: &FilterContext<'_>,
) -> StrataResult<()> {
    match evaluator.exec(row) {
        Ok(value) => {
            let accepted = ctx
                .shape
                .column(column)
                .is_none_or(|c| c.data_type.accepts(&value));
            if !accepted {
                return Err(StrataError::DefaultValue {
                    table: ctx.table.to_string(),
                    column: ctx.shape.column_name(column),
                    message: format!("'{}' yields {}", evaluator.text(), value.type_name()),
                });
            }
            row.put_value(column, value);
            Ok(())
        }
        Err(e) => Err(StrataError::DefaultValue {
            table: ctx.table.to_string(),
            column: ctx.shape.column_name(column),
            message: e.to_string(),
        }),
    }
}
