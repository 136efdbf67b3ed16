//! Master/slave relationships between storage objects.
//!
//! Each relation holds a lazily opened partner storage object. Slave-side
//! relations check that a referenced master key exists; master-side
//! relations apply the referential action to matching slave rows. All
//! partner work runs inside the caller's unit of work and is finalized by
//! the owning storage object.

use tracing::debug;

use crate::catalog::{ForeignKeyDef, LinkKind, ReferentialAction};
use crate::error::{IntegrityViolation, StrataError, StrataResult};
use crate::row::{Row, RowId, RowShape, Value};
use crate::storage::object::{PartnerOpener, RowPersistence, StorageObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationRole {
    /// This table holds the primary key
    Master,
    /// This table holds the foreign key
    Slave,
}

pub struct Relation<P: RowPersistence> {
    pub name: String,
    pub role: RelationRole,
    pub kind: LinkKind,
    pub partner_table: String,
    pub local_columns: Vec<usize>,
    pub partner_columns: Vec<usize>,
    pub on_update: ReferentialAction,
    pub on_delete: ReferentialAction,
    pub active: bool,
    partner: Option<Box<StorageObject<P>>>,
    partner_locked: bool,
}

impl<P: RowPersistence> Relation<P> {
    /// Resolve a foreign key against both row shapes. As a slave the local
    /// side is the referencing table; as a master it is the referenced one.
    pub fn from_foreign_key(
        fk: &ForeignKeyDef,
        role: RelationRole,
        local: &RowShape,
        partner: &RowShape,
    ) -> StrataResult<Self> {
        let (local_names, partner_names, partner_table) = match role {
            RelationRole::Slave => (&fk.columns, &fk.referenced_columns, &fk.references),
            RelationRole::Master => (&fk.referenced_columns, &fk.columns, &fk.table),
        };

        if local_names.len() != partner_names.len() || local_names.is_empty() {
            return Err(StrataError::ReferentialIntegrity {
                relation: fk.name.clone(),
                table: fk.table.clone(),
                violation: IntegrityViolation::KeyMismatch,
            });
        }

        let resolve = |shape: &RowShape, names: &[String], table: &str| {
            names
                .iter()
                .map(|name| {
                    shape.index_of(name).ok_or_else(|| {
                        StrataError::NotFound(format!("column '{}.{}'", table, name))
                    })
                })
                .collect::<StrataResult<Vec<usize>>>()
        };
        let local_table = match role {
            RelationRole::Slave => &fk.table,
            RelationRole::Master => &fk.references,
        };

        Ok(Self {
            name: fk.name.clone(),
            role,
            kind: fk.kind,
            partner_table: partner_table.clone(),
            local_columns: resolve(local, local_names, local_table)?,
            partner_columns: resolve(partner, partner_names, partner_table)?,
            on_update: fk.on_update,
            on_delete: fk.on_delete,
            active: true,
            partner: None,
            partner_locked: false,
        })
    }

    pub fn is_open(&self) -> bool {
        self.partner.is_some()
    }

    fn partner(&mut self, opener: &PartnerOpener<'_, P>) -> StrataResult<&mut StorageObject<P>> {
        if self.partner.is_none() {
            debug!("Opening '{}' for relation '{}'", self.partner_table, self.name);
            self.partner = Some(Box::new(opener.open(&self.partner_table)?));
        }
        match self.partner.as_deref_mut() {
            Some(partner) => Ok(partner),
            None => Err(StrataError::NotFound(format!("table '{}'", self.partner_table))),
        }
    }

    /// Partner opened and storage-locked, ready for mutation
    fn partner_for_write(
        &mut self,
        opener: &PartnerOpener<'_, P>,
    ) -> StrataResult<&mut StorageObject<P>> {
        if !self.partner_locked {
            self.partner(opener)?.lock_storage()?;
            self.partner_locked = true;
        }
        self.partner(opener)
    }

    fn violation(&self, table: &str, violation: IntegrityViolation) -> StrataError {
        StrataError::ReferentialIntegrity {
            relation: self.name.clone(),
            table: table.to_string(),
            violation,
        }
    }
}

impl<P: RowPersistence> Drop for Relation<P> {
    fn drop(&mut self) {
        if self.partner_locked {
            if let Some(partner) = &self.partner {
                partner.unlock_storage();
            }
        }
    }
}

/// What a referential action does to one slave row
enum SlaveChange {
    Delete,
    Assign(Vec<Value>),
    AssignDefault,
}

fn key_is_null(key: &[Value]) -> bool {
    key.iter().any(Value::is_null)
}

fn keys_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

/// `Some(true)` when `row` carries `key` in `columns`; `None` when a
/// non-null pair cannot be compared at all.
fn key_matches(row: &Row, columns: &[usize], key: &[Value]) -> Option<bool> {
    for (column, wanted) in columns.iter().zip(key) {
        let value = row.value(*column);
        if value.is_null() {
            return Some(false);
        }
        if value.compare(wanted).is_none() {
            return None;
        }
        if !value.key_eq(wanted) {
            return Some(false);
        }
    }
    Some(true)
}

/// Rows of `partner` whose `columns` hold `key`. With `first_only` the scan
/// stops at the first hit.
fn find_matches<P: RowPersistence>(
    partner: &mut StorageObject<P>,
    relation: &str,
    columns: &[usize],
    key: &[Value],
    first_only: bool,
) -> StrataResult<Vec<RowId>> {
    let mut found = Vec::new();
    let mut more = partner.first()?;
    while more {
        match key_matches(partner.current(), columns, key) {
            Some(true) => {
                found.push(partner.current().row_id());
                if first_only {
                    break;
                }
            }
            Some(false) => {}
            None => {
                return Err(StrataError::ReferentialIntegrity {
                    relation: relation.to_string(),
                    table: partner.name().to_string(),
                    violation: IntegrityViolation::KeyMismatch,
                });
            }
        }
        more = partner.next()?;
    }
    Ok(found)
}

/// Relations of one storage object
pub struct RelationSet<P: RowPersistence> {
    table: String,
    relations: Vec<Relation<P>>,
    frozen: u32,
}

impl<P: RowPersistence> RelationSet<P> {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            relations: Vec::new(),
            frozen: 0,
        }
    }

    pub fn push(&mut self, relation: Relation<P>) {
        self.relations.push(relation);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.relations.len();
        self.relations.retain(|r| !r.name.eq_ignore_ascii_case(name));
        self.relations.len() != before
    }

    pub fn get(&self, name: &str) -> Option<&Relation<P>> {
        self.relations
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    pub fn set_active(&mut self, name: &str, active: bool) -> bool {
        match self
            .relations
            .iter_mut()
            .find(|r| r.name.eq_ignore_ascii_case(name))
        {
            Some(relation) => {
                relation.active = active;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relation<P>> {
        self.relations.iter()
    }

    /// Mask every relation; nests
    pub fn freeze(&mut self) {
        self.frozen += 1;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = self.frozen.saturating_sub(1);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen > 0
    }

    /// Any partner holding uncommitted work or a storage lock
    pub fn has_pending(&self) -> bool {
        self.relations.iter().any(|r| {
            r.partner_locked
                || r.partner
                    .as_ref()
                    .is_some_and(|p| p.persistence().has_pending())
        })
    }

    fn follows(&self, relation: &Relation<P>) -> bool {
        relation.active
            && self.frozen == 0
            && !relation.partner_table.eq_ignore_ascii_case(&self.table)
    }

    /// A new slave row must point at an existing master
    pub fn create(&mut self, row: &Row, opener: &PartnerOpener<'_, P>) -> StrataResult<()> {
        for index in 0..self.relations.len() {
            if !self.follows(&self.relations[index]) {
                continue;
            }
            let relation = &mut self.relations[index];
            if relation.role == RelationRole::Slave {
                let key = row.key(&relation.local_columns);
                Self::require_master(&self.table, relation, &key, opener)?;
            }
        }
        Ok(())
    }

    pub fn update(&mut self, old: &Row, new: &Row, opener: &PartnerOpener<'_, P>) -> StrataResult<()> {
        for index in 0..self.relations.len() {
            if !self.follows(&self.relations[index]) {
                continue;
            }
            let relation = &mut self.relations[index];
            let old_key = old.key(&relation.local_columns);
            let new_key = new.key(&relation.local_columns);
            if keys_equal(&old_key, &new_key) {
                continue;
            }

            match relation.role {
                RelationRole::Slave => {
                    Self::require_master(&self.table, relation, &new_key, opener)?;
                }
                RelationRole::Master => {
                    if key_is_null(&old_key) {
                        continue;
                    }
                    let action = relation.on_update;
                    Self::apply_action(&self.table, relation, action, &old_key, Some(&new_key), opener)?;
                }
            }
        }
        Ok(())
    }

    /// Master relations in reverse order of attachment
    pub fn delete(&mut self, old: &Row, opener: &PartnerOpener<'_, P>) -> StrataResult<()> {
        for index in (0..self.relations.len()).rev() {
            if !self.follows(&self.relations[index]) {
                continue;
            }
            let relation = &mut self.relations[index];
            if relation.role != RelationRole::Master {
                continue;
            }
            let key = old.key(&relation.local_columns);
            if key_is_null(&key) {
                continue;
            }
            let action = relation.on_delete;
            Self::apply_action(&self.table, relation, action, &key, None, opener)?;
        }
        Ok(())
    }

    fn require_master(
        table: &str,
        relation: &mut Relation<P>,
        key: &[Value],
        opener: &PartnerOpener<'_, P>,
    ) -> StrataResult<()> {
        if key_is_null(key) {
            return Ok(());
        }
        let name = relation.name.clone();
        let columns = relation.partner_columns.clone();
        let partner = relation.partner(opener)?;
        if find_matches(partner, &name, &columns, key, true)?.is_empty() {
            return Err(relation.violation(table, IntegrityViolation::MissingPrimaryKey));
        }
        Ok(())
    }

    /// Apply `action` to the slave rows holding `key`. `new_key` is the
    /// replacement on updates and `None` on deletes.
    fn apply_action(
        table: &str,
        relation: &mut Relation<P>,
        action: ReferentialAction,
        key: &[Value],
        new_key: Option<&[Value]>,
        opener: &PartnerOpener<'_, P>,
    ) -> StrataResult<()> {
        let name = relation.name.clone();
        let columns = relation.partner_columns.clone();
        let slaves = {
            let partner = relation.partner(opener)?;
            find_matches(partner, &name, &columns, key, false)?
        };

        if slaves.is_empty() {
            if relation.kind == LinkKind::OneToOne {
                return Err(relation.violation(table, IntegrityViolation::MissingPartner));
            }
            return Ok(());
        }
        let change = match (action, new_key) {
            (ReferentialAction::NoAction, _) => {
                return Err(relation.violation(table, IntegrityViolation::StillReferenced));
            }
            (ReferentialAction::Cascade, None) => SlaveChange::Delete,
            (ReferentialAction::Cascade, Some(new_key)) => SlaveChange::Assign(new_key.to_vec()),
            (ReferentialAction::SetNull, _) => SlaveChange::Assign(vec![Value::Null; columns.len()]),
            (ReferentialAction::SetDefault, _) => SlaveChange::AssignDefault,
        };

        debug!(
            "Relation '{}': {:?} on {} row(s) of '{}'",
            name,
            action,
            slaves.len(),
            relation.partner_table
        );

        let partner = relation.partner_for_write(opener)?;
        for row_id in slaves {
            if !partner.seek(row_id)? {
                continue;
            }

            let values = match &change {
                SlaveChange::Delete => {
                    partner.delete_row(false)?;
                    continue;
                }
                SlaveChange::Assign(values) => values.clone(),
                SlaveChange::AssignDefault => partner.default_row().key(&columns),
            };

            partner.prepare_update();
            for (column, value) in columns.iter().zip(values) {
                partner.satellite_mut().set_value(*column, value);
            }
            partner.update_row(false)?;
        }
        Ok(())
    }

    /// Position the partner of `name` on the first row related to `row`
    pub fn activate(
        &mut self,
        name: &str,
        row: &Row,
        opener: &PartnerOpener<'_, P>,
    ) -> StrataResult<&mut StorageObject<P>> {
        let relation = self
            .relations
            .iter_mut()
            .find(|r| r.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| StrataError::NotFound(format!("relation '{}'", name)))?;

        let key = row.key(&relation.local_columns);
        let columns = relation.partner_columns.clone();
        let partner = relation.partner(opener)?;

        if key_is_null(&key) {
            partner.move_to_eof();
            return Ok(partner);
        }

        let mut more = partner.first()?;
        while more {
            if key_matches(partner.current(), &columns, &key) == Some(true) {
                break;
            }
            more = partner.next()?;
        }
        Ok(partner)
    }

    /// Finalize every opened partner and release partner storage locks.
    /// The first failure is reported after all partners were handled.
    pub fn finalize_partners(&mut self, commit: bool) -> StrataResult<()> {
        let mut first_error = None;
        for relation in self.relations.iter_mut() {
            let locked = relation.partner_locked;
            if let Some(partner) = relation.partner.as_deref_mut() {
                if let Err(e) = partner.finalize_changes(commit) {
                    first_error.get_or_insert(e);
                }
                if locked {
                    partner.unlock_storage();
                }
            }
            relation.partner_locked = false;
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
