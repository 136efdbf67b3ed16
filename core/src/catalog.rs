//! Table schemas and the persistent catalog

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{StrataError, StrataResult};
use crate::row::{RefPosition, RowShape, Value};
use crate::storage::blob::{self, BlobSlot};
use crate::storage::ClusterStore;

/// Table identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId(pub u32);

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Integer,
    Float,
    Text,
    Binary,
}

impl DataType {
    /// Whether a value can be stored in a column of this type
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (DataType::Boolean, Value::Boolean(_))
                | (DataType::Integer, Value::Integer(_))
                | (DataType::Float, Value::Float(_))
                | (DataType::Float, Value::Integer(_))
                | (DataType::Text, Value::Text(_))
                | (DataType::Binary, Value::Binary(_))
        )
    }
}

/// Column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub read_only: bool,
}

impl Column {
    /// Create a new nullable, writable column
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            read_only: false,
        }
    }

    /// Add NOT NULL constraint
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Forbid updates of this column once the row exists
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Auto-increment column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityDef {
    pub column: String,
    pub seed: i64,
    pub step: i64,
}

/// Default value generator for a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultValueDef {
    pub column: String,
    pub expression: String,
    /// Also regenerate the value when an update leaves the column untouched
    pub use_in_update: bool,
}

/// CHECK constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintDef {
    pub name: String,
    pub expression: String,
    pub on_insert: bool,
    pub on_update: bool,
    pub on_delete: bool,
}

/// What happens to slave rows when their master key changes or goes away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReferentialAction {
    #[default]
    NoAction,
    Cascade,
    SetNull,
    SetDefault,
}

/// Cardinality of a master/slave link. Decides whether a master row may
/// change its key or go away without a matching slave row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkKind {
    /// A master row may have no slaves at all, so a key change or delete
    /// that matches no slave row succeeds. Only `OneToOne` reports
    /// `IntegrityViolation::MissingPartner` for that case.
    #[default]
    OneToMany,
    /// At most one slave row; none is fine
    OneToZeroOrOne,
    /// Exactly one slave row; a master change that finds none fails
    OneToOne,
}

/// Foreign key from `table(columns)` to `references(referenced_columns)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub references: String,
    pub referenced_columns: Vec<String>,
    pub kind: LinkKind,
    pub on_update: ReferentialAction,
    pub on_delete: ReferentialAction,
}

impl ForeignKeyDef {
    pub fn is_self_reference(&self) -> bool {
        self.table.eq_ignore_ascii_case(&self.references)
    }
}

/// Table schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<Column>,
    pub identities: Vec<IdentityDef>,
    pub defaults: Vec<DefaultValueDef>,
    pub constraints: Vec<ConstraintDef>,
    pub foreign_keys: Vec<ForeignKeyDef>,
    pub header: BlobSlot,
    pub version: u64,
}

impl TableSchema {
    pub fn shape(&self) -> RowShape {
        RowShape::new(self.columns.clone())
    }

    pub fn column_index(&self, name: &str) -> StrataResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| StrataError::NotFound(format!("column '{}.{}'", self.name, name)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub schema: TableSchema,
    pub created_at: u64,
}

/// Catalog of all tables, stored as JSON in the root cluster
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistentCatalog {
    pub tables: HashMap<String, CatalogEntry>,
    pub next_table_id: u32,
    #[serde(skip)]
    slot: BlobSlot,
}

impl Default for PersistentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentCatalog {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            next_table_id: 1,
            slot: BlobSlot::default(),
        }
    }

    /// Load the catalog from the store's root cluster
    pub fn load(store: &dyn ClusterStore) -> StrataResult<Self> {
        let root = store.root();
        if root.is_empty() {
            return Ok(Self::new());
        }

        let pages = store.cluster_pages(root)?;
        let bytes = store.read_cluster(root)?;
        let mut catalog: PersistentCatalog = serde_json::from_slice(&bytes)
            .map_err(|e| StrataError::Storage(format!("Failed to parse catalog: {}", e)))?;
        catalog.slot = BlobSlot {
            position: root,
            pages,
        };
        Ok(catalog)
    }

    /// Save the catalog, repoint the store root at it and flush
    pub fn save(&mut self, store: &dyn ClusterStore) -> StrataResult<()> {
        let json = serde_json::to_vec(self)
            .map_err(|e| StrataError::Storage(format!("Failed to serialize catalog: {}", e)))?;

        let slot = blob::store(store, self.slot, &json)?;
        if slot.position != store.root() {
            store.set_root(slot.position)?;
        }
        self.slot = slot;
        store.flush()
    }

    /// Add a table to the catalog
    pub fn add_table(&mut self, schema: TableSchema) -> StrataResult<()> {
        let key = schema.name.to_ascii_lowercase();
        if self.tables.contains_key(&key) {
            return Err(StrataError::InvalidInput(format!(
                "Table '{}' already exists",
                schema.name
            )));
        }

        let entry = CatalogEntry {
            schema,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };

        self.tables.insert(key, entry);
        Ok(())
    }

    /// Remove a table from the catalog
    pub fn remove_table(&mut self, name: &str) -> StrataResult<TableSchema> {
        self.tables
            .remove(&name.to_ascii_lowercase())
            .map(|entry| entry.schema)
            .ok_or_else(|| StrataError::NotFound(format!("table '{}'", name)))
    }

    /// Get table schema
    pub fn get_table(&self, name: &str) -> Option<&TableSchema> {
        self.tables
            .get(&name.to_ascii_lowercase())
            .map(|entry| &entry.schema)
    }

    pub fn get_table_mut(&mut self, name: &str) -> Option<&mut TableSchema> {
        self.tables
            .get_mut(&name.to_ascii_lowercase())
            .map(|entry| &mut entry.schema)
    }

    /// Foreign keys in which `name` is the master side
    pub fn references_to(&self, name: &str) -> Vec<ForeignKeyDef> {
        let mut found: Vec<ForeignKeyDef> = self
            .tables
            .values()
            .flat_map(|entry| entry.schema.foreign_keys.iter())
            .filter(|fk| fk.references.eq_ignore_ascii_case(name))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    /// List all tables
    pub fn list_tables(&self) -> Vec<String> {
        self.tables.values().map(|e| e.schema.name.clone()).collect()
    }

    pub fn allocate_table_id(&mut self) -> TableId {
        let id = TableId(self.next_table_id);
        self.next_table_id += 1;
        id
    }

    pub fn header_of(&self, name: &str) -> Option<RefPosition> {
        self.get_table(name).map(|s| s.header.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryClusterStore;

    fn schema(name: &str) -> TableSchema {
        TableSchema {
            id: TableId(1),
            name: name.to_string(),
            columns: vec![
                Column::new("id", DataType::Integer).not_null(),
                Column::new("name", DataType::Text),
            ],
            identities: Vec::new(),
            defaults: Vec::new(),
            constraints: Vec::new(),
            foreign_keys: Vec::new(),
            header: BlobSlot::default(),
            version: 1,
        }
    }

    #[test]
    fn test_catalog_round_trip_through_root_cluster() {
        let store = MemoryClusterStore::new(512);
        let mut catalog = PersistentCatalog::new();
        catalog.add_table(schema("Users")).unwrap();
        catalog.save(&store).unwrap();

        let loaded = PersistentCatalog::load(&store).unwrap();
        let users = loaded.get_table("users").unwrap();
        assert_eq!(users.name, "Users");
        assert_eq!(users.column_index("NAME").unwrap(), 1);
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let mut catalog = PersistentCatalog::new();
        catalog.add_table(schema("t")).unwrap();
        assert!(catalog.add_table(schema("T")).is_err());
        assert!(catalog.remove_table("t").is_ok());
        assert!(catalog.remove_table("t").is_err());
    }

    #[test]
    fn test_data_type_accepts() {
        assert!(DataType::Integer.accepts(&Value::Null));
        assert!(DataType::Float.accepts(&Value::Integer(3)));
        assert!(!DataType::Integer.accepts(&Value::Text("3".into())));
    }
}
