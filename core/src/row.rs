//! Versioned rows and the values they carry

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use bitvec::vec::BitVec;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::catalog::Column;

/// Row identifier, unique within a table and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub u32);

impl RowId {
    /// Lower scope bound; no live row ever carries it
    pub const MIN: RowId = RowId(0);
    /// Upper scope bound and end-of-set marker
    pub const MAX: RowId = RowId(u32::MAX);

    /// True for ids strictly between the scope sentinels
    pub fn is_valid(self) -> bool {
        self > Self::MIN && self < Self::MAX
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical position of a cluster in the page store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefPosition(pub u64);

impl RefPosition {
    /// No position
    pub const EMPTY: RefPosition = RefPosition(u64::MAX);

    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }
}

impl Default for RefPosition {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Display for RefPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "<empty>")
        } else {
            write!(f, "@{}", self.0)
        }
    }
}

/// A column value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Boolean(_) => "BOOLEAN",
            Value::Integer(_) => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::Text(_) => "TEXT",
            Value::Binary(_) => "BINARY",
        }
    }

    /// Size of the variable-length payload, zero for fixed-size values
    pub fn payload_len(&self) -> usize {
        match self {
            Value::Text(s) => s.len(),
            Value::Binary(b) => b.len(),
            _ => 0,
        }
    }

    /// SQL-style comparison: anything involving NULL is unordered,
    /// integers and floats compare numerically.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Key equality used when matching related rows
    pub fn key_eq(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// Location of a column payload kept outside the row cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub position: RefPosition,
    pub pages: u32,
}

/// Column layout shared by every row of a table
#[derive(Debug, Clone, PartialEq)]
pub struct RowShape {
    columns: Vec<Column>,
}

impl RowShape {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    /// Case-insensitive column lookup
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_name(&self, index: usize) -> String {
        self.columns
            .get(index)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| format!("#{}", index))
    }
}

/// A versioned tuple.
///
/// Beyond its values a row records who wrote it (`row_version`), whether a
/// newer version superseded it (`outdated`), where it lives (`position`) and
/// which of its columns were touched since the buffer was last prepared.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: SmallVec<[Value; 8]>,
    row_id: RowId,
    row_version: u64,
    outdated: bool,
    position: RefPosition,
    extensions: BTreeMap<usize, Extension>,
    edited: BitVec,
}

impl Row {
    pub fn new(column_count: usize) -> Self {
        Self {
            values: SmallVec::from_elem(Value::Null, column_count),
            row_id: RowId::MIN,
            row_version: 0,
            outdated: false,
            position: RefPosition::EMPTY,
            extensions: BTreeMap::new(),
            edited: BitVec::repeat(false, column_count),
        }
    }

    /// Build a row from raw values without marking anything edited
    pub fn from_values(values: Vec<Value>) -> Self {
        let count = values.len();
        Self {
            values: SmallVec::from_vec(values),
            row_id: RowId::MIN,
            row_version: 0,
            outdated: false,
            position: RefPosition::EMPTY,
            extensions: BTreeMap::new(),
            edited: BitVec::repeat(false, count),
        }
    }

    /// Reset to an all-NULL row with no identity
    pub fn clear(&mut self) {
        for value in self.values.iter_mut() {
            *value = Value::Null;
        }
        self.row_id = RowId::MIN;
        self.row_version = 0;
        self.outdated = false;
        self.position = RefPosition::EMPTY;
        self.extensions.clear();
        self.edited.fill(false);
    }

    /// Copy another row into this buffer, edit markers included
    pub fn copy_from(&mut self, other: &Row) {
        self.values.clone_from(&other.values);
        self.row_id = other.row_id;
        self.row_version = other.row_version;
        self.outdated = other.outdated;
        self.position = other.position;
        self.extensions.clone_from(&other.extensions);
        self.edited.clone_from(&other.edited);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, column: usize) -> &Value {
        self.values.get(column).unwrap_or(&Value::Null)
    }

    /// Set a value on behalf of the user; the column is marked edited
    pub fn set_value(&mut self, column: usize, value: Value) {
        if column < self.values.len() {
            self.values[column] = value;
            self.edited.set(column, true);
        }
    }

    /// Set a generated value without touching the edit markers
    pub fn put_value(&mut self, column: usize, value: Value) {
        if column < self.values.len() {
            self.values[column] = value;
        }
    }

    pub fn take_value(&mut self, column: usize) -> Value {
        self.values
            .get_mut(column)
            .map(std::mem::take)
            .unwrap_or(Value::Null)
    }

    pub fn is_edited(&self, column: usize) -> bool {
        self.edited.get(column).map(|b| *b).unwrap_or(false)
    }

    pub fn any_edited(&self) -> bool {
        self.edited.any()
    }

    pub fn clear_edits(&mut self) {
        self.edited.fill(false);
    }

    pub fn row_id(&self) -> RowId {
        self.row_id
    }

    pub fn set_row_id(&mut self, row_id: RowId) {
        self.row_id = row_id;
    }

    pub fn row_version(&self) -> u64 {
        self.row_version
    }

    pub fn set_row_version(&mut self, version: u64) {
        self.row_version = version;
    }

    pub fn is_outdated(&self) -> bool {
        self.outdated
    }

    pub fn set_outdated(&mut self, outdated: bool) {
        self.outdated = outdated;
    }

    pub fn position(&self) -> RefPosition {
        self.position
    }

    pub fn set_position(&mut self, position: RefPosition) {
        self.position = position;
    }

    pub fn extensions(&self) -> &BTreeMap<usize, Extension> {
        &self.extensions
    }

    pub fn set_extensions(&mut self, extensions: BTreeMap<usize, Extension>) {
        self.extensions = extensions;
    }

    /// Values of the given columns, in order
    pub fn key(&self, columns: &[usize]) -> Vec<Value> {
        columns.iter().map(|&c| self.value(c).clone()).collect()
    }

    /// Compare the payload of two rows column by column
    pub fn same_values(&self, other: &Row) -> bool {
        self.values == other.values
    }
}
