//! Strata - transactional row storage core

pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod expression;
pub mod filter;
pub mod lock;
pub mod row;
pub mod storage;
pub mod transaction;

pub use catalog::{
    Column, ConstraintDef, DataType, ForeignKeyDef, LinkKind, ReferentialAction, TableSchema,
};
pub use config::{ConnectionOptions, DatabaseConfig};
pub use database::{Connection, Database};
pub use error::{IntegrityViolation, StrataError, StrataResult};
pub use expression::{BuiltinCompiler, Evaluator, ExpressionCompiler};
pub use filter::{FilterId, FilterType};
pub use row::{Row, RowId, Value};
pub use storage::{ClusteredRowSet, OpenOptions, Operation, RowEventHook};
pub use transaction::{IsolationLevel, TxnId};
