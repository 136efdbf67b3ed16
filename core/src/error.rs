use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::expression::ExpressionError;
use crate::row::RowId;
use crate::storage::Operation;
use crate::transaction::TxnId;

pub type StrataResult<T> = Result<T, StrataError>;

/// What went wrong while following a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityViolation {
    /// The slave row points at a master key that does not exist.
    MissingPrimaryKey,
    /// The master row is still referenced by slave rows.
    StillReferenced,
    /// The key shapes of both sides of the link do not line up.
    KeyMismatch,
    /// A one-to-one link found no partner row.
    MissingPartner,
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityViolation::MissingPrimaryKey => write!(f, "primary key not found"),
            IntegrityViolation::StillReferenced => write!(f, "primary key is still referenced"),
            IntegrityViolation::KeyMismatch => write!(f, "foreign key shape mismatch"),
            IntegrityViolation::MissingPartner => write!(f, "related row not found"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table '{table}' is read-only")]
    ReadOnly { table: String },

    #[error("Lock timeout on {resource} after {timeout:?}")]
    LockTimeout { resource: String, timeout: Duration },

    #[error("Constraint '{constraint}' violated by {operation} on table '{table}'")]
    ConstraintViolation {
        table: String,
        constraint: String,
        operation: Operation,
    },

    #[error("Column '{table}.{column}' is read-only")]
    ReadOnlyColumn { table: String, column: String },

    #[error("Identity for '{table}.{column}' failed: {message}")]
    Identity {
        table: String,
        column: String,
        message: String,
    },

    #[error("Default value for '{table}.{column}' failed: {message}")]
    DefaultValue {
        table: String,
        column: String,
        message: String,
    },

    #[error("Referential integrity violation in '{relation}' ({table}): {violation}")]
    ReferentialIntegrity {
        relation: String,
        table: String,
        violation: IntegrityViolation,
    },

    #[error("Row {row_id} of '{table}' is being modified by active transaction {writer}")]
    TransactionConflict {
        table: String,
        row_id: RowId,
        writer: TxnId,
    },

    #[error("Corruption in '{table}': {message}")]
    Corruption { table: String, message: String },

    #[error("{operation} on '{table}' vetoed: {reason}")]
    Vetoed {
        table: String,
        operation: Operation,
        reason: String,
    },

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<bincode::Error> for StrataError {
    fn from(e: bincode::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}

impl StrataError {
    /// Errors that repair mode is allowed to downgrade to a warning.
    pub fn is_repairable(&self) -> bool {
        matches!(
            self,
            StrataError::DefaultValue { .. }
                | StrataError::Identity { .. }
                | StrataError::Expression(_)
        )
    }
}
