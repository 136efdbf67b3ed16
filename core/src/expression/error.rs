use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),

    #[error("Unterminated string starting at position {0}")]
    UnterminatedString(usize),

    #[error("Invalid number at position {0}")]
    InvalidNumber(usize),

    #[error("Expected {expected}, found {found} at position {position}")]
    UnexpectedToken {
        expected: String,
        found: String,
        position: usize,
    },

    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{function} takes {expected} argument(s), {found} given")]
    ArgumentCount {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("Cannot apply {op} to {left} and {right}")]
    TypeMismatch {
        op: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Integer overflow in {0}")]
    Overflow(String),
}

pub type ExpressionResult<T> = Result<T, ExpressionError>;
