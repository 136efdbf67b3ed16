use std::fmt;

use super::error::{ExpressionError, ExpressionResult};
use crate::row::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Column index in the row shape the expression was compiled against
    Column(usize),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    IsNull {
        operand: Box<Expr>,
        negated: bool,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Columns the expression reads
    pub fn columns(&self, out: &mut Vec<usize>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Column(index) => {
                if !out.contains(index) {
                    out.push(*index);
                }
            }
            Expr::Unary { operand, .. } | Expr::IsNull { operand, .. } => operand.columns(out),
            Expr::Binary { left, right, .. } => {
                left.columns(out);
                right.columns(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.columns(out)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::LtEq => "<=",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        };
        f.write_str(symbol)
    }
}

/// Built-in scalar functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Coalesce,
    Length,
    Upper,
    Lower,
    Abs,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "COALESCE" => Some(Function::Coalesce),
            "LENGTH" | "LEN" => Some(Function::Length),
            "UPPER" => Some(Function::Upper),
            "LOWER" => Some(Function::Lower),
            "ABS" => Some(Function::Abs),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Coalesce => "COALESCE",
            Function::Length => "LENGTH",
            Function::Upper => "UPPER",
            Function::Lower => "LOWER",
            Function::Abs => "ABS",
        }
    }

    pub fn check_arity(&self, found: usize) -> ExpressionResult<()> {
        let ok = match self {
            Function::Coalesce => found >= 1,
            _ => found == 1,
        };
        if ok {
            Ok(())
        } else {
            Err(ExpressionError::ArgumentCount {
                function: self.name().to_string(),
                expected: 1,
                found,
            })
        }
    }
}
