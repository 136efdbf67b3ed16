//! Expression compilation for identities, defaults, constraints and
//! predicate filters.
//!
//! The storage core only needs "compile this text against a row shape" and
//! "run the result on a row"; both sit behind traits so a full SQL layer
//! can supply its own compiler. The built-in one covers literals, column
//! references, arithmetic, comparisons, three-valued AND/OR/NOT,
//! `IS [NOT] NULL` and a few scalar functions.

pub mod ast;
pub mod error;
pub mod lexer;
pub mod parser;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

pub use error::{ExpressionError, ExpressionResult};

use ast::{BinaryOp, Expr, Function, UnaryOp};
use parser::Parser;

use crate::row::{Row, RowShape, Value};

/// A compiled expression
pub trait Evaluator: Send + Sync + fmt::Debug {
    fn exec(&self, row: &Row) -> ExpressionResult<Value>;

    /// Source text, for error messages
    fn text(&self) -> &str;

    /// Columns read by the expression
    fn columns(&self) -> Vec<usize> {
        Vec::new()
    }
}

/// Turns expression text into an evaluator bound to a row shape
pub trait ExpressionCompiler: Send + Sync {
    fn compile(&self, text: &str, shape: &RowShape) -> ExpressionResult<Arc<dyn Evaluator>>;
}

/// Compiler for the built-in expression language
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCompiler;

impl ExpressionCompiler for BuiltinCompiler {
    fn compile(&self, text: &str, shape: &RowShape) -> ExpressionResult<Arc<dyn Evaluator>> {
        let root = Parser::new(text, shape)?.parse()?;
        Ok(Arc::new(CompiledExpression {
            text: text.to_string(),
            root,
        }))
    }
}

#[derive(Debug)]
pub struct CompiledExpression {
    text: String,
    root: Expr,
}

impl Evaluator for CompiledExpression {
    fn exec(&self, row: &Row) -> ExpressionResult<Value> {
        eval(&self.root, row)
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn columns(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.root.columns(&mut out);
        out
    }
}

/// Interpret a predicate result: NULL is unknown, anything else must be
/// a boolean.
pub fn truth(value: &Value) -> ExpressionResult<Option<bool>> {
    match value {
        Value::Null => Ok(None),
        Value::Boolean(b) => Ok(Some(*b)),
        other => Err(ExpressionError::TypeMismatch {
            op: "predicate".into(),
            left: other.type_name(),
            right: "BOOLEAN",
        }),
    }
}

fn mismatch(op: impl fmt::Display, left: &Value, right: &Value) -> ExpressionError {
    ExpressionError::TypeMismatch {
        op: op.to_string(),
        left: left.type_name(),
        right: right.type_name(),
    }
}

fn eval(expr: &Expr, row: &Row) -> ExpressionResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Column(index) => Ok(row.value(*index).clone()),
        Expr::IsNull { operand, negated } => {
            let is_null = eval(operand, row)?.is_null();
            Ok(Value::Boolean(is_null != *negated))
        }
        Expr::Unary { op, operand } => {
            let value = eval(operand, row)?;
            match (op, value) {
                (_, Value::Null) => Ok(Value::Null),
                (UnaryOp::Not, Value::Boolean(b)) => Ok(Value::Boolean(!b)),
                (UnaryOp::Negate, Value::Integer(n)) => n
                    .checked_neg()
                    .map(Value::Integer)
                    .ok_or_else(|| ExpressionError::Overflow("negation".into())),
                (UnaryOp::Negate, Value::Float(x)) => Ok(Value::Float(-x)),
                (op, other) => Err(ExpressionError::TypeMismatch {
                    op: format!("{:?}", op),
                    left: other.type_name(),
                    right: other.type_name(),
                }),
            }
        }
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And | BinaryOp::Or => logical(*op, left, right, row),
            _ => {
                let l = eval(left, row)?;
                let r = eval(right, row)?;
                binary(*op, &l, &r)
            }
        },
        Expr::Call { function, args } => call(*function, args, row),
    }
}

/// Three-valued AND/OR with short circuit on the dominant value
fn logical(op: BinaryOp, left: &Expr, right: &Expr, row: &Row) -> ExpressionResult<Value> {
    let dominant = op == BinaryOp::Or;

    let l = truth(&eval(left, row)?)?;
    if l == Some(dominant) {
        return Ok(Value::Boolean(dominant));
    }
    let r = truth(&eval(right, row)?)?;
    if r == Some(dominant) {
        return Ok(Value::Boolean(dominant));
    }

    Ok(match (l, r) {
        (Some(_), Some(_)) => Value::Boolean(!dominant),
        _ => Value::Null,
    })
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> ExpressionResult<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }

    match op {
        BinaryOp::Eq
        | BinaryOp::NotEq
        | BinaryOp::Lt
        | BinaryOp::Gt
        | BinaryOp::LtEq
        | BinaryOp::GtEq => {
            let ordering = l.compare(r).ok_or_else(|| mismatch(op, l, r))?;
            let result = match op {
                BinaryOp::Eq => ordering == Ordering::Equal,
                BinaryOp::NotEq => ordering != Ordering::Equal,
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Gt => ordering == Ordering::Greater,
                BinaryOp::LtEq => ordering != Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Boolean(result))
        }
        _ => arithmetic(op, l, r),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> ExpressionResult<Value> {
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => {
            let (a, b) = (*a, *b);
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div | BinaryOp::Mod if b == 0 => {
                    return Err(ExpressionError::DivisionByZero);
                }
                BinaryOp::Div => a.checked_div(b),
                BinaryOp::Mod => a.checked_rem(b),
                _ => return Err(mismatch(op, l, r)),
            };
            result
                .map(Value::Integer)
                .ok_or_else(|| ExpressionError::Overflow(op.to_string()))
        }
        (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
            let a = as_float(l);
            let b = as_float(r);
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div | BinaryOp::Mod if b == 0.0 => {
                    return Err(ExpressionError::DivisionByZero);
                }
                BinaryOp::Div => a / b,
                BinaryOp::Mod => a % b,
                _ => return Err(mismatch(op, l, r)),
            };
            Ok(Value::Float(result))
        }
        (Value::Text(a), Value::Text(b)) if op == BinaryOp::Add => {
            Ok(Value::Text(format!("{}{}", a, b)))
        }
        _ => Err(mismatch(op, l, r)),
    }
}

fn as_float(value: &Value) -> f64 {
    match value {
        Value::Integer(n) => *n as f64,
        Value::Float(x) => *x,
        _ => 0.0,
    }
}

fn call(function: Function, args: &[Expr], row: &Row) -> ExpressionResult<Value> {
    if function == Function::Coalesce {
        for arg in args {
            let value = eval(arg, row)?;
            if !value.is_null() {
                return Ok(value);
            }
        }
        return Ok(Value::Null);
    }

    let Some(arg) = args.first() else {
        return Err(ExpressionError::ArgumentCount {
            function: function.name().to_string(),
            expected: 1,
            found: 0,
        });
    };

    let value = eval(arg, row)?;
    let wrong_type = |value: &Value| ExpressionError::TypeMismatch {
        op: function.name().to_string(),
        left: value.type_name(),
        right: value.type_name(),
    };

    match (function, &value) {
        (_, Value::Null) => Ok(Value::Null),
        (Function::Length, Value::Text(s)) => Ok(Value::Integer(s.chars().count() as i64)),
        (Function::Length, Value::Binary(b)) => Ok(Value::Integer(b.len() as i64)),
        (Function::Upper, Value::Text(s)) => Ok(Value::Text(s.to_uppercase())),
        (Function::Lower, Value::Text(s)) => Ok(Value::Text(s.to_lowercase())),
        (Function::Abs, Value::Integer(n)) => n
            .checked_abs()
            .map(Value::Integer)
            .ok_or_else(|| ExpressionError::Overflow("ABS".into())),
        (Function::Abs, Value::Float(x)) => Ok(Value::Float(x.abs())),
        (_, other) => Err(wrong_type(other)),
    }
}
