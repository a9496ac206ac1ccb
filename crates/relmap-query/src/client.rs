//! Client-side evaluation.
//!
//! Projection fragments with no relational equivalent are evaluated in
//! memory after the row arrives, using functions registered in
//! [`ClientFunctions`]. A construct without a registered function cannot be
//! evaluated anywhere and fails translation.

use crate::expr::{BinaryOp, UnaryOp};
use relmap_core::{MaterializationError, Row, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A client function: argument values in, one value out.
pub type ClientFunction = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Registry of client-evaluable methods and members.
///
/// Keys are method names (`"PadLeft"`), static method names
/// (`"Path.Combine"`), member names on values (`"Ticks"`) or
/// `"EntityType.Member"` for unmapped entity members. Entity members receive
/// the entity's mapped property values, in model order.
#[derive(Clone, Default)]
pub struct ClientFunctions {
    functions: BTreeMap<String, ClientFunction>,
}

impl fmt::Debug for ClientFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

impl ClientFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in functions.
    pub fn with_builtins() -> Self {
        let mut functions = Self::new();
        functions.register("ToString", |args| {
            Ok(match args.first() {
                None | Some(Value::Null) => Value::Null,
                Some(Value::Text(s)) => Value::Text(s.clone()),
                Some(other) => Value::Text(other.to_string()),
            })
        });
        functions.register("Reverse", |args| match args.first() {
            Some(Value::Text(s)) => Ok(Value::Text(s.chars().rev().collect())),
            Some(Value::Null) | None => Ok(Value::Null),
            Some(other) => Err(format!("Reverse expects text, got {}", other.type_name())),
        });
        functions.register("PadLeft", |args| {
            let (Some(value), Some(width)) = (args.first(), args.get(1).and_then(Value::as_i64)) else {
                return Err("PadLeft expects (text, width)".to_string());
            };
            let Some(s) = value.as_str() else {
                return Ok(Value::Null);
            };
            let pad = args.get(2).and_then(Value::as_str).and_then(|p| p.chars().next()).unwrap_or(' ');
            let width = usize::try_from(width).unwrap_or(0);
            let len = s.chars().count();
            let mut out: String = std::iter::repeat_n(pad, width.saturating_sub(len)).collect();
            out.push_str(s);
            Ok(Value::Text(out))
        });
        // Intervals are stored as microseconds; a tick is 100ns.
        functions.register("Ticks", |args| match args.first() {
            Some(Value::Null) | None => Ok(Value::Null),
            Some(v) => v
                .as_i64()
                .map(|micros| Value::BigInt(micros.saturating_mul(10)))
                .ok_or_else(|| format!("Ticks expects an interval, got {}", v.type_name())),
        });
        functions
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ClientFunction> {
        self.functions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

/// An expression evaluated in memory over a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientExpr {
    /// Value of a projected column.
    Column(usize),
    Constant(Value),
    Call { function: String, args: Vec<ClientExpr> },
    Binary {
        op: BinaryOp,
        left: Box<ClientExpr>,
        right: Box<ClientExpr>,
    },
    Unary { op: UnaryOp, operand: Box<ClientExpr> },
    Conditional {
        test: Box<ClientExpr>,
        if_true: Box<ClientExpr>,
        if_false: Box<ClientExpr>,
    },
    Coalesce { left: Box<ClientExpr>, right: Box<ClientExpr> },
}

impl ClientExpr {
    /// Evaluate against `row`.
    pub fn evaluate(&self, row: &Row, functions: &ClientFunctions) -> Result<Value, MaterializationError> {
        match self {
            ClientExpr::Column(i) => row
                .get(*i)
                .cloned()
                .ok_or_else(|| MaterializationError::new("row is shorter than the projection").at_column(*i)),
            ClientExpr::Constant(v) => Ok(v.clone()),
            ClientExpr::Call { function, args } => {
                let f = functions
                    .get(function)
                    .ok_or_else(|| MaterializationError::new(format!("client function '{function}' is not registered")))?;
                let args = args
                    .iter()
                    .map(|a| a.evaluate(row, functions))
                    .collect::<Result<Vec<_>, _>>()?;
                f(&args).map_err(|e| MaterializationError::new(format!("{function}: {e}")))
            }
            ClientExpr::Binary { op, left, right } => {
                let l = left.evaluate(row, functions)?;
                // && and || short-circuit like the source language.
                match (op, l.as_bool()) {
                    (BinaryOp::AndAlso, Some(false)) => return Ok(Value::Bool(false)),
                    (BinaryOp::OrElse, Some(true)) => return Ok(Value::Bool(true)),
                    _ => {}
                }
                let r = right.evaluate(row, functions)?;
                binary(*op, &l, &r)
            }
            ClientExpr::Unary { op, operand } => {
                let v = operand.evaluate(row, functions)?;
                Ok(match (op, &v) {
                    (_, Value::Null) => Value::Null,
                    (UnaryOp::Not, v) => v.as_bool().map_or(Value::Null, |b| Value::Bool(!b)),
                    (UnaryOp::Negate, Value::Double(d)) => Value::Double(-d),
                    (UnaryOp::Negate, Value::Float(d)) => Value::Float(-d),
                    (UnaryOp::Negate, v) => v.as_i64().map_or(Value::Null, |i| Value::BigInt(-i)),
                })
            }
            ClientExpr::Conditional {
                test,
                if_true,
                if_false,
            } => {
                if test.evaluate(row, functions)?.as_bool().unwrap_or(false) {
                    if_true.evaluate(row, functions)
                } else {
                    if_false.evaluate(row, functions)
                }
            }
            ClientExpr::Coalesce { left, right } => {
                let l = left.evaluate(row, functions)?;
                if l.is_null() { right.evaluate(row, functions) } else { Ok(l) }
            }
        }
    }

    /// Columns read by this expression.
    pub fn columns(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<usize>) {
        match self {
            ClientExpr::Column(i) => out.push(*i),
            ClientExpr::Constant(_) => {}
            ClientExpr::Call { args, .. } => args.iter().for_each(|a| a.collect_columns(out)),
            ClientExpr::Binary { left, right, .. } | ClientExpr::Coalesce { left, right } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            ClientExpr::Unary { operand, .. } => operand.collect_columns(out),
            ClientExpr::Conditional {
                test,
                if_true,
                if_false,
            } => {
                test.collect_columns(out);
                if_true.collect_columns(out);
                if_false.collect_columns(out);
            }
        }
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, MaterializationError> {
    if op.is_comparison() {
        return Ok(match op {
            BinaryOp::Equal => Value::Bool(l.loosely_equals(r)),
            BinaryOp::NotEqual => Value::Bool(!l.loosely_equals(r)),
            _ => match l.compare(r) {
                None => Value::Bool(false),
                Some(ord) => Value::Bool(match op {
                    BinaryOp::LessThan => ord == Ordering::Less,
                    BinaryOp::LessThanOrEqual => ord != Ordering::Greater,
                    BinaryOp::GreaterThan => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                }),
            },
        });
    }
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match op {
        BinaryOp::AndAlso | BinaryOp::OrElse => {
            let (Some(a), Some(b)) = (l.as_bool(), r.as_bool()) else {
                return Err(MaterializationError::new(format!("'{}' expects booleans", op.symbol())));
            };
            Ok(Value::Bool(if op == BinaryOp::AndAlso { a && b } else { a || b }))
        }
        BinaryOp::Add if l.as_str().is_some() || r.as_str().is_some() => {
            Ok(Value::Text(format!("{}{}", text_of(l), text_of(r))))
        }
        _ if l.is_integer() && r.is_integer() => {
            let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) else {
                return Ok(Value::Null);
            };
            let v = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Subtract => a.checked_sub(b),
                BinaryOp::Multiply => a.checked_mul(b),
                BinaryOp::Divide => a.checked_div(b),
                _ => a.checked_rem(b),
            };
            v.map(Value::BigInt)
                .ok_or_else(|| MaterializationError::new(format!("integer overflow or division by zero in '{}'", op.symbol())))
        }
        _ => {
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                return Err(MaterializationError::new(format!(
                    "'{}' is not defined for {} and {}",
                    op.symbol(),
                    l.type_name(),
                    r.type_name()
                )));
            };
            Ok(Value::Double(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Subtract => a - b,
                BinaryOp::Multiply => a * b,
                BinaryOp::Divide => a / b,
                _ => a % b,
            }))
        }
    }
}

fn text_of(v: &Value) -> String {
    match v {
        Value::Text(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: Vec<Value>) -> Row {
        Row::from_values(values)
    }

    #[test]
    fn test_builtin_functions() {
        let f = ClientFunctions::with_builtins();
        let expr = ClientExpr::Call {
            function: "PadLeft".to_string(),
            args: vec![ClientExpr::Column(0), ClientExpr::Constant(Value::Int(6))],
        };
        assert_eq!(expr.evaluate(&row(vec![Value::from("Cole")]), &f).unwrap(), Value::from("  Cole"));

        let ticks = ClientExpr::Call {
            function: "Ticks".to_string(),
            args: vec![ClientExpr::Column(0)],
        };
        assert_eq!(ticks.evaluate(&row(vec![Value::BigInt(3)]), &f).unwrap(), Value::BigInt(30));
    }

    #[test]
    fn test_custom_registration_and_missing_function() {
        let mut f = ClientFunctions::new();
        f.register("Gear.FullNameWithRank", |args| {
            Ok(Value::Text(format!(
                "{} ({})",
                args.first().and_then(Value::as_str).unwrap_or_default(),
                args.get(1).and_then(Value::as_i64).unwrap_or_default()
            )))
        });
        assert!(f.contains("Gear.FullNameWithRank"));
        let expr = ClientExpr::Call {
            function: "Gear.FullNameWithRank".to_string(),
            args: vec![ClientExpr::Column(1), ClientExpr::Column(0)],
        };
        let r = row(vec![Value::Int(2), Value::from("Marcus Fenix")]);
        assert_eq!(expr.evaluate(&r, &f).unwrap(), Value::from("Marcus Fenix (2)"));

        let missing = ClientExpr::Call {
            function: "Nope".to_string(),
            args: vec![],
        };
        assert!(missing.evaluate(&r, &f).is_err());
    }

    #[test]
    fn test_operators_and_nulls() {
        let f = ClientFunctions::new();
        let r = row(vec![Value::Int(4), Value::Null, Value::from("a")]);
        let add = ClientExpr::Binary {
            op: BinaryOp::Add,
            left: Box::new(ClientExpr::Column(0)),
            right: Box::new(ClientExpr::Constant(Value::Int(3))),
        };
        assert_eq!(add.evaluate(&r, &f).unwrap(), Value::BigInt(7));
        let with_null = ClientExpr::Binary {
            op: BinaryOp::Multiply,
            left: Box::new(ClientExpr::Column(0)),
            right: Box::new(ClientExpr::Column(1)),
        };
        assert_eq!(with_null.evaluate(&r, &f).unwrap(), Value::Null);
        let coalesce = ClientExpr::Coalesce {
            left: Box::new(ClientExpr::Column(1)),
            right: Box::new(ClientExpr::Column(2)),
        };
        assert_eq!(coalesce.evaluate(&r, &f).unwrap(), Value::from("a"));
        assert_eq!(coalesce.columns(), vec![1, 2]);
    }
}
