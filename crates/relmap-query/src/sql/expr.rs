//! Relational scalar expressions.

use super::select::SelectExpression;
use crate::expr::AggregateFunction;
use relmap_core::{SqlType, Value};
use serde::Serialize;

/// Binary operators of the relational vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SqlBinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
}

impl SqlBinaryOp {
    /// SQL spelling.
    pub const fn as_str(self) -> &'static str {
        match self {
            SqlBinaryOp::Add => "+",
            SqlBinaryOp::Subtract => "-",
            SqlBinaryOp::Multiply => "*",
            SqlBinaryOp::Divide => "/",
            SqlBinaryOp::Modulo => "%",
            SqlBinaryOp::Equal => "=",
            SqlBinaryOp::NotEqual => "<>",
            SqlBinaryOp::LessThan => "<",
            SqlBinaryOp::LessThanOrEqual => "<=",
            SqlBinaryOp::GreaterThan => ">",
            SqlBinaryOp::GreaterThanOrEqual => ">=",
            SqlBinaryOp::And => "AND",
            SqlBinaryOp::Or => "OR",
        }
    }

    /// Binding strength; higher binds tighter.
    pub const fn precedence(self) -> u8 {
        match self {
            SqlBinaryOp::Or => 1,
            SqlBinaryOp::And => 2,
            SqlBinaryOp::Equal
            | SqlBinaryOp::NotEqual
            | SqlBinaryOp::LessThan
            | SqlBinaryOp::LessThanOrEqual
            | SqlBinaryOp::GreaterThan
            | SqlBinaryOp::GreaterThanOrEqual => 3,
            SqlBinaryOp::Add | SqlBinaryOp::Subtract => 4,
            SqlBinaryOp::Multiply | SqlBinaryOp::Divide | SqlBinaryOp::Modulo => 5,
        }
    }

    pub const fn is_comparison(self) -> bool {
        self.precedence() == 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SqlUnaryOp {
    Not,
    Negate,
}

/// Date and time components extractable on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DatePart {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl DatePart {
    /// Parse a member name such as `Year`.
    pub fn from_member(member: &str) -> Option<Self> {
        match member {
            "Year" => Some(DatePart::Year),
            "Month" => Some(DatePart::Month),
            "Day" => Some(DatePart::Day),
            "Hour" => Some(DatePart::Hour),
            "Minute" => Some(DatePart::Minute),
            "Second" => Some(DatePart::Second),
            _ => None,
        }
    }

    pub const fn keyword(self) -> &'static str {
        match self {
            DatePart::Year => "YEAR",
            DatePart::Month => "MONTH",
            DatePart::Day => "DAY",
            DatePart::Hour => "HOUR",
            DatePart::Minute => "MINUTE",
            DatePart::Second => "SECOND",
        }
    }

    /// `strftime` format for SQLite.
    pub const fn strftime_format(self) -> &'static str {
        match self {
            DatePart::Year => "%Y",
            DatePart::Month => "%m",
            DatePart::Day => "%d",
            DatePart::Hour => "%H",
            DatePart::Minute => "%M",
            DatePart::Second => "%S",
        }
    }
}

/// A relational scalar expression.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SqlExpr {
    Column {
        table: String,
        column: String,
        sql_type: SqlType,
        nullable: bool,
    },
    /// Inlined literal.
    Constant(Value),
    /// Captured value sent as a positional parameter.
    Parameter { name: String, value: Value },
    Binary {
        op: SqlBinaryOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Unary { op: SqlUnaryOp, operand: Box<SqlExpr> },
    IsNull { operand: Box<SqlExpr>, negated: bool },
    Function {
        name: String,
        args: Vec<SqlExpr>,
        sql_type: Option<SqlType>,
    },
    Aggregate {
        function: AggregateFunction,
        /// `None` is `COUNT(*)`.
        argument: Option<Box<SqlExpr>>,
        distinct: bool,
    },
    Case {
        whens: Vec<(SqlExpr, SqlExpr)>,
        else_result: Option<Box<SqlExpr>>,
    },
    Like {
        operand: Box<SqlExpr>,
        pattern: Box<SqlExpr>,
        escape: Option<char>,
    },
    In {
        operand: Box<SqlExpr>,
        values: Vec<SqlExpr>,
        negated: bool,
    },
    Concat(Vec<SqlExpr>),
    DatePart { part: DatePart, operand: Box<SqlExpr> },
    Exists {
        subquery: Box<SelectExpression>,
        negated: bool,
    },
    /// Single-value subquery.
    Scalar(Box<SelectExpression>),
}

impl SqlExpr {
    pub fn column(table: impl Into<String>, column: impl Into<String>, sql_type: SqlType, nullable: bool) -> Self {
        SqlExpr::Column {
            table: table.into(),
            column: column.into(),
            sql_type,
            nullable,
        }
    }

    pub fn binary(op: SqlBinaryOp, left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(self, other: SqlExpr) -> Self {
        Self::binary(SqlBinaryOp::And, self, other)
    }

    pub fn or(self, other: SqlExpr) -> Self {
        Self::binary(SqlBinaryOp::Or, self, other)
    }

    pub fn equal(self, other: SqlExpr) -> Self {
        Self::binary(SqlBinaryOp::Equal, self, other)
    }

    pub fn not(self) -> Self {
        SqlExpr::Unary {
            op: SqlUnaryOp::Not,
            operand: Box::new(self),
        }
    }

    pub fn is_null(self) -> Self {
        SqlExpr::IsNull {
            operand: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        SqlExpr::IsNull {
            operand: Box::new(self),
            negated: true,
        }
    }

    pub fn function(name: impl Into<String>, args: Vec<SqlExpr>, sql_type: Option<SqlType>) -> Self {
        SqlExpr::Function {
            name: name.into(),
            args,
            sql_type,
        }
    }

    /// AND together a list of predicates; `None` when empty.
    pub fn conjunction(predicates: impl IntoIterator<Item = SqlExpr>) -> Option<SqlExpr> {
        predicates.into_iter().reduce(SqlExpr::and)
    }

    /// Value of a constant or parameter.
    pub fn literal_value(&self) -> Option<&Value> {
        match self {
            SqlExpr::Constant(v) | SqlExpr::Parameter { value: v, .. } => Some(v),
            _ => None,
        }
    }

    /// Whether this is the literal NULL (or a parameter bound to NULL).
    pub fn is_null_literal(&self) -> bool {
        self.literal_value().is_some_and(Value::is_null)
    }

    /// Best-effort store type.
    pub fn sql_type(&self) -> Option<SqlType> {
        match self {
            SqlExpr::Column { sql_type, .. } => Some(*sql_type),
            SqlExpr::Constant(v) | SqlExpr::Parameter { value: v, .. } => value_type(v),
            SqlExpr::Binary { op, left, right } => {
                if op.is_comparison() || matches!(op, SqlBinaryOp::And | SqlBinaryOp::Or) {
                    Some(SqlType::Boolean)
                } else {
                    left.sql_type().or_else(|| right.sql_type())
                }
            }
            SqlExpr::Unary { op: SqlUnaryOp::Not, .. }
            | SqlExpr::IsNull { .. }
            | SqlExpr::Like { .. }
            | SqlExpr::In { .. }
            | SqlExpr::Exists { .. } => Some(SqlType::Boolean),
            SqlExpr::Unary { operand, .. } => operand.sql_type(),
            SqlExpr::Function { sql_type, args, .. } => {
                sql_type.or_else(|| args.first().and_then(SqlExpr::sql_type))
            }
            SqlExpr::Aggregate { function, argument, .. } => match function {
                AggregateFunction::Count => Some(SqlType::BigInt),
                AggregateFunction::Average => Some(SqlType::Double),
                _ => argument.as_ref().and_then(|a| a.sql_type()),
            },
            SqlExpr::Case { whens, else_result } => whens
                .first()
                .and_then(|(_, r)| r.sql_type())
                .or_else(|| else_result.as_ref().and_then(|e| e.sql_type())),
            SqlExpr::Concat(_) => Some(SqlType::Text),
            SqlExpr::DatePart { .. } => Some(SqlType::Integer),
            SqlExpr::Scalar(select) => select.projection.first().and_then(|c| c.expr.sql_type()),
        }
    }

    /// Whether the expression can evaluate to NULL.
    pub fn is_nullable(&self) -> bool {
        match self {
            SqlExpr::Column { nullable, .. } => *nullable,
            SqlExpr::Constant(v) | SqlExpr::Parameter { value: v, .. } => v.is_null(),
            SqlExpr::Binary { left, right, .. } => left.is_nullable() || right.is_nullable(),
            SqlExpr::Unary { operand, .. } | SqlExpr::DatePart { operand, .. } => operand.is_nullable(),
            SqlExpr::Like { operand, pattern, .. } => operand.is_nullable() || pattern.is_nullable(),
            SqlExpr::In { operand, .. } => operand.is_nullable(),
            SqlExpr::IsNull { .. } | SqlExpr::Exists { .. } => false,
            SqlExpr::Function { name, args, .. } => {
                if name == "COALESCE" {
                    args.last().is_none_or(SqlExpr::is_nullable)
                } else {
                    args.iter().any(SqlExpr::is_nullable)
                }
            }
            SqlExpr::Aggregate { function, .. } => *function != AggregateFunction::Count,
            SqlExpr::Case { whens, else_result } => {
                whens.iter().any(|(_, r)| r.is_nullable()) || else_result.as_ref().is_none_or(|e| e.is_nullable())
            }
            SqlExpr::Concat(parts) => parts.iter().any(SqlExpr::is_nullable),
            SqlExpr::Scalar(_) => true,
        }
    }

    /// Direct scalar children (subqueries are not descended).
    pub fn children(&self) -> Vec<&SqlExpr> {
        match self {
            SqlExpr::Column { .. }
            | SqlExpr::Constant(_)
            | SqlExpr::Parameter { .. }
            | SqlExpr::Exists { .. }
            | SqlExpr::Scalar(_) => Vec::new(),
            SqlExpr::Binary { left, right, .. } => vec![left, right],
            SqlExpr::Unary { operand, .. } | SqlExpr::IsNull { operand, .. } | SqlExpr::DatePart { operand, .. } => {
                vec![operand]
            }
            SqlExpr::Function { args, .. } | SqlExpr::Concat(args) => args.iter().collect(),
            SqlExpr::Aggregate { argument, .. } => argument.iter().map(AsRef::as_ref).collect(),
            SqlExpr::Case { whens, else_result } => whens
                .iter()
                .flat_map(|(w, r)| [w, r])
                .chain(else_result.iter().map(AsRef::as_ref))
                .collect(),
            SqlExpr::Like { operand, pattern, .. } => vec![operand, pattern],
            SqlExpr::In { operand, values, .. } => std::iter::once(operand.as_ref()).chain(values).collect(),
        }
    }

    /// Visit this node and its descendants, pre-order.
    pub fn walk(&self, f: &mut dyn FnMut(&SqlExpr)) {
        f(self);
        for c in self.children() {
            c.walk(f);
        }
    }

    /// Mutable access to every nested subquery, including those below
    /// scalar children.
    pub fn for_each_subquery_mut(&mut self, f: &mut dyn FnMut(&mut SelectExpression)) {
        match self {
            SqlExpr::Exists { subquery, .. } | SqlExpr::Scalar(subquery) => f(subquery),
            SqlExpr::Column { .. } | SqlExpr::Constant(_) | SqlExpr::Parameter { .. } => {}
            SqlExpr::Binary { left, right, .. } => {
                left.for_each_subquery_mut(f);
                right.for_each_subquery_mut(f);
            }
            SqlExpr::Unary { operand, .. } | SqlExpr::IsNull { operand, .. } | SqlExpr::DatePart { operand, .. } => {
                operand.for_each_subquery_mut(f);
            }
            SqlExpr::Function { args, .. } | SqlExpr::Concat(args) => {
                for a in args {
                    a.for_each_subquery_mut(f);
                }
            }
            SqlExpr::Aggregate { argument, .. } => {
                if let Some(a) = argument {
                    a.for_each_subquery_mut(f);
                }
            }
            SqlExpr::Case { whens, else_result } => {
                for (w, r) in whens {
                    w.for_each_subquery_mut(f);
                    r.for_each_subquery_mut(f);
                }
                if let Some(e) = else_result {
                    e.for_each_subquery_mut(f);
                }
            }
            SqlExpr::Like { operand, pattern, .. } => {
                operand.for_each_subquery_mut(f);
                pattern.for_each_subquery_mut(f);
            }
            SqlExpr::In { operand, values, .. } => {
                operand.for_each_subquery_mut(f);
                for v in values {
                    v.for_each_subquery_mut(f);
                }
            }
        }
    }

    /// Whether an aggregate appears outside nested subqueries.
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| found |= matches!(e, SqlExpr::Aggregate { .. }));
        found
    }

    /// `table.column` for column references.
    pub fn column_display(&self) -> Option<String> {
        match self {
            SqlExpr::Column { table, column, .. } => Some(format!("{table}.{column}")),
            _ => None,
        }
    }
}

/// Store type implied by a value.
pub fn value_type(value: &Value) -> Option<SqlType> {
    Some(match value {
        Value::Null => return None,
        Value::Bool(_) => SqlType::Boolean,
        Value::TinyInt(_) => SqlType::TinyInt,
        Value::SmallInt(_) => SqlType::SmallInt,
        Value::Int(_) => SqlType::Integer,
        Value::BigInt(_) => SqlType::BigInt,
        Value::Float(_) => SqlType::Real,
        Value::Double(_) => SqlType::Double,
        Value::Decimal(_) => SqlType::Decimal {
            precision: 38,
            scale: 10,
        },
        Value::Text(_) => SqlType::Text,
        Value::Bytes(_) => SqlType::Blob,
        Value::Date(_) => SqlType::Date,
        Value::Time(_) => SqlType::Time,
        Value::Timestamp(_) => SqlType::Timestamp,
        Value::TimestampTz(_) => SqlType::TimestampTz,
        Value::Uuid(_) => SqlType::Uuid,
        Value::Json(_) | Value::Array(_) => SqlType::Json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, nullable: bool) -> SqlExpr {
        SqlExpr::column("g", name, SqlType::Text, nullable)
    }

    #[test]
    fn test_conjunction() {
        assert!(SqlExpr::conjunction(Vec::new()).is_none());
        let c = SqlExpr::conjunction(vec![col("A", false), col("B", false), col("C", false)]).unwrap();
        let SqlExpr::Binary { op, left, .. } = c else {
            panic!("expected AND");
        };
        assert_eq!(op, SqlBinaryOp::And);
        assert!(matches!(*left, SqlExpr::Binary { op: SqlBinaryOp::And, .. }));
    }

    #[test]
    fn test_nullability() {
        assert!(!col("Nickname", false).is_nullable());
        assert!(col("LeaderNickname", true).is_nullable());
        let coalesced = SqlExpr::function(
            "COALESCE",
            vec![col("LeaderNickname", true), SqlExpr::Constant(Value::from("none"))],
            None,
        );
        assert!(!coalesced.is_nullable());
        assert!(!col("LeaderNickname", true).is_null().is_nullable());
    }

    #[test]
    fn test_types() {
        assert_eq!(SqlExpr::Constant(Value::Int(1)).sql_type(), Some(SqlType::Integer));
        assert_eq!(col("A", false).equal(col("B", false)).sql_type(), Some(SqlType::Boolean));
        assert_eq!(
            SqlExpr::Aggregate {
                function: AggregateFunction::Count,
                argument: None,
                distinct: false
            }
            .sql_type(),
            Some(SqlType::BigInt)
        );
    }

    #[test]
    fn test_walk_and_aggregate_detection() {
        let e = SqlExpr::Aggregate {
            function: AggregateFunction::Sum,
            argument: Some(Box::new(col("Rank", false))),
            distinct: false,
        }
        .equal(SqlExpr::Constant(Value::Int(3)));
        let mut seen = 0;
        e.walk(&mut |_| seen += 1);
        assert_eq!(seen, 4);
        assert!(e.contains_aggregate());
    }
}
