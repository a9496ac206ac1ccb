//! Language-level query expressions.
//!
//! An [`Expr`] is what a caller writes inside a query operator: lambda
//! parameters, member access, operators, method calls and nested
//! subqueries. The translation pipeline rewrites these trees stage by stage;
//! a few variants ([`Expr::Source`], [`Expr::Group`], [`Expr::Aggregate`],
//! [`Expr::Correlated`]) only appear in trees produced by the pipeline.
//!
//! ```
//! use relmap_query::Expr;
//!
//! // g => g.Nickname == "Marcus" && g.Squad.Name != null
//! let predicate = Expr::param("g")
//!     .member("Nickname")
//!     .eq(Expr::constant("Marcus"))
//!     .and(Expr::param("g").member("Squad").member("Name").ne(Expr::null()));
//! assert_eq!(
//!     predicate.to_string(),
//!     "((g.Nickname == \"Marcus\") && (g.Squad.Name != null))"
//! );
//! ```

use crate::pipeline::navigation::{ExpandedQuery, GroupRef, SourceRef};
use crate::query::Query;
use relmap_core::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Operators
// ============================================================================

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
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
    AndAlso,
    OrElse,
}

impl BinaryOp {
    /// Source-level spelling.
    pub const fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::AndAlso => "&&",
            BinaryOp::OrElse => "||",
        }
    }

    /// Comparison operators produce booleans from non-boolean operands.
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }

    pub const fn is_logical(self) -> bool {
        matches!(self, BinaryOp::AndAlso | BinaryOp::OrElse)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negate,
}

/// Aggregate functions over a group or a whole query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    Count,
    Sum,
    Average,
    Min,
    Max,
}

impl AggregateFunction {
    /// Operator name as written in a query.
    pub const fn name(self) -> &'static str {
        match self {
            AggregateFunction::Count => "Count",
            AggregateFunction::Sum => "Sum",
            AggregateFunction::Average => "Average",
            AggregateFunction::Min => "Min",
            AggregateFunction::Max => "Max",
        }
    }

    /// Parse an operator name.
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "Count" | "LongCount" => Some(AggregateFunction::Count),
            "Sum" => Some(AggregateFunction::Sum),
            "Average" => Some(AggregateFunction::Average),
            "Min" => Some(AggregateFunction::Min),
            "Max" => Some(AggregateFunction::Max),
            _ => None,
        }
    }
}

// ============================================================================
// Lambda
// ============================================================================

/// An anonymous function passed to a query operator.
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Expr,
}

impl Lambda {
    /// Single-parameter lambda.
    pub fn new(param: impl Into<String>, body: Expr) -> Self {
        Self {
            params: vec![param.into()],
            body,
        }
    }

    /// Lambda with two parameters (join result selectors).
    pub fn binary(first: impl Into<String>, second: impl Into<String>, body: Expr) -> Self {
        Self {
            params: vec![first.into(), second.into()],
            body,
        }
    }
}

impl fmt::Display for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.len() == 1 {
            write!(f, "{} => {}", self.params[0], self.body)
        } else {
            write!(f, "({}) => {}", self.params.join(", "), self.body)
        }
    }
}

// ============================================================================
// Expr
// ============================================================================

/// A query expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Reference to a lambda parameter.
    Parameter(String),
    /// Literal value, inlined into SQL.
    Constant(Value),
    /// Captured variable; becomes a SQL parameter.
    Captured { name: String, value: Value },
    /// `target.member`: a mapped property, a navigation or an unmapped member.
    Member { target: Box<Expr>, member: String },
    /// Explicit property access by name; reaches shadow properties.
    Property { target: Box<Expr>, property: String },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Conditional {
        test: Box<Expr>,
        if_true: Box<Expr>,
        if_false: Box<Expr>,
    },
    Coalesce { left: Box<Expr>, right: Box<Expr> },
    /// Anonymous object construction.
    New(Vec<(String, Expr)>),
    /// Instance (`target` set) or static method call.
    Call {
        target: Option<Box<Expr>>,
        method: String,
        args: Vec<Expr>,
    },
    Lambda(Box<Lambda>),
    /// Nested query, usually over a collection navigation.
    Subquery(Box<Query>),

    /// A table source bound by navigation expansion.
    Source(SourceRef),
    /// The element of a grouped query.
    Group(Box<GroupRef>),
    /// Aggregate over the current group.
    Aggregate {
        function: AggregateFunction,
        argument: Option<Box<Expr>>,
    },
    /// A subquery after navigation expansion.
    Correlated(Box<ExpandedQuery>),
}

impl Expr {
    pub fn param(name: impl Into<String>) -> Self {
        Expr::Parameter(name.into())
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Expr::Constant(value.into())
    }

    pub fn null() -> Self {
        Expr::Constant(Value::Null)
    }

    /// A captured variable, sent as a parameter.
    pub fn captured(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::Captured {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn member(self, member: impl Into<String>) -> Self {
        Expr::Member {
            target: Box::new(self),
            member: member.into(),
        }
    }

    /// Access a property by name, including shadow properties.
    pub fn property(self, property: impl Into<String>) -> Self {
        Expr::Property {
            target: Box::new(self),
            property: property.into(),
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Equal, self, other)
    }

    pub fn ne(self, other: Expr) -> Self {
        Self::binary(BinaryOp::NotEqual, self, other)
    }

    pub fn lt(self, other: Expr) -> Self {
        Self::binary(BinaryOp::LessThan, self, other)
    }

    pub fn le(self, other: Expr) -> Self {
        Self::binary(BinaryOp::LessThanOrEqual, self, other)
    }

    pub fn gt(self, other: Expr) -> Self {
        Self::binary(BinaryOp::GreaterThan, self, other)
    }

    pub fn ge(self, other: Expr) -> Self {
        Self::binary(BinaryOp::GreaterThanOrEqual, self, other)
    }

    pub fn and(self, other: Expr) -> Self {
        Self::binary(BinaryOp::AndAlso, self, other)
    }

    pub fn or(self, other: Expr) -> Self {
        Self::binary(BinaryOp::OrElse, self, other)
    }

    pub fn add(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Add, self, other)
    }

    pub fn sub(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Subtract, self, other)
    }

    pub fn mul(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Multiply, self, other)
    }

    pub fn div(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Divide, self, other)
    }

    pub fn rem(self, other: Expr) -> Self {
        Self::binary(BinaryOp::Modulo, self, other)
    }

    pub fn not(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(self),
        }
    }

    pub fn neg(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Negate,
            operand: Box::new(self),
        }
    }

    /// `self ?? other`
    pub fn coalesce(self, other: Expr) -> Self {
        Expr::Coalesce {
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    /// `test ? if_true : if_false`
    pub fn conditional(test: Expr, if_true: Expr, if_false: Expr) -> Self {
        Expr::Conditional {
            test: Box::new(test),
            if_true: Box::new(if_true),
            if_false: Box::new(if_false),
        }
    }

    /// Anonymous object `new { a = .., b = .. }`.
    pub fn new_object<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Expr)>,
        S: Into<String>,
    {
        Expr::New(fields.into_iter().map(|(n, e)| (n.into(), e)).collect())
    }

    /// Instance method call.
    pub fn call(self, method: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            target: Some(Box::new(self)),
            method: method.into(),
            args,
        }
    }

    /// Static method call, e.g. `Math.Abs` or `string.IsNullOrEmpty`.
    pub fn static_call(method: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            target: None,
            method: method.into(),
            args,
        }
    }

    pub fn lambda(param: impl Into<String>, body: Expr) -> Self {
        Expr::Lambda(Box::new(Lambda::new(param, body)))
    }

    pub fn subquery(query: Query) -> Self {
        Expr::Subquery(Box::new(query))
    }

    /// Constant or captured value, if this is one.
    pub fn literal_value(&self) -> Option<&Value> {
        match self {
            Expr::Constant(v) | Expr::Captured { value: v, .. } => Some(v),
            _ => None,
        }
    }

    /// Direct children, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Parameter(_)
            | Expr::Constant(_)
            | Expr::Captured { .. }
            | Expr::Source(_)
            | Expr::Subquery(_)
            | Expr::Correlated(_) => Vec::new(),
            Expr::Member { target, .. } | Expr::Property { target, .. } => vec![target],
            Expr::Binary { left, right, .. } | Expr::Coalesce { left, right } => vec![left, right],
            Expr::Unary { operand, .. } => vec![operand],
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => vec![test, if_true, if_false],
            Expr::New(fields) => fields.iter().map(|(_, e)| e).collect(),
            Expr::Call { target, args, .. } => target.iter().map(AsRef::as_ref).chain(args).collect(),
            Expr::Lambda(l) => vec![&l.body],
            Expr::Group(g) => vec![&g.key, &g.element],
            Expr::Aggregate { argument, .. } => argument.iter().map(AsRef::as_ref).collect(),
        }
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::Constant(value)
    }
}

fn fmt_literal(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::Null => f.write_str("null"),
        Value::Text(s) => write!(f, "\"{s}\""),
        other => write!(f, "{other}"),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Parameter(name) => f.write_str(name),
            Expr::Constant(v) => fmt_literal(f, v),
            Expr::Captured { name, .. } => f.write_str(name),
            Expr::Member { target, member } => write!(f, "{target}.{member}"),
            Expr::Property { target, property } => {
                write!(f, "{target}[\"{property}\"]")
            }
            Expr::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Unary { op: UnaryOp::Not, operand } => write!(f, "!{operand}"),
            Expr::Unary {
                op: UnaryOp::Negate,
                operand,
            } => write!(f, "-{operand}"),
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => write!(f, "({test} ? {if_true} : {if_false})"),
            Expr::Coalesce { left, right } => write!(f, "({left} ?? {right})"),
            Expr::New(fields) => {
                f.write_str("new { ")?;
                for (i, (name, e)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name} = {e}")?;
                }
                f.write_str(" }")
            }
            Expr::Call { target, method, args } => {
                if let Some(t) = target {
                    write!(f, "{t}.")?;
                }
                write!(f, "{method}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
            Expr::Lambda(l) => write!(f, "{l}"),
            Expr::Subquery(q) => write!(f, "{q}"),
            Expr::Source(s) => f.write_str(&s.alias),
            Expr::Group(g) => write!(f, "group({})", g.key),
            Expr::Aggregate { function, argument } => match argument {
                Some(a) => write!(f, "{}({a})", function.name()),
                None => write!(f, "{}()", function.name()),
            },
            Expr::Correlated(q) => write!(f, "subquery({})", q.root.alias),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_member_chain_and_call() {
        let e = Expr::param("g")
            .member("FullName")
            .call("StartsWith", vec![Expr::captured("prefix", "Mar")]);
        assert_eq!(e.to_string(), "g.FullName.StartsWith(prefix)");

        let e = Expr::static_call("string.IsNullOrEmpty", vec![Expr::param("g").member("LeaderNickname")]);
        assert_eq!(e.to_string(), "string.IsNullOrEmpty(g.LeaderNickname)");
    }

    #[test]
    fn test_display_shadow_property_and_object() {
        let e = Expr::new_object([
            ("Nickname", Expr::param("g").member("Nickname")),
            ("Discriminator", Expr::param("g").property("Discriminator")),
        ]);
        assert_eq!(
            e.to_string(),
            "new { Nickname = g.Nickname, Discriminator = g[\"Discriminator\"] }"
        );
    }

    #[test]
    fn test_children_in_order() {
        let e = Expr::conditional(
            Expr::param("a"),
            Expr::constant(1),
            Expr::param("g").call("Max", vec![Expr::constant(2)]),
        );
        let kids = e.children();
        assert_eq!(kids.len(), 3);
        assert_eq!(kids[2].children().len(), 2);
    }

    #[test]
    fn test_aggregate_names() {
        assert_eq!(AggregateFunction::from_method("LongCount"), Some(AggregateFunction::Count));
        assert_eq!(AggregateFunction::from_method("Average").map(AggregateFunction::name), Some("Average"));
        assert!(AggregateFunction::from_method("Aggregate").is_none());
    }
}
