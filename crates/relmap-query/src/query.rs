//! Query operator chains.
//!
//! A [`Query`] starts from an entity set (or a collection navigation inside
//! another query) and applies operators in order. At most one terminal
//! operator closes the chain.
//!
//! ```
//! use relmap_query::{Expr, Query};
//!
//! let q = Query::from("Gear")
//!     .filter("g", Expr::param("g").member("HasSoulPatch"))
//!     .order_by("g", Expr::param("g").member("Nickname"))
//!     .select("g", Expr::param("g").member("FullName"));
//! assert_eq!(q.operators.len(), 3);
//! assert!(q.terminal.is_none());
//! ```

use crate::expr::{Expr, Lambda};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a query reads from.
#[derive(Debug, Clone, PartialEq)]
pub enum QuerySource {
    /// All instances of an entity type.
    Set(String),
    /// A collection navigation of an outer query element, e.g. `g.Weapons`.
    Navigation(Box<Expr>),
}

/// Set operators combining two queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetOperationKind {
    Union,
    Concat,
    Intersect,
    Except,
}

impl SetOperationKind {
    /// SQL keyword.
    pub const fn keyword(self) -> &'static str {
        match self {
            SetOperationKind::Union => "UNION",
            SetOperationKind::Concat => "UNION ALL",
            SetOperationKind::Intersect => "INTERSECT",
            SetOperationKind::Except => "EXCEPT",
        }
    }
}

/// Non-terminal operators.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Filter(Lambda),
    Select(Lambda),
    SelectMany(Lambda),
    OrderBy {
        key: Lambda,
        descending: bool,
        /// `ThenBy`: append to the existing ordering instead of replacing it.
        then: bool,
    },
    GroupBy(Lambda),
    Distinct,
    Skip(Expr),
    Take(Expr),
    Join {
        inner: Box<Query>,
        outer_key: Lambda,
        inner_key: Lambda,
        result: Lambda,
    },
    OfType(String),
    SetOperation {
        kind: SetOperationKind,
        other: Box<Query>,
    },
}

impl Operator {
    /// Operator name as written in a query.
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Filter(_) => "Where",
            Operator::Select(_) => "Select",
            Operator::SelectMany(_) => "SelectMany",
            Operator::OrderBy {
                descending: false,
                then: false,
                ..
            } => "OrderBy",
            Operator::OrderBy {
                descending: true,
                then: false,
                ..
            } => "OrderByDescending",
            Operator::OrderBy {
                descending: false,
                then: true,
                ..
            } => "ThenBy",
            Operator::OrderBy {
                descending: true,
                then: true,
                ..
            } => "ThenByDescending",
            Operator::GroupBy(_) => "GroupBy",
            Operator::Distinct => "Distinct",
            Operator::Skip(_) => "Skip",
            Operator::Take(_) => "Take",
            Operator::Join { .. } => "Join",
            Operator::OfType(_) => "OfType",
            Operator::SetOperation { kind, .. } => match kind {
                SetOperationKind::Union => "Union",
                SetOperationKind::Concat => "Concat",
                SetOperationKind::Intersect => "Intersect",
                SetOperationKind::Except => "Except",
            },
        }
    }
}

/// Operators that end a query and decide its result cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalKind {
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
    Count,
    Any,
    All,
    Sum,
    Average,
    Min,
    Max,
}

impl TerminalKind {
    pub const fn name(self) -> &'static str {
        match self {
            TerminalKind::First => "First",
            TerminalKind::FirstOrDefault => "FirstOrDefault",
            TerminalKind::Single => "Single",
            TerminalKind::SingleOrDefault => "SingleOrDefault",
            TerminalKind::Count => "Count",
            TerminalKind::Any => "Any",
            TerminalKind::All => "All",
            TerminalKind::Sum => "Sum",
            TerminalKind::Average => "Average",
            TerminalKind::Min => "Min",
            TerminalKind::Max => "Max",
        }
    }

    /// Sum, Average, Min and Max.
    pub const fn is_aggregate(self) -> bool {
        matches!(
            self,
            TerminalKind::Sum | TerminalKind::Average | TerminalKind::Min | TerminalKind::Max
        )
    }

    /// Terminals whose lambda is a predicate rather than a selector.
    pub const fn takes_predicate(self) -> bool {
        matches!(
            self,
            TerminalKind::First
                | TerminalKind::FirstOrDefault
                | TerminalKind::Single
                | TerminalKind::SingleOrDefault
                | TerminalKind::Count
                | TerminalKind::Any
                | TerminalKind::All
        )
    }
}

/// A terminal operator with its optional predicate or selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Terminal {
    pub kind: TerminalKind,
    pub lambda: Option<Lambda>,
}

/// A query: a source, an operator chain and an optional terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub source: QuerySource,
    pub operators: Vec<Operator>,
    pub terminal: Option<Terminal>,
}

impl Query {
    /// Query all instances of an entity type (including derived types).
    pub fn from(entity_type: impl Into<String>) -> Self {
        Self {
            source: QuerySource::Set(entity_type.into()),
            operators: Vec::new(),
            terminal: None,
        }
    }

    /// Query a collection navigation of an outer element, e.g. `g.Weapons`.
    pub fn over(collection: Expr) -> Self {
        Self {
            source: QuerySource::Navigation(Box::new(collection)),
            operators: Vec::new(),
            terminal: None,
        }
    }

    fn push(mut self, op: Operator) -> Self {
        self.operators.push(op);
        self
    }

    fn finish(mut self, kind: TerminalKind, lambda: Option<Lambda>) -> Self {
        self.terminal = Some(Terminal { kind, lambda });
        self
    }

    pub fn filter(self, param: &str, predicate: Expr) -> Self {
        self.push(Operator::Filter(Lambda::new(param, predicate)))
    }

    pub fn select(self, param: &str, selector: Expr) -> Self {
        self.push(Operator::Select(Lambda::new(param, selector)))
    }

    /// Flatten a collection navigation of each element.
    pub fn select_many(self, param: &str, collection: Expr) -> Self {
        self.push(Operator::SelectMany(Lambda::new(param, collection)))
    }

    pub fn order_by(self, param: &str, key: Expr) -> Self {
        self.push(Operator::OrderBy {
            key: Lambda::new(param, key),
            descending: false,
            then: false,
        })
    }

    pub fn order_by_descending(self, param: &str, key: Expr) -> Self {
        self.push(Operator::OrderBy {
            key: Lambda::new(param, key),
            descending: true,
            then: false,
        })
    }

    pub fn then_by(self, param: &str, key: Expr) -> Self {
        self.push(Operator::OrderBy {
            key: Lambda::new(param, key),
            descending: false,
            then: true,
        })
    }

    pub fn then_by_descending(self, param: &str, key: Expr) -> Self {
        self.push(Operator::OrderBy {
            key: Lambda::new(param, key),
            descending: true,
            then: true,
        })
    }

    pub fn group_by(self, param: &str, key: Expr) -> Self {
        self.push(Operator::GroupBy(Lambda::new(param, key)))
    }

    pub fn distinct(self) -> Self {
        self.push(Operator::Distinct)
    }

    pub fn skip(self, count: Expr) -> Self {
        self.push(Operator::Skip(count))
    }

    pub fn take(self, count: Expr) -> Self {
        self.push(Operator::Take(count))
    }

    /// Inner join with another query on equal keys.
    pub fn join(self, inner: Query, outer_key: Lambda, inner_key: Lambda, result: Lambda) -> Self {
        self.push(Operator::Join {
            inner: Box::new(inner),
            outer_key,
            inner_key,
            result,
        })
    }

    /// Restrict to instances of a derived type.
    pub fn of_type(self, entity_type: impl Into<String>) -> Self {
        self.push(Operator::OfType(entity_type.into()))
    }

    pub fn union(self, other: Query) -> Self {
        self.set_operation(SetOperationKind::Union, other)
    }

    pub fn concat(self, other: Query) -> Self {
        self.set_operation(SetOperationKind::Concat, other)
    }

    pub fn intersect(self, other: Query) -> Self {
        self.set_operation(SetOperationKind::Intersect, other)
    }

    pub fn except(self, other: Query) -> Self {
        self.set_operation(SetOperationKind::Except, other)
    }

    fn set_operation(self, kind: SetOperationKind, other: Query) -> Self {
        self.push(Operator::SetOperation {
            kind,
            other: Box::new(other),
        })
    }

    pub fn first(self) -> Self {
        self.finish(TerminalKind::First, None)
    }

    pub fn first_or_default(self) -> Self {
        self.finish(TerminalKind::FirstOrDefault, None)
    }

    pub fn single(self) -> Self {
        self.finish(TerminalKind::Single, None)
    }

    pub fn single_or_default(self) -> Self {
        self.finish(TerminalKind::SingleOrDefault, None)
    }

    pub fn count(self) -> Self {
        self.finish(TerminalKind::Count, None)
    }

    pub fn any(self) -> Self {
        self.finish(TerminalKind::Any, None)
    }

    pub fn any_where(self, param: &str, predicate: Expr) -> Self {
        self.finish(TerminalKind::Any, Some(Lambda::new(param, predicate)))
    }

    pub fn all(self, param: &str, predicate: Expr) -> Self {
        self.finish(TerminalKind::All, Some(Lambda::new(param, predicate)))
    }

    pub fn sum(self, param: &str, selector: Expr) -> Self {
        self.finish(TerminalKind::Sum, Some(Lambda::new(param, selector)))
    }

    pub fn average(self, param: &str, selector: Expr) -> Self {
        self.finish(TerminalKind::Average, Some(Lambda::new(param, selector)))
    }

    pub fn min(self, param: &str, selector: Expr) -> Self {
        self.finish(TerminalKind::Min, Some(Lambda::new(param, selector)))
    }

    pub fn max(self, param: &str, selector: Expr) -> Self {
        self.finish(TerminalKind::Max, Some(Lambda::new(param, selector)))
    }

    /// Aggregate over the current elements without a selector.
    pub fn aggregate(self, kind: TerminalKind) -> Self {
        self.finish(kind, None)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            QuerySource::Set(name) => write!(f, "Set<{name}>()")?,
            QuerySource::Navigation(e) => write!(f, "{e}")?,
        }
        for op in &self.operators {
            write!(f, ".{}(", op.name())?;
            match op {
                Operator::Filter(l)
                | Operator::Select(l)
                | Operator::SelectMany(l)
                | Operator::GroupBy(l)
                | Operator::OrderBy { key: l, .. } => write!(f, "{l}")?,
                Operator::Skip(e) | Operator::Take(e) => write!(f, "{e}")?,
                Operator::OfType(t) => f.write_str(t)?,
                Operator::Join { inner, .. } => write!(f, "{inner}, ..")?,
                Operator::SetOperation { other, .. } => write!(f, "{other}")?,
                Operator::Distinct => {}
            }
            f.write_str(")")?;
        }
        if let Some(t) = &self.terminal {
            write!(f, ".{}(", t.kind.name())?;
            if let Some(l) = &t.lambda {
                write!(f, "{l}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}
