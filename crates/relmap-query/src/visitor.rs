//! Expression visitor framework.
//!
//! Every pipeline stage is written against these two traits:
//!
//! - [`ExprVisitor`] walks a tree read-only, with `enter`/`exit` hooks. A
//!   visitor can prune a subtree by returning `false` from `enter`.
//! - [`ExprRewriter`] consumes a tree and rebuilds it. `pre` may replace a
//!   node outright (stopping descent) and `post` sees each node after its
//!   children were rewritten.
//!
//! Subqueries ([`Expr::Subquery`], [`Expr::Correlated`]) are opaque to both:
//! a stage that needs to look inside handles them explicitly.

use crate::expr::{Expr, Lambda};
use crate::query::{Operator, Query, QuerySource, Terminal};
use std::collections::BTreeMap;
use std::convert::Infallible;

// ============================================================================
// Read-only traversal
// ============================================================================

/// Read-only, pre/post-order expression visitor.
pub trait ExprVisitor {
    type Error;

    /// Called before the children. Returning `false` skips them.
    fn enter(&mut self, _expr: &Expr) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// Called after the children.
    fn exit(&mut self, _expr: &Expr) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Walk `expr` depth-first with `visitor`.
pub fn walk<V: ExprVisitor + ?Sized>(visitor: &mut V, expr: &Expr) -> Result<(), V::Error> {
    if visitor.enter(expr)? {
        for child in expr.children() {
            walk(visitor, child)?;
        }
    }
    visitor.exit(expr)
}

struct AnyNode<F>(F, bool);

impl<F: FnMut(&Expr) -> bool> ExprVisitor for AnyNode<F> {
    type Error = Infallible;

    fn enter(&mut self, expr: &Expr) -> Result<bool, Infallible> {
        if self.1 {
            return Ok(false);
        }
        self.1 = (self.0)(expr);
        Ok(!self.1)
    }
}

/// True when any node of `expr` satisfies `pred`.
pub fn any_node(expr: &Expr, pred: impl FnMut(&Expr) -> bool) -> bool {
    let mut v = AnyNode(pred, false);
    match walk(&mut v, expr) {
        Ok(()) => v.1,
        Err(never) => match never {},
    }
}

// ============================================================================
// Rewriting
// ============================================================================

/// Outcome of [`ExprRewriter::pre`].
#[derive(Debug)]
pub enum Rewrite {
    /// Keep descending into this node's children.
    Continue(Expr),
    /// Use this node as-is; do not visit its children.
    Done(Expr),
}

/// Tree-rebuilding visitor.
pub trait ExprRewriter {
    type Error;

    fn pre(&mut self, expr: Expr) -> Result<Rewrite, Self::Error> {
        Ok(Rewrite::Continue(expr))
    }

    fn post(&mut self, expr: Expr) -> Result<Expr, Self::Error> {
        Ok(expr)
    }
}

/// Rewrite `expr` with `rewriter`.
pub fn rewrite<R: ExprRewriter + ?Sized>(rewriter: &mut R, expr: Expr) -> Result<Expr, R::Error> {
    match rewriter.pre(expr)? {
        Rewrite::Done(e) => Ok(e),
        Rewrite::Continue(e) => {
            let e = map_children(e, |c| rewrite(rewriter, c))?;
            rewriter.post(e)
        }
    }
}

/// Rebuild `expr` with each direct child replaced by `f(child)`.
pub fn map_children<E>(expr: Expr, mut f: impl FnMut(Expr) -> Result<Expr, E>) -> Result<Expr, E> {
    let mut boxed = |b: Box<Expr>| f(*b).map(Box::new);
    Ok(match expr {
        Expr::Member { target, member } => Expr::Member {
            target: boxed(target)?,
            member,
        },
        Expr::Property { target, property } => Expr::Property {
            target: boxed(target)?,
            property,
        },
        Expr::Binary { op, left, right } => Expr::Binary {
            op,
            left: boxed(left)?,
            right: boxed(right)?,
        },
        Expr::Unary { op, operand } => Expr::Unary {
            op,
            operand: boxed(operand)?,
        },
        Expr::Conditional {
            test,
            if_true,
            if_false,
        } => Expr::Conditional {
            test: boxed(test)?,
            if_true: boxed(if_true)?,
            if_false: boxed(if_false)?,
        },
        Expr::Coalesce { left, right } => Expr::Coalesce {
            left: boxed(left)?,
            right: boxed(right)?,
        },
        Expr::New(fields) => Expr::New(
            fields
                .into_iter()
                .map(|(n, e)| boxed(Box::new(e)).map(|e| (n, *e)))
                .collect::<Result<_, E>>()?,
        ),
        Expr::Call { target, method, args } => {
            let target = target.map(&mut boxed).transpose()?;
            let args = args
                .into_iter()
                .map(|a| boxed(Box::new(a)).map(|a| *a))
                .collect::<Result<_, E>>()?;
            Expr::Call { target, method, args }
        }
        Expr::Lambda(l) => {
            let Lambda { params, body } = *l;
            Expr::Lambda(Box::new(Lambda {
                params,
                body: *boxed(Box::new(body))?,
            }))
        }
        Expr::Group(g) => {
            let mut g = *g;
            g.key = *boxed(Box::new(g.key))?;
            g.element = *boxed(Box::new(g.element))?;
            Expr::Group(Box::new(g))
        }
        Expr::Aggregate { function, argument } => Expr::Aggregate {
            function,
            argument: argument.map(&mut boxed).transpose()?,
        },
        leaf @ (Expr::Parameter(_)
        | Expr::Constant(_)
        | Expr::Captured { .. }
        | Expr::Source(_)
        | Expr::Subquery(_)
        | Expr::Correlated(_)) => leaf,
    })
}

// ============================================================================
// Parameter substitution
// ============================================================================

/// Replaces lambda parameters by bound expressions.
///
/// Nested lambdas that rebind a name shadow the outer binding. Unlike the
/// generic traversal, substitution descends into nested subqueries so that
/// correlated references to outer parameters are bound too.
#[derive(Debug, Default)]
pub struct ParameterReplacer {
    bindings: BTreeMap<String, Expr>,
}

impl ParameterReplacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: impl Into<String>, value: Expr) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }

    /// Apply a lambda to arguments: substitute its parameters into its body.
    pub fn apply(lambda: &Lambda, args: &[Expr]) -> Expr {
        let mut r = Self::new();
        for (p, a) in lambda.params.iter().zip(args) {
            r.bindings.insert(p.clone(), a.clone());
        }
        r.replace(lambda.body.clone())
    }

    /// Replace bound parameters in `expr`.
    pub fn replace(&mut self, expr: Expr) -> Expr {
        match rewrite(self, expr) {
            Ok(e) => e,
            Err(never) => match never {},
        }
    }

    fn shadowed(&self, params: &[String]) -> Self {
        Self {
            bindings: self
                .bindings
                .iter()
                .filter(|(k, _)| !params.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn replace_lambda(&self, lambda: Lambda) -> Lambda {
        let Lambda { params, body } = lambda;
        let body = self.shadowed(&params).replace(body);
        Lambda { params, body }
    }

    /// Replace bound parameters inside a nested query.
    pub fn replace_in_query(&mut self, query: Query) -> Query {
        let source = match query.source {
            QuerySource::Navigation(e) => QuerySource::Navigation(Box::new(self.replace(*e))),
            set @ QuerySource::Set(_) => set,
        };
        let operators = query
            .operators
            .into_iter()
            .map(|op| match op {
                Operator::Filter(l) => Operator::Filter(self.replace_lambda(l)),
                Operator::Select(l) => Operator::Select(self.replace_lambda(l)),
                Operator::SelectMany(l) => Operator::SelectMany(self.replace_lambda(l)),
                Operator::GroupBy(l) => Operator::GroupBy(self.replace_lambda(l)),
                Operator::OrderBy { key, descending, then } => Operator::OrderBy {
                    key: self.replace_lambda(key),
                    descending,
                    then,
                },
                Operator::Skip(e) => Operator::Skip(self.replace(e)),
                Operator::Take(e) => Operator::Take(self.replace(e)),
                Operator::Join {
                    inner,
                    outer_key,
                    inner_key,
                    result,
                } => Operator::Join {
                    inner: Box::new(self.replace_in_query(*inner)),
                    outer_key: self.replace_lambda(outer_key),
                    inner_key: self.replace_lambda(inner_key),
                    result: self.replace_lambda(result),
                },
                Operator::SetOperation { kind, other } => Operator::SetOperation {
                    kind,
                    other: Box::new(self.replace_in_query(*other)),
                },
                other @ (Operator::Distinct | Operator::OfType(_)) => other,
            })
            .collect();
        let terminal = query.terminal.map(|t| Terminal {
            kind: t.kind,
            lambda: t.lambda.map(|l| self.replace_lambda(l)),
        });
        Query {
            source,
            operators,
            terminal,
        }
    }
}

impl ExprRewriter for ParameterReplacer {
    type Error = Infallible;

    fn pre(&mut self, expr: Expr) -> Result<Rewrite, Infallible> {
        match expr {
            Expr::Parameter(name) => Ok(Rewrite::Done(
                self.bindings.get(&name).cloned().unwrap_or(Expr::Parameter(name)),
            )),
            Expr::Lambda(l) if l.params.iter().any(|p| self.bindings.contains_key(p)) => {
                Ok(Rewrite::Done(Expr::Lambda(Box::new(self.replace_lambda(*l)))))
            }
            Expr::Subquery(q) => Ok(Rewrite::Done(Expr::Subquery(Box::new(self.replace_in_query(*q))))),
            other => Ok(Rewrite::Continue(other)),
        }
    }
}
