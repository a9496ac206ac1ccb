//! Predicate and projection lowering.
//!
//! Turns an [`ExpandedQuery`] into a [`SelectExpression`] plus a
//! [`ResultShape`]. Every expression is first tried on the server. Where
//! that fails:
//!
//! - in predicates, orderings, grouping and join keys the construct is
//!   recorded as a failure (there is nothing to evaluate on the client);
//! - in projections the construct is marked client-evaluated, and fails only
//!   when no client function is registered for it;
//! - inside a group aggregate translation stops at once with
//!   `AggregateOverClientEvaluation`, since the rows it would need are gone.

use super::methods;
use super::navigation::{AliasGenerator, ExpandedJoin, ExpandedQuery, SourceRef};
use super::shape::Shape;
use crate::client::{ClientExpr, ClientFunctions};
use crate::expr::{AggregateFunction, BinaryOp, Expr, UnaryOp};
use crate::query::TerminalKind;
use crate::result::{ConcreteType, EntityShape, ResultCardinality, ResultShape, SplitQuery};
use crate::sql::{JoinKind, ProjectionColumn, SelectExpression, SqlBinaryOp, SqlExpr, SqlUnaryOp, TableSource};
use relmap_core::{SqlType, TranslationError, Value};
use relmap_metadata::{EntityTypeId, ForeignKeyId, MappingStrategy, Model, PropertyId};
use std::collections::{BTreeMap, BTreeSet};

/// Tables backing one query source.
#[derive(Debug, Clone)]
pub(crate) struct SourceBinding {
    pub entity_type: EntityTypeId,
    /// Alias of the main table.
    pub alias: String,
    /// Alias per hierarchy type; table-per-type only.
    pub tables: Vec<(EntityTypeId, String)>,
    /// Reached through an outer join.
    pub nullable: bool,
}

/// A construct that could be evaluated nowhere.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Failure {
    pub construct: String,
    pub expression: String,
}

/// Identifying columns a Distinct/GroupBy split query must keep.
#[derive(Debug, Clone)]
pub(crate) struct IdentifyingCheck {
    /// Key columns of every source of the split, in order.
    pub required: Vec<SqlExpr>,
    /// The user projection (Distinct) or the grouping keys (GroupBy).
    pub available: Vec<SqlExpr>,
}

/// Output of lowering, consumed by the later stages.
#[derive(Debug)]
pub(crate) struct LoweredQuery {
    pub select: SelectExpression,
    pub shape: ResultShape,
    pub splits: Vec<SplitQuery>,
    pub cardinality: ResultCardinality,
    pub terminal: Option<TerminalKind>,
    pub identifying: Vec<IdentifyingCheck>,
    /// Keys of client-evaluated constructs in the projection.
    pub client_constructs: Vec<String>,
    pub failures: Vec<Failure>,
}

enum LowerError {
    /// No server translation; the construct may run on the client.
    Client(String),
    Fatal(TranslationError),
}

impl From<TranslationError> for LowerError {
    fn from(e: TranslationError) -> Self {
        LowerError::Fatal(e)
    }
}

type Lowering<T> = std::result::Result<T, LowerError>;

pub(crate) struct Lowerer<'a> {
    model: &'a Model,
    functions: &'a ClientFunctions,
    aliases: AliasGenerator,
    bindings: BTreeMap<String, SourceBinding>,
    splits: Vec<Option<SplitQuery>>,
    identifying: Vec<IdentifyingCheck>,
    client_constructs: Vec<String>,
    failures: Vec<Failure>,
}

impl<'a> Lowerer<'a> {
    pub(crate) fn new(model: &'a Model, functions: &'a ClientFunctions, aliases: AliasGenerator) -> Self {
        Self {
            model,
            functions,
            aliases,
            bindings: BTreeMap::new(),
            splits: Vec::new(),
            identifying: Vec::new(),
            client_constructs: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Lower a top-level query.
    pub(crate) fn lower(mut self, q: &ExpandedQuery) -> Result<LoweredQuery, TranslationError> {
        let terminal = q.terminal.as_ref().map(|t| t.kind);
        let mut select = self.lower_clauses(q, false)?;

        let (shape, cardinality) = match terminal {
            None => (self.project_with_set_operations(q, &mut select)?, ResultCardinality::Sequence),
            Some(kind @ (TerminalKind::First | TerminalKind::FirstOrDefault | TerminalKind::Single | TerminalKind::SingleOrDefault)) => {
                let shape = self.project_with_set_operations(q, &mut select)?;
                let take = if matches!(kind, TerminalKind::First | TerminalKind::FirstOrDefault) { 1 } else { 2 };
                select = self.limit_to(select, take);
                let cardinality = match kind {
                    TerminalKind::First => ResultCardinality::First,
                    TerminalKind::FirstOrDefault => ResultCardinality::FirstOrDefault,
                    TerminalKind::Single => ResultCardinality::Single,
                    _ => ResultCardinality::SingleOrDefault,
                };
                (shape, cardinality)
            }
            Some(TerminalKind::Count) => {
                self.count_projection(q, &mut select)?;
                select = self.aggregate(select, TerminalKind::Count, None);
                (scalar(0), ResultCardinality::Scalar(TerminalKind::Count))
            }
            Some(kind @ (TerminalKind::Any | TerminalKind::All)) => {
                let exists = self.exists(q, select, kind).map_err(|e| Self::settle(e, q))?;
                let mut outer = SelectExpression::default();
                outer.add_projection(SqlExpr::Case {
                    whens: vec![(exists, SqlExpr::Constant(Value::Bool(true)))],
                    else_result: Some(Box::new(SqlExpr::Constant(Value::Bool(false)))),
                });
                select = outer;
                (scalar(0), ResultCardinality::Scalar(kind))
            }
            Some(kind) => {
                let shape = self.project_with_set_operations(q, &mut select)?;
                let shape = match shape {
                    ResultShape::Scalar { index, .. } if self.client_constructs.is_empty() => {
                        select = self.aggregate(select, kind, Some(index));
                        scalar(0)
                    }
                    // Checked after lowering: aggregating a client value fails.
                    client @ ResultShape::Client(_) => client,
                    other if !self.client_constructs.is_empty() => other,
                    _ => {
                        return Err(TranslationError::unsupported(format!("{}({})", kind.name(), q.selector))
                            .with_detail("only scalar values can be aggregated"));
                    }
                };
                (shape, ResultCardinality::Scalar(kind))
            }
        };

        let splits = self.splits.into_iter().flatten().collect();
        tracing::debug!(
            target: "relmap::query",
            sources = self.bindings.len(),
            client = self.client_constructs.len(),
            failures = self.failures.len(),
            "lowered query"
        );
        Ok(LoweredQuery {
            select,
            shape,
            splits,
            cardinality,
            terminal,
            identifying: self.identifying,
            client_constructs: self.client_constructs,
            failures: self.failures,
        })
    }

    /// A client-only construct outside a projection is fatal.
    fn settle(e: LowerError, q: &ExpandedQuery) -> TranslationError {
        match e {
            LowerError::Fatal(e) => e,
            LowerError::Client(construct) => TranslationError::unsupported(construct).with_expression(q.selector.to_string()),
        }
    }

    // ========================================================================
    // Sources
    // ========================================================================

    fn binding(&self, alias: &str) -> Lowering<&SourceBinding> {
        self.bindings
            .get(alias)
            .ok_or_else(|| LowerError::Fatal(TranslationError::unsupported(alias.to_string()).with_detail(format!("source '{alias}' is not in scope"))))
    }

    /// Register `source`; table-per-type hierarchies get an alias per type.
    fn prepare(&mut self, source: &SourceRef, nullable: bool) {
        let et = source.entity_type;
        let mut tables = Vec::new();
        if self.model.is_in_hierarchy(et) && self.model.mapping_strategy(et) == MappingStrategy::TablePerType {
            let root = self.model.root(et);
            let chain = self.model.base_chain(et);
            let related = chain.iter().copied().chain(self.model.self_and_descendants(et).into_iter().skip(1));
            for t in related {
                let alias = if t == root {
                    source.alias.clone()
                } else {
                    self.aliases.next(&self.model.table_name(t))
                };
                tables.push((t, alias));
            }
        }
        self.bindings.insert(
            source.alias.clone(),
            SourceBinding {
                entity_type: et,
                alias: source.alias.clone(),
                tables,
                nullable,
            },
        );
    }

    /// Add the tables of a prepared source: FROM when `join` is `None`.
    fn attach(&self, select: &mut SelectExpression, source: &SourceRef, join: Option<(JoinKind, SqlExpr)>) -> Lowering<()> {
        let binding = self.binding(&source.alias)?.clone();
        let root = self.model.root(binding.entity_type);
        let main = TableSource::table(self.model.table_name(root), binding.alias.clone()).for_entity(binding.entity_type);
        match join {
            None => select.from = Some(main),
            Some((kind, on)) => select.add_join(kind, main, on),
        }
        let chain = self.model.base_chain(binding.entity_type);
        let key = self.model.primary_key_properties(root);
        for (t, alias) in binding.tables.iter().filter(|(t, _)| *t != root) {
            let kind = if chain.contains(t) && !binding.nullable {
                JoinKind::Inner
            } else {
                JoinKind::LeftOuter
            };
            let on = SqlExpr::conjunction(key.iter().map(|p| {
                let (column, sql_type) = self.column_meta(*p);
                SqlExpr::column(alias.clone(), column.clone(), sql_type, false).equal(SqlExpr::column(binding.alias.clone(), column, sql_type, false))
            }))
            .unwrap_or(SqlExpr::Constant(Value::Bool(true)));
            select.add_join(kind, TableSource::table(self.model.table_name(*t), alias.clone()), on);
        }
        Ok(())
    }

    fn column_meta(&self, property: PropertyId) -> (String, SqlType) {
        let sql_type = self
            .model
            .property(property)
            .map_or(SqlType::Text, relmap_metadata::Property::sql_type);
        (self.model.column_name(property), sql_type)
    }

    /// Column of `property` read through the source `alias`.
    fn column(&self, alias: &str, property: PropertyId) -> Lowering<SqlExpr> {
        let binding = self.binding(alias)?;
        let p = self
            .model
            .property(property)
            .ok_or_else(|| TranslationError::unsupported(format!("{alias}.{property}")))?;
        let declaring = p.declaring_type();
        let table = binding
            .tables
            .iter()
            .find(|(t, _)| *t == declaring)
            .map_or(binding.alias.as_str(), |(_, a)| a.as_str());
        // Columns of derived types are null for rows of other types.
        let nullable = p.is_nullable() || binding.nullable || !self.model.is_assignable_from(declaring, binding.entity_type);
        Ok(SqlExpr::column(table, self.model.column_name(property), p.sql_type(), nullable))
    }

    fn key_columns(&self, source: &SourceRef) -> Lowering<Vec<SqlExpr>> {
        self.model
            .primary_key_properties(source.entity_type)
            .into_iter()
            .map(|p| self.column(&source.alias, p))
            .collect()
    }

    /// `target.pk = source.fk` towards the principal, `target.fk = source.pk`
    /// towards dependents.
    fn navigation_condition(&self, source: &SourceRef, target: &SourceRef, fk: ForeignKeyId, to_principal: bool) -> Lowering<SqlExpr> {
        let (principal_key, dependent) = self.foreign_key_columns(fk)?;
        let pairs = principal_key.into_iter().zip(dependent).map(|(pk, fk)| {
            if to_principal {
                Ok(self.column(&target.alias, pk)?.equal(self.column(&source.alias, fk)?))
            } else {
                Ok(self.column(&target.alias, fk)?.equal(self.column(&source.alias, pk)?))
            }
        });
        let conditions = pairs.collect::<Lowering<Vec<_>>>()?;
        Ok(SqlExpr::conjunction(conditions).unwrap_or(SqlExpr::Constant(Value::Bool(true))))
    }

    /// Principal-key and dependent properties of a foreign key, in order.
    fn foreign_key_columns(&self, fk: ForeignKeyId) -> Lowering<(Vec<PropertyId>, Vec<PropertyId>)> {
        let fk = self
            .model
            .foreign_key(fk)
            .ok_or_else(|| TranslationError::unsupported(format!("{fk}")))?;
        let principal = self
            .model
            .key(fk.principal_key())
            .map(|k| k.properties().to_vec())
            .unwrap_or_default();
        Ok((principal, fk.properties().to_vec()))
    }

    // ========================================================================
    // Clauses
    // ========================================================================

    /// FROM, joins, WHERE, GROUP BY, HAVING, ORDER BY and paging of `q`.
    /// With `correlate`, the correlation to the parent row becomes a
    /// predicate.
    fn lower_clauses(&mut self, q: &ExpandedQuery, correlate: bool) -> Result<SelectExpression, TranslationError> {
        self.clauses(q, correlate).map_err(|e| Self::settle(e, q))
    }

    fn clauses(&mut self, q: &ExpandedQuery, correlate: bool) -> Lowering<SelectExpression> {
        let mut select = SelectExpression::default();
        self.prepare(&q.root, false);
        self.attach(&mut select, &q.root, None)?;

        for join in &q.joins {
            match join {
                ExpandedJoin::Navigation {
                    source,
                    foreign_key,
                    to_principal,
                    target,
                    kind,
                    ..
                } => {
                    let nullable = *kind == JoinKind::LeftOuter || self.binding(&source.alias)?.nullable;
                    self.prepare(target, nullable);
                    let on = self.navigation_condition(source, target, *foreign_key, *to_principal)?;
                    self.attach(&mut select, target, Some((*kind, on)))?;
                }
                ExpandedJoin::Explicit { target, on } => {
                    self.prepare(target, false);
                    let on = self.server_or_fail(on)?;
                    self.attach(&mut select, target, Some((JoinKind::Inner, on)))?;
                }
            }
        }

        if correlate {
            if let Some(correlation) = &q.correlation {
                let (principal_key, dependent) = self.foreign_key_columns(correlation.foreign_key)?;
                for (pk, fk) in principal_key.into_iter().zip(dependent) {
                    let condition = self.column(&q.root.alias, fk)?.equal(self.column(&correlation.parent.alias, pk)?);
                    select.apply_predicate(condition);
                }
            }
        }

        for predicate in &q.predicates {
            let p = self.server_or_fail(predicate)?;
            select.apply_predicate(p);
        }
        if let Some(key) = &q.grouping {
            let keys = match key {
                Expr::New(fields) => fields.iter().map(|(_, e)| e).collect(),
                other => vec![other],
            };
            for k in keys {
                let k = self.server_or_fail(k)?;
                select.group_by.push(k);
            }
        }
        for predicate in &q.having {
            let p = self.server_or_fail(predicate)?;
            select.apply_having(p);
        }
        for ordering in &q.orderings {
            let key = self.server_or_fail(&ordering.key)?;
            select.add_ordering(key, ordering.descending);
        }
        select.distinct = q.distinct;
        if let Some(offset) = &q.offset {
            select.offset = Some(self.server_or_fail(offset)?);
        }
        if let Some(limit) = &q.limit {
            select.limit = Some(self.server_or_fail(limit)?);
        }
        Ok(select)
    }

    /// `LIMIT n`, pushing paging with a non-literal limit into a derived table.
    fn limit_to(&mut self, mut select: SelectExpression, n: i64) -> SelectExpression {
        match select.limit.as_ref().map(|l| l.literal_value().and_then(Value::as_i64)) {
            None => {}
            Some(Some(existing)) if existing <= n => return select,
            Some(Some(_)) => {}
            Some(None) => select = select.push_down(&self.aliases.next("t")),
        }
        select.limit = Some(SqlExpr::Constant(Value::BigInt(n)));
        select
    }

    /// Columns a Count must see when the rows are first paged or reduced.
    fn count_projection(&mut self, q: &ExpandedQuery, select: &mut SelectExpression) -> Result<(), TranslationError> {
        if !select.requires_push_down() {
            return Ok(());
        }
        if select.distinct || !select.set_operations.is_empty() || !q.set_operations.is_empty() {
            self.project_with_set_operations(q, select)?;
        } else if !select.group_by.is_empty() {
            for key in select.group_by.clone() {
                select.add_projection(key);
            }
        }
        Ok(())
    }

    /// Reduce `select` to one aggregate row. `argument` is the projected
    /// position of the aggregated value.
    fn aggregate(&mut self, mut select: SelectExpression, kind: TerminalKind, argument: Option<usize>) -> SelectExpression {
        if select.requires_push_down() {
            if select.projection.is_empty() {
                select.add_projection(SqlExpr::Constant(Value::Int(1)));
            }
            select = select.push_down(&self.aliases.next("t"));
        }
        let argument = argument.and_then(|i| select.projection.get(i)).map(|c| Box::new(c.expr.clone()));
        select.orderings.clear();
        let (function, argument) = match kind {
            TerminalKind::Sum => (AggregateFunction::Sum, argument),
            TerminalKind::Average => (AggregateFunction::Average, argument),
            TerminalKind::Min => (AggregateFunction::Min, argument),
            TerminalKind::Max => (AggregateFunction::Max, argument),
            _ => (AggregateFunction::Count, None),
        };
        let mut expr = SqlExpr::Aggregate {
            function,
            argument,
            distinct: false,
        };
        // SUM over no rows is NULL; the sum of nothing is zero.
        if function == AggregateFunction::Sum {
            expr = SqlExpr::function("COALESCE", vec![expr, SqlExpr::Constant(Value::Int(0))], None);
        }
        select.projection = vec![ProjectionColumn { expr, alias: None }];
        select
    }

    /// `EXISTS` (Any) or `NOT EXISTS (... WHERE NOT p)` (All) over `select`.
    fn exists(&mut self, q: &ExpandedQuery, mut select: SelectExpression, kind: TerminalKind) -> Lowering<SqlExpr> {
        select.orderings.clear();
        if kind == TerminalKind::All {
            let predicate = q
                .terminal
                .as_ref()
                .and_then(|t| t.predicate.as_ref())
                .ok_or_else(|| TranslationError::unsupported("All()").with_detail("All requires a predicate"))?;
            if select.requires_push_down() {
                return Err(TranslationError::unsupported(format!("All({predicate})"))
                    .with_detail("All after Distinct, GroupBy or paging")
                    .into());
            }
            let p = self.server(predicate)?;
            select.apply_predicate(negate(p));
        }
        if select.requires_push_down() {
            if select.projection.is_empty() {
                select.add_projection(SqlExpr::Constant(Value::Int(1)));
            }
            select = select.push_down(&self.aliases.next("t"));
        }
        select.projection = vec![ProjectionColumn {
            expr: SqlExpr::Constant(Value::Int(1)),
            alias: None,
        }];
        Ok(SqlExpr::Exists {
            subquery: Box::new(select),
            negated: kind == TerminalKind::All,
        })
    }

    // ========================================================================
    // Server expressions
    // ========================================================================

    /// Lower for a clause where client evaluation is impossible.
    fn server_or_fail(&mut self, expr: &Expr) -> Lowering<SqlExpr> {
        match self.server(expr) {
            Err(LowerError::Client(construct)) => {
                self.failures.push(Failure {
                    construct,
                    expression: expr.to_string(),
                });
                Ok(SqlExpr::Constant(Value::Null))
            }
            other => other,
        }
    }

    fn server(&mut self, expr: &Expr) -> Lowering<SqlExpr> {
        match expr {
            Expr::Constant(v) => Ok(SqlExpr::Constant(v.clone())),
            Expr::Captured { name, value } => Ok(SqlExpr::Parameter {
                name: name.clone(),
                value: value.clone(),
            }),
            Expr::Member { target, member } => self.member(target, member),
            Expr::Property { target, property } => match target.as_ref() {
                Expr::Source(source) => {
                    let p = self.model.find_property(source.entity_type, property).ok_or_else(|| {
                        TranslationError::unsupported(expr.to_string()).with_detail(format!(
                            "'{}' has no property '{property}'",
                            self.model.entity_type_name(source.entity_type)
                        ))
                    })?;
                    self.column(&source.alias, p)
                }
                _ => Err(LowerError::Client(expr.to_string())),
            },
            Expr::Binary { op, left, right } => self.binary(*op, left, right),
            Expr::Unary { op: UnaryOp::Not, operand } => Ok(negate(self.server(operand)?)),
            Expr::Unary {
                op: UnaryOp::Negate,
                operand,
            } => Ok(SqlExpr::Unary {
                op: SqlUnaryOp::Negate,
                operand: Box::new(self.server(operand)?),
            }),
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => Ok(SqlExpr::Case {
                whens: vec![(self.server(test)?, self.server(if_true)?)],
                else_result: Some(Box::new(self.server(if_false)?)),
            }),
            Expr::Coalesce { left, right } => {
                let left = self.server(left)?;
                let right = self.server(right)?;
                let sql_type = left.sql_type().or_else(|| right.sql_type());
                Ok(SqlExpr::function("COALESCE", vec![left, right], sql_type))
            }
            Expr::Call { target, method, args } => {
                if args.iter().any(|a| matches!(a, Expr::Lambda(_))) {
                    return Err(LowerError::Client(method.clone()));
                }
                let target = target.as_deref().map(|t| self.server(t)).transpose()?;
                let args = args.iter().map(|a| self.server(a)).collect::<Lowering<Vec<_>>>()?;
                methods::translate_call(target, method, args).ok_or_else(|| LowerError::Client(method.clone()))
            }
            Expr::Correlated(q) if q.terminal.is_some() => self.subquery(q),
            Expr::Aggregate { function, argument } => self.group_aggregate(*function, argument.as_deref()),
            Expr::Parameter(name) => Err(TranslationError::unsupported(name.clone())
                .with_detail(format!("parameter '{name}' is not bound to a source"))
                .into()),
            Expr::Source(_)
            | Expr::New(_)
            | Expr::Group(_)
            | Expr::Lambda(_)
            | Expr::Subquery(_)
            | Expr::Correlated(_) => Err(LowerError::Client(expr.to_string())),
        }
    }

    fn member(&mut self, target: &Expr, member: &str) -> Lowering<SqlExpr> {
        match target {
            Expr::Source(source) => match self.model.find_property(source.entity_type, member) {
                Some(p) => self.column(&source.alias, p),
                None => Err(LowerError::Client(format!(
                    "{}.{member}",
                    self.model.entity_type_name(source.entity_type)
                ))),
            },
            // `coll.First().Member` projects the member inside the subquery.
            Expr::Correlated(q)
                if q.terminal.as_ref().is_some_and(|t| {
                    matches!(
                        t.kind,
                        TerminalKind::First | TerminalKind::FirstOrDefault | TerminalKind::Single | TerminalKind::SingleOrDefault
                    )
                }) =>
            {
                let mut q = (**q).clone();
                q.selector = q.selector.member(member);
                self.subquery(&q)
            }
            other => {
                let target = self.server(other)?;
                methods::translate_member(target, member).ok_or_else(|| LowerError::Client(member.to_string()))
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Lowering<SqlExpr> {
        if matches!(op, BinaryOp::Equal | BinaryOp::NotEqual)
            && (matches!(left, Expr::Source(_)) || matches!(right, Expr::Source(_)))
        {
            return self.entity_equality(op, left, right);
        }
        let l = self.server(left)?;
        let r = self.server(right)?;
        let sql_op = match op {
            BinaryOp::Equal | BinaryOp::NotEqual => return Ok(null_semantics(op == BinaryOp::Equal, l, r)),
            BinaryOp::AndAlso => SqlBinaryOp::And,
            BinaryOp::OrElse => SqlBinaryOp::Or,
            BinaryOp::LessThan => SqlBinaryOp::LessThan,
            BinaryOp::LessThanOrEqual => SqlBinaryOp::LessThanOrEqual,
            BinaryOp::GreaterThan => SqlBinaryOp::GreaterThan,
            BinaryOp::GreaterThanOrEqual => SqlBinaryOp::GreaterThanOrEqual,
            BinaryOp::Add if is_text(&l) || is_text(&r) => {
                let mut parts = Vec::new();
                for side in [l, r] {
                    match side {
                        SqlExpr::Concat(inner) => parts.extend(inner),
                        other => parts.push(other),
                    }
                }
                return Ok(SqlExpr::Concat(parts));
            }
            BinaryOp::Add => SqlBinaryOp::Add,
            BinaryOp::Subtract => SqlBinaryOp::Subtract,
            BinaryOp::Multiply => SqlBinaryOp::Multiply,
            BinaryOp::Divide => SqlBinaryOp::Divide,
            BinaryOp::Modulo => SqlBinaryOp::Modulo,
        };
        Ok(SqlExpr::binary(sql_op, l, r))
    }

    /// Entities compare by key; an entity equals null when its key is null.
    fn entity_equality(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Lowering<SqlExpr> {
        let equal = op == BinaryOp::Equal;
        let construct = Expr::binary(op, left.clone(), right.clone()).to_string();
        let condition = match (left, right) {
            (Expr::Source(s), other) | (other, Expr::Source(s)) if other.literal_value().is_some_and(Value::is_null) => {
                let first = self
                    .key_columns(s)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| TranslationError::unsupported(construct.clone()).with_detail("entity type has no key"))?;
                return Ok(if equal { first.is_null() } else { first.is_not_null() });
            }
            (Expr::Source(a), Expr::Source(b)) if self.model.root(a.entity_type) == self.model.root(b.entity_type) => {
                let pairs = self.key_columns(a)?.into_iter().zip(self.key_columns(b)?);
                SqlExpr::conjunction(pairs.map(|(x, y)| x.equal(y)))
            }
            _ => None,
        };
        let condition = condition.ok_or(LowerError::Client(construct))?;
        Ok(if equal { condition } else { negate(condition) })
    }

    fn group_aggregate(&mut self, function: AggregateFunction, argument: Option<&Expr>) -> Lowering<SqlExpr> {
        let argument = match argument {
            None => None,
            Some(a) => match self.server(a) {
                Ok(e) => Some(Box::new(e)),
                Err(LowerError::Client(_)) => {
                    return Err(TranslationError::aggregate_over_client_evaluation(function.name())
                        .with_expression(a.to_string())
                        .into());
                }
                Err(fatal) => return Err(fatal),
            },
        };
        Ok(SqlExpr::Aggregate {
            function,
            argument,
            distinct: false,
        })
    }

    /// A subquery closed by a terminal operator.
    fn subquery(&mut self, q: &ExpandedQuery) -> Lowering<SqlExpr> {
        let Some(kind) = q.terminal.as_ref().map(|t| t.kind) else {
            return Err(LowerError::Client(q.selector.to_string()));
        };
        if !q.set_operations.is_empty() {
            return Err(TranslationError::unsupported(format!("{}(...)", kind.name()))
                .with_detail("set operations in a subquery")
                .into());
        }
        let mut select = self.clauses(q, true)?;
        match kind {
            TerminalKind::Any | TerminalKind::All => self.exists(q, select, kind),
            TerminalKind::Count => {
                if select.requires_push_down() && !select.group_by.is_empty() {
                    for key in select.group_by.clone() {
                        select.add_projection(key);
                    }
                } else if select.distinct {
                    let e = self.server(&q.selector)?;
                    select.add_projection(e);
                }
                Ok(SqlExpr::Scalar(Box::new(self.aggregate(select, kind, None))))
            }
            TerminalKind::Sum | TerminalKind::Average | TerminalKind::Min | TerminalKind::Max => {
                let value = match self.server(&q.selector) {
                    Ok(v) => v,
                    Err(LowerError::Client(_)) => {
                        return Err(TranslationError::aggregate_over_client_evaluation(kind.name())
                            .with_expression(q.selector.to_string())
                            .into());
                    }
                    Err(fatal) => return Err(fatal),
                };
                let index = select.add_projection(value);
                Ok(SqlExpr::Scalar(Box::new(self.aggregate(select, kind, Some(index)))))
            }
            TerminalKind::First | TerminalKind::FirstOrDefault | TerminalKind::Single | TerminalKind::SingleOrDefault => {
                let value = self.server(&q.selector)?;
                select.projection.clear();
                select.add_projection(value);
                Ok(SqlExpr::Scalar(Box::new(self.limit_to(select, 1))))
            }
        }
    }

    // ========================================================================
    // Projection
    // ========================================================================

    fn project_with_set_operations(&mut self, q: &ExpandedQuery, select: &mut SelectExpression) -> Result<ResultShape, TranslationError> {
        let shape = Shape::bind(&q.selector)?;
        let result = self.project(&shape, select, None)?;
        for (kind, other) in &q.set_operations {
            let mut other_select = self.lower_clauses(other, false)?;
            let other_shape = Shape::bind(&other.selector)?;
            self.project(&other_shape, &mut other_select, None)?;
            if other_select.projection.len() != select.projection.len() {
                return Err(TranslationError::unsupported(kind.keyword()).with_detail("set operation operands project different columns"));
            }
            select.set_operations.push((*kind, other_select));
        }
        Ok(result)
    }

    fn project(&mut self, shape: &Shape, select: &mut SelectExpression, parent: Option<usize>) -> Result<ResultShape, TranslationError> {
        match shape {
            Shape::Entity(source) => self.project_entity(source, select).map_err(fatal),
            Shape::Object(fields) => fields
                .iter()
                .map(|(name, s)| self.project(s, select, parent).map(|r| (name.clone(), r)))
                .collect::<Result<Vec<_>, _>>()
                .map(ResultShape::Object),
            Shape::Scalar(e) => self.project_scalar(e, select),
            Shape::Collection(q) => self.split(q, select, parent).map(ResultShape::Collection),
        }
    }

    fn project_entity(&mut self, source: &SourceRef, select: &mut SelectExpression) -> Lowering<ResultShape> {
        let binding = self.binding(&source.alias)?.clone();
        let et = source.entity_type;
        let mut property_ids = self.model.properties(et);
        for derived in self.model.self_and_descendants(et).into_iter().skip(1) {
            if let Some(t) = self.model.entity_type(derived) {
                property_ids.extend(t.declared_properties().iter().copied());
            }
        }
        let mut properties = Vec::with_capacity(property_ids.len());
        for p in property_ids {
            let index = select.add_projection(self.column(&source.alias, p)?);
            properties.push((p, index));
        }
        let key = self
            .model
            .primary_key_properties(et)
            .into_iter()
            .filter_map(|k| properties.iter().find(|(p, _)| *p == k).map(|(_, i)| *i))
            .collect();

        let root = self.model.root(et);
        let first_key = self.model.primary_key_properties(root).into_iter().next();
        let mut tables = Vec::new();
        if let Some(first_key) = first_key {
            let (column, sql_type) = self.column_meta(first_key);
            for (t, alias) in &binding.tables {
                if *t != et && !self.model.is_assignable_from(*t, et) {
                    let index = select.add_projection(SqlExpr::column(alias.clone(), column.clone(), sql_type, true));
                    tables.push((*t, index));
                }
            }
        }
        Ok(ResultShape::Entity(EntityShape {
            entity_type: et,
            properties,
            key,
            concrete: ConcreteType::Fixed,
            nullable: binding.nullable,
            tables,
        }))
    }

    fn project_scalar(&mut self, expr: &Expr, select: &mut SelectExpression) -> Result<ResultShape, TranslationError> {
        match self.server(expr) {
            Ok(sql) => {
                let property = match expr {
                    Expr::Member { target, member: name } | Expr::Property { target, property: name } => match target.as_ref() {
                        Expr::Source(s) => self.model.find_property(s.entity_type, name),
                        _ => None,
                    },
                    _ => None,
                };
                Ok(ResultShape::Scalar {
                    index: select.add_projection(sql),
                    property,
                    discriminator_of: None,
                })
            }
            Err(LowerError::Fatal(e)) => Err(e),
            Err(LowerError::Client(_)) => self.client(expr, select).map(ResultShape::Client),
        }
    }

    /// Client expression for `expr`, pushing every translatable piece to the
    /// server as a projected column.
    fn client(&mut self, expr: &Expr, select: &mut SelectExpression) -> Result<ClientExpr, TranslationError> {
        match self.server(expr) {
            Ok(sql) => return Ok(ClientExpr::Column(select.add_projection(sql))),
            Err(LowerError::Fatal(e)) => return Err(e),
            Err(LowerError::Client(_)) => {}
        }
        Ok(match expr {
            Expr::Constant(v) | Expr::Captured { value: v, .. } => ClientExpr::Constant(v.clone()),
            Expr::Binary { op, left, right } => ClientExpr::Binary {
                op: *op,
                left: self.client_boxed(left, select)?,
                right: self.client_boxed(right, select)?,
            },
            Expr::Unary { op, operand } => ClientExpr::Unary {
                op: *op,
                operand: self.client_boxed(operand, select)?,
            },
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => ClientExpr::Conditional {
                test: self.client_boxed(test, select)?,
                if_true: self.client_boxed(if_true, select)?,
                if_false: self.client_boxed(if_false, select)?,
            },
            Expr::Coalesce { left, right } => ClientExpr::Coalesce {
                left: self.client_boxed(left, select)?,
                right: self.client_boxed(right, select)?,
            },
            Expr::Call { target, method, args } if !args.iter().any(|a| matches!(a, Expr::Lambda(_))) => {
                let operands: Vec<&Expr> = target.as_deref().into_iter().chain(args).collect();
                self.client_call(method, &operands, expr, select)?
            }
            Expr::Member { target, member } => match target.as_ref() {
                Expr::Source(source) => {
                    let key = format!("{}.{member}", self.model.entity_type_name(source.entity_type));
                    self.mark_client(&key, expr);
                    let mut args = Vec::new();
                    for p in self.model.properties(source.entity_type) {
                        let column = self.column(&source.alias, p).map_err(fatal)?;
                        args.push(ClientExpr::Column(select.add_projection(column)));
                    }
                    ClientExpr::Call { function: key, args }
                }
                other => self.client_call(member, &[other], expr, select)?,
            },
            other => {
                let construct = match other {
                    Expr::Call { method, .. } => method.clone(),
                    _ => other.to_string(),
                };
                self.failures.push(Failure {
                    construct,
                    expression: other.to_string(),
                });
                ClientExpr::Constant(Value::Null)
            }
        })
    }

    fn client_boxed(&mut self, expr: &Expr, select: &mut SelectExpression) -> Result<Box<ClientExpr>, TranslationError> {
        self.client(expr, select).map(Box::new)
    }

    fn client_call(&mut self, key: &str, operands: &[&Expr], expr: &Expr, select: &mut SelectExpression) -> Result<ClientExpr, TranslationError> {
        self.mark_client(key, expr);
        let args = operands
            .iter()
            .map(|e| self.client(e, select))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ClientExpr::Call {
            function: key.to_string(),
            args,
        })
    }

    fn mark_client(&mut self, key: &str, expr: &Expr) {
        self.client_constructs.push(key.to_string());
        if !self.functions.contains(key) {
            self.failures.push(Failure {
                construct: key.to_string(),
                expression: expr.to_string(),
            });
        }
    }

    // ========================================================================
    // Split queries
    // ========================================================================

    /// Lower a correlated collection into a split query and return its index.
    fn split(&mut self, q: &ExpandedQuery, parent_select: &mut SelectExpression, parent: Option<usize>) -> Result<usize, TranslationError> {
        let construct = q.selector.to_string();
        let Some(correlation) = q.correlation.clone() else {
            return Err(TranslationError::unsupported(construct).with_detail("a collection in a projection must be correlated to the outer row"));
        };
        if !q.set_operations.is_empty() {
            return Err(TranslationError::unsupported(construct).with_detail("set operations in a collection projection"));
        }
        let (principal_key, dependent) = self.foreign_key_columns(correlation.foreign_key).map_err(|e| Self::settle(e, q))?;
        let mut parent_keys = Vec::with_capacity(principal_key.len());
        for p in &principal_key {
            let column = self.column(&correlation.parent.alias, *p).map_err(|e| Self::settle(e, q))?;
            parent_keys.push(parent_select.add_projection(column));
        }

        let index = self.splits.len();
        self.splits.push(None);
        let mut select = self.lower_clauses(q, false)?;
        let offset = take_count(select.offset.take(), "Skip")?;
        let limit = take_count(select.limit.take(), "Take")?;
        let shape = Shape::bind(&q.selector)?;
        let element = self.project(&shape, &mut select, Some(index))?;

        if q.distinct || q.grouping.is_some() {
            let mut required = Vec::new();
            for source in q.sources() {
                required.extend(self.key_columns(source).map_err(|e| Self::settle(e, q))?);
            }
            let available = if q.grouping.is_some() {
                select.group_by.clone()
            } else {
                select.projection.iter().map(|c| c.expr.clone()).collect()
            };
            self.identifying.push(IdentifyingCheck { required, available });
        }

        let mut correlation_columns = Vec::with_capacity(dependent.len());
        let mut correlation_positions = Vec::with_capacity(dependent.len());
        for p in dependent {
            let column = self.column(&q.root.alias, p).map_err(|e| Self::settle(e, q))?;
            if q.grouping.is_some() && !select.group_by.contains(&column) {
                select.group_by.push(column.clone());
            }
            correlation_positions.push(select.add_projection(column.clone()));
            correlation_columns.push(column);
        }
        if let Some(alias) = outer_reference(&select) {
            return Err(TranslationError::unsupported(construct)
                .with_detail(format!("the collection references outer source '{alias}' outside its correlation")));
        }
        tracing::debug!(
            target: "relmap::query",
            split = index,
            parent = ?parent,
            root = %q.root.alias,
            "collection projected as split query"
        );
        self.splits[index] = Some(SplitQuery {
            select,
            shape: element,
            parent,
            parent_keys,
            correlation: correlation_positions,
            correlation_columns,
            offset,
            limit,
        });
        Ok(index)
    }
}

fn fatal(e: LowerError) -> TranslationError {
    match e {
        LowerError::Fatal(e) => e,
        LowerError::Client(construct) => TranslationError::unsupported(construct),
    }
}

fn scalar(index: usize) -> ResultShape {
    ResultShape::Scalar {
        index,
        property: None,
        discriminator_of: None,
    }
}

fn is_text(e: &SqlExpr) -> bool {
    e.sql_type().is_some_and(|t| t.is_text())
}

/// Logical negation, folding into IS NULL, EXISTS and IN where possible.
pub(crate) fn negate(e: SqlExpr) -> SqlExpr {
    match e {
        SqlExpr::IsNull { operand, negated } => SqlExpr::IsNull {
            operand,
            negated: !negated,
        },
        SqlExpr::Exists { subquery, negated } => SqlExpr::Exists {
            subquery,
            negated: !negated,
        },
        SqlExpr::In {
            operand,
            values,
            negated,
        } => SqlExpr::In {
            operand,
            values,
            negated: !negated,
        },
        SqlExpr::Unary {
            op: SqlUnaryOp::Not,
            operand,
        } => *operand,
        other => other.not(),
    }
}

/// Equality with two-valued logic over nullable operands.
///
/// Comparing with a null literal becomes `IS [NOT] NULL`. When both sides may
/// be null, null equals null; `<>` treats null as different from any value.
fn null_semantics(equal: bool, l: SqlExpr, r: SqlExpr) -> SqlExpr {
    match (l.is_null_literal(), r.is_null_literal()) {
        (true, true) => return SqlExpr::Constant(Value::Bool(equal)),
        (false, true) => return if equal { l.is_null() } else { l.is_not_null() },
        (true, false) => return if equal { r.is_null() } else { r.is_not_null() },
        (false, false) => {}
    }
    let (ln, rn) = (l.is_nullable(), r.is_nullable());
    if equal {
        let eq = l.clone().equal(r.clone());
        return if ln && rn { eq.or(l.is_null().and(r.is_null())) } else { eq };
    }
    let ne = SqlExpr::binary(SqlBinaryOp::NotEqual, l.clone(), r.clone());
    match (ln, rn) {
        (false, false) => ne,
        (true, false) => ne.or(l.is_null()),
        (false, true) => ne.or(r.is_null()),
        (true, true) => ne
            .or(l.clone().is_null())
            .or(r.clone().is_null())
            .and(l.is_not_null().or(r.is_not_null())),
    }
}

/// A literal row count for per-parent paging.
fn take_count(e: Option<SqlExpr>, operator: &str) -> Result<Option<usize>, TranslationError> {
    let Some(e) = e else {
        return Ok(None);
    };
    let value = match &e {
        SqlExpr::Parameter { value, .. } => Some(value),
        other => other.literal_value(),
    };
    value
        .and_then(Value::as_i64)
        .and_then(|n| usize::try_from(n).ok())
        .map(Some)
        .ok_or_else(|| TranslationError::unsupported(operator).with_detail("paging in a collection projection needs a constant count"))
}

/// First column alias used in `select` (or nested selects) that none of
/// them define.
fn outer_reference(select: &SelectExpression) -> Option<String> {
    let mut select = select.clone();
    let mut defined = BTreeSet::new();
    let mut used = Vec::new();
    select.for_each_select_mut(&mut |s| {
        defined.extend(s.tables().map(|t| t.alias.clone()));
        for e in s.expressions_mut() {
            e.walk(&mut |node| {
                if let SqlExpr::Column { table, .. } = node {
                    used.push(table.clone());
                }
            });
        }
    });
    used.into_iter().find(|t| !defined.contains(t))
}
