//! Navigation expansion.
//!
//! Binds lambda parameters to table sources and walks the operator chain
//! into an [`ExpandedQuery`]. Reference navigations become joins and
//! collection navigations become correlated subqueries. A navigation reached
//! twice from the same source reuses the first join, so `g.Squad.Name` and
//! `g.Squad.Id` in one query share a single join to the squad table.

use crate::expr::{AggregateFunction, Expr, Lambda};
use crate::query::{Operator, Query, QuerySource, SetOperationKind, TerminalKind};
use crate::sql::JoinKind;
use crate::visitor::{ParameterReplacer, map_children};
use relmap_core::TranslationError;
use relmap_metadata::{EntityTypeId, ForeignKeyId, Model, NavigationId};
use std::collections::BTreeMap;

type Result<T> = std::result::Result<T, TranslationError>;

// ============================================================================
// Expanded tree
// ============================================================================

/// A table source: one row variable of the query, bound to an alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub alias: String,
    /// Static type of the rows; may be narrowed by `OfType`.
    pub entity_type: EntityTypeId,
}

/// The element of a grouped query.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRef {
    pub key: Expr,
    pub element: Expr,
}

/// A join introduced by expansion.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpandedJoin {
    /// Join through a navigation of `source`.
    Navigation {
        source: SourceRef,
        navigation: NavigationId,
        foreign_key: ForeignKeyId,
        /// The navigation goes from the dependent to the principal.
        to_principal: bool,
        target: SourceRef,
        kind: JoinKind,
    },
    /// An explicit `Join` operator.
    Explicit { target: SourceRef, on: Expr },
}

impl ExpandedJoin {
    pub fn target(&self) -> &SourceRef {
        match self {
            ExpandedJoin::Navigation { target, .. } | ExpandedJoin::Explicit { target, .. } => target,
        }
    }

    pub fn target_mut(&mut self) -> &mut SourceRef {
        match self {
            ExpandedJoin::Navigation { target, .. } | ExpandedJoin::Explicit { target, .. } => target,
        }
    }

    pub fn kind(&self) -> JoinKind {
        match self {
            ExpandedJoin::Navigation { kind, .. } => *kind,
            ExpandedJoin::Explicit { .. } => JoinKind::Inner,
        }
    }
}

/// Ties a collection subquery to the outer row it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    /// Outer source owning the collection.
    pub parent: SourceRef,
    pub navigation: NavigationId,
    /// Foreign key whose principal is the parent and whose dependent is the
    /// subquery root.
    pub foreign_key: ForeignKeyId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ordering {
    pub key: Expr,
    pub descending: bool,
}

/// Terminal operator after expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedTerminal {
    pub kind: TerminalKind,
    /// Predicate of `All`; other terminal predicates become filters.
    pub predicate: Option<Expr>,
}

/// A query after navigation expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedQuery {
    pub root: SourceRef,
    pub correlation: Option<Correlation>,
    pub joins: Vec<ExpandedJoin>,
    pub predicates: Vec<Expr>,
    pub grouping: Option<Expr>,
    pub having: Vec<Expr>,
    /// The element each result row is built from.
    pub selector: Expr,
    pub orderings: Vec<Ordering>,
    pub distinct: bool,
    pub offset: Option<Expr>,
    pub limit: Option<Expr>,
    pub set_operations: Vec<(SetOperationKind, ExpandedQuery)>,
    pub terminal: Option<ExpandedTerminal>,
}

impl ExpandedQuery {
    fn new(root: SourceRef) -> Self {
        Self {
            selector: Expr::Source(root.clone()),
            root,
            correlation: None,
            joins: Vec::new(),
            predicates: Vec::new(),
            grouping: None,
            having: Vec::new(),
            orderings: Vec::new(),
            distinct: false,
            offset: None,
            limit: None,
            set_operations: Vec::new(),
            terminal: None,
        }
    }

    /// Root and join targets, in join order.
    pub fn sources(&self) -> Vec<&SourceRef> {
        std::iter::once(&self.root)
            .chain(self.joins.iter().map(ExpandedJoin::target))
            .collect()
    }

    /// Whether rows of `alias` may be absent (reached through a LEFT join).
    pub fn is_nullable_source(&self, alias: &str) -> bool {
        self.joins
            .iter()
            .any(|j| j.target().alias == alias && j.kind() == JoinKind::LeftOuter)
    }

    fn terminal_kind(&self) -> Option<TerminalKind> {
        self.terminal.as_ref().map(|t| t.kind)
    }
}

// ============================================================================
// Aliases
// ============================================================================

/// Hands out table aliases unique across one compiled query: the first
/// letter of the table, then `g0`, `g1`, ... on reuse.
#[derive(Debug, Clone, Default)]
pub struct AliasGenerator {
    counts: BTreeMap<String, usize>,
}

impl AliasGenerator {
    pub fn next(&mut self, table: &str) -> String {
        let base = table
            .chars()
            .next()
            .filter(char::is_ascii_alphabetic)
            .map_or_else(|| "t".to_string(), |c| c.to_ascii_lowercase().to_string());
        let count = self.counts.entry(base.clone()).or_insert(0);
        let alias = if *count == 0 {
            base
        } else {
            format!("{base}{}", *count - 1)
        };
        *count += 1;
        alias
    }
}

// ============================================================================
// Expander
// ============================================================================

/// What an operator may not follow.
#[derive(Debug, Clone, Copy, Default)]
struct Barriers {
    grouped: bool,
    distinct: bool,
    limited: Option<&'static str>,
    set_operation: Option<&'static str>,
}

impl Barriers {
    fn check(&self, op: &str, forbid_distinct: bool, forbid_group: bool) -> Result<()> {
        let blocker = self
            .set_operation
            .or(self.limited)
            .or(if forbid_distinct && self.distinct { Some("Distinct") } else { None })
            .or(if forbid_group && self.grouped { Some("GroupBy") } else { None });
        match blocker {
            Some(b) => Err(TranslationError::unsupported(format!("{op} after {b}"))),
            None => Ok(()),
        }
    }
}

pub(crate) struct NavigationExpander<'m> {
    model: &'m Model,
    aliases: AliasGenerator,
}

impl<'m> NavigationExpander<'m> {
    pub(crate) fn new(model: &'m Model) -> Self {
        Self {
            model,
            aliases: AliasGenerator::default(),
        }
    }

    pub(crate) fn into_aliases(self) -> AliasGenerator {
        self.aliases
    }

    fn new_source(&mut self, entity_type: EntityTypeId) -> SourceRef {
        let root = self.model.root(entity_type);
        SourceRef {
            alias: self.aliases.next(&self.model.table_name(root)),
            entity_type,
        }
    }

    /// Expand a top-level query.
    pub(crate) fn expand(&mut self, query: Query) -> Result<ExpandedQuery> {
        self.expand_query(query, None)
    }

    fn expand_query(&mut self, query: Query, outer: Option<&mut ExpandedQuery>) -> Result<ExpandedQuery> {
        let mut q = match query.source {
            QuerySource::Set(name) => {
                let et = self
                    .model
                    .find_entity_type(&name)
                    .ok_or_else(|| TranslationError::unsupported(format!("Set<{name}>")).with_detail(format!("entity type '{name}' is not mapped")))?
                    .id();
                ExpandedQuery::new(self.new_source(et))
            }
            QuerySource::Navigation(collection) => {
                let Some(outer) = outer else {
                    return Err(TranslationError::unsupported(collection.to_string())
                        .with_detail("a query over a navigation must be nested in an outer query"));
                };
                self.collection_source(*collection, outer)?
            }
        };

        let mut barriers = Barriers::default();
        for op in query.operators {
            self.apply_operator(&mut q, &mut barriers, op)?;
        }

        if let Some(terminal) = query.terminal {
            let kind = terminal.kind;
            match (kind, terminal.lambda) {
                (TerminalKind::All, Some(lambda)) => {
                    barriers.check(kind.name(), false, false)?;
                    let body = ParameterReplacer::apply(&lambda, &[q.selector.clone()]);
                    let predicate = self.expand_expr(body, &mut q)?;
                    q.terminal = Some(ExpandedTerminal {
                        kind,
                        predicate: Some(predicate),
                    });
                }
                (_, Some(lambda)) if kind.takes_predicate() => {
                    self.apply_filter(&mut q, &barriers, kind.name(), &lambda)?;
                    q.terminal = Some(ExpandedTerminal { kind, predicate: None });
                }
                (_, Some(lambda)) => {
                    let body = ParameterReplacer::apply(&lambda, &[q.selector.clone()]);
                    q.selector = self.expand_expr(body, &mut q)?;
                    q.terminal = Some(ExpandedTerminal { kind, predicate: None });
                }
                (_, None) => q.terminal = Some(ExpandedTerminal { kind, predicate: None }),
            }
        }
        Ok(q)
    }

    fn apply_filter(&mut self, q: &mut ExpandedQuery, barriers: &Barriers, op: &str, lambda: &Lambda) -> Result<()> {
        barriers.check(op, true, false)?;
        let body = ParameterReplacer::apply(lambda, &[q.selector.clone()]);
        let predicate = self.expand_expr(body, q)?;
        if q.grouping.is_some() {
            q.having.push(predicate);
        } else {
            q.predicates.push(predicate);
        }
        Ok(())
    }

    fn apply_operator(&mut self, q: &mut ExpandedQuery, barriers: &mut Barriers, op: Operator) -> Result<()> {
        let name = op.name();
        match op {
            Operator::Filter(lambda) => self.apply_filter(q, barriers, name, &lambda)?,
            Operator::Select(lambda) => {
                if let Some(b) = barriers.set_operation.or(if barriers.distinct { Some("Distinct") } else { None }) {
                    return Err(TranslationError::unsupported(format!("{name} after {b}")));
                }
                let body = ParameterReplacer::apply(&lambda, &[q.selector.clone()]);
                q.selector = self.expand_expr(body, q)?;
            }
            Operator::SelectMany(lambda) => {
                barriers.check(name, true, true)?;
                let body = ParameterReplacer::apply(&lambda, &[q.selector.clone()]);
                q.selector = self.expand_select_many(body, q)?;
            }
            Operator::OrderBy { key, descending, then } => {
                barriers.check(name, false, false)?;
                let body = ParameterReplacer::apply(&key, &[q.selector.clone()]);
                let key = self.expand_expr(body, q)?;
                if !then {
                    q.orderings.clear();
                }
                q.orderings.push(Ordering { key, descending });
            }
            Operator::GroupBy(lambda) => {
                barriers.check(name, true, true)?;
                let body = ParameterReplacer::apply(&lambda, &[q.selector.clone()]);
                let key = self.expand_expr(body, q)?;
                q.grouping = Some(key.clone());
                let element = std::mem::replace(&mut q.selector, Expr::null());
                q.selector = Expr::Group(Box::new(GroupRef { key, element }));
                barriers.grouped = true;
            }
            Operator::Distinct => {
                barriers.check(name, false, false)?;
                q.distinct = true;
                barriers.distinct = true;
            }
            Operator::Skip(count) => {
                if barriers.limited == Some("Take") {
                    return Err(TranslationError::unsupported("Skip after Take"));
                }
                barriers.check(name, false, false)?;
                q.offset = Some(self.expand_expr(count, q)?);
            }
            Operator::Take(count) => {
                if q.limit.is_some() {
                    return Err(TranslationError::unsupported("Take after Take"));
                }
                if let Some(b) = barriers.set_operation {
                    return Err(TranslationError::unsupported(format!("Take after {b}")));
                }
                q.limit = Some(self.expand_expr(count, q)?);
                barriers.limited = Some("Take");
                return Ok(());
            }
            Operator::Join {
                inner,
                outer_key,
                inner_key,
                result,
            } => {
                barriers.check(name, true, true)?;
                self.expand_join(q, *inner, &outer_key, &inner_key, &result)?;
            }
            Operator::OfType(type_name) => {
                barriers.check(name, false, true)?;
                self.narrow(q, &type_name)?;
            }
            Operator::SetOperation { kind, other } => {
                if let Some(b) = barriers.set_operation.or(barriers.limited) {
                    return Err(TranslationError::unsupported(format!("{name} after {b}")));
                }
                let other = self.expand_query(*other, None)?;
                q.set_operations.push((kind, other));
                barriers.set_operation = Some(name);
                return Ok(());
            }
        }
        if matches!(name, "Skip") {
            barriers.limited = barriers.limited.or(Some("Skip"));
        }
        Ok(())
    }

    /// `SelectMany(x => x.Collection)`: an inner join to the collection.
    fn expand_select_many(&mut self, body: Expr, q: &mut ExpandedQuery) -> Result<Expr> {
        let construct = body.to_string();
        let (collection, filters) = match body {
            Expr::Subquery(sub) => {
                let sub = *sub;
                let QuerySource::Navigation(collection) = sub.source else {
                    return Err(TranslationError::unsupported(construct));
                };
                let mut filters = Vec::new();
                for op in sub.operators {
                    match op {
                        Operator::Filter(l) => filters.push(l),
                        other => {
                            return Err(TranslationError::unsupported(format!("SelectMany over {}", other.name())));
                        }
                    }
                }
                if sub.terminal.is_some() {
                    return Err(TranslationError::unsupported(construct));
                }
                (*collection, filters)
            }
            other => (other, Vec::new()),
        };
        let Expr::Member { target, member } = collection else {
            return Err(TranslationError::unsupported(construct));
        };
        let Expr::Source(parent) = self.expand_expr(*target, q)? else {
            return Err(TranslationError::unsupported(construct));
        };
        let (navigation, fk) = self.collection_navigation(&parent, &member).ok_or_else(|| TranslationError::unsupported(construct.clone()))?;
        let target_type = self
            .model
            .navigation(navigation)
            .map(relmap_metadata::Navigation::target_type)
            .ok_or_else(|| TranslationError::unsupported(construct.clone()))?;
        let target = self.new_source(target_type);
        q.joins.push(ExpandedJoin::Navigation {
            source: parent,
            navigation,
            foreign_key: fk,
            to_principal: false,
            target: target.clone(),
            kind: JoinKind::Inner,
        });
        let element = Expr::Source(target);
        for filter in filters {
            let body = ParameterReplacer::apply(&filter, &[element.clone()]);
            let predicate = self.expand_expr(body, q)?;
            q.predicates.push(predicate);
        }
        Ok(element)
    }

    fn expand_join(&mut self, q: &mut ExpandedQuery, inner: Query, outer_key: &Lambda, inner_key: &Lambda, result: &Lambda) -> Result<()> {
        let QuerySource::Set(name) = &inner.source else {
            return Err(TranslationError::unsupported("Join over a navigation"));
        };
        let et = self
            .model
            .find_entity_type(name)
            .ok_or_else(|| TranslationError::unsupported(format!("Set<{name}>")))?
            .id();
        let target = self.new_source(et);
        let element = Expr::Source(target.clone());
        let mut conditions = Vec::new();
        for op in inner.operators {
            match op {
                Operator::Filter(l) => {
                    let body = ParameterReplacer::apply(&l, &[element.clone()]);
                    conditions.push(self.expand_expr(body, q)?);
                }
                other => return Err(TranslationError::unsupported(format!("Join over {}", other.name()))),
            }
        }
        let outer = ParameterReplacer::apply(outer_key, &[q.selector.clone()]);
        let outer = self.expand_expr(outer, q)?;
        let inner = ParameterReplacer::apply(inner_key, &[element.clone()]);
        let inner = self.expand_expr(inner, q)?;
        let key_match = match (outer, inner) {
            (Expr::New(left), Expr::New(right)) if left.len() == right.len() => left
                .into_iter()
                .zip(right)
                .map(|((_, l), (_, r))| l.eq(r))
                .reduce(Expr::and)
                .unwrap_or_else(|| Expr::constant(true)),
            (l, r) => l.eq(r),
        };
        let on = conditions.into_iter().fold(key_match, Expr::and);
        q.joins.push(ExpandedJoin::Explicit { target, on });
        let body = ParameterReplacer::apply(result, &[q.selector.clone(), element]);
        q.selector = self.expand_expr(body, q)?;
        Ok(())
    }

    /// `OfType<T>()` narrows the static type of the current element source.
    fn narrow(&mut self, q: &mut ExpandedQuery, type_name: &str) -> Result<()> {
        let construct = format!("OfType<{type_name}>");
        let Expr::Source(current) = &q.selector else {
            return Err(TranslationError::unsupported(construct).with_detail("OfType applies to entity sequences only"));
        };
        let narrowed = self
            .model
            .find_entity_type(type_name)
            .map(relmap_metadata::EntityType::id)
            .filter(|t| self.model.is_assignable_from(current.entity_type, *t))
            .ok_or_else(|| TranslationError::unsupported(construct))?;
        let alias = current.alias.clone();
        let narrowed_ref = SourceRef {
            alias: alias.clone(),
            entity_type: narrowed,
        };
        if q.root.alias == alias {
            q.root = narrowed_ref.clone();
        }
        for join in &mut q.joins {
            if join.target().alias == alias {
                *join.target_mut() = narrowed_ref.clone();
            }
        }
        q.selector = Expr::Source(narrowed_ref);
        Ok(())
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn collection_navigation(&self, source: &SourceRef, member: &str) -> Option<(NavigationId, ForeignKeyId)> {
        let nav = self.model.navigation(self.model.find_navigation(source.entity_type, member)?)?;
        if !nav.is_collection() {
            return None;
        }
        Some((nav.id(), nav.foreign_key()?))
    }

    /// Root of a subquery over `parent.Collection`, expanding `parent` in
    /// the outer query.
    fn collection_source(&mut self, collection: Expr, outer: &mut ExpandedQuery) -> Result<ExpandedQuery> {
        let construct = collection.to_string();
        let Expr::Member { target, member } = collection else {
            return Err(TranslationError::unsupported(construct));
        };
        let Expr::Source(parent) = self.expand_expr(*target, outer)? else {
            return Err(TranslationError::unsupported(construct));
        };
        let (navigation, foreign_key) = self
            .collection_navigation(&parent, &member)
            .ok_or_else(|| TranslationError::unsupported(construct.clone()).with_detail(format!("'{member}' is not a collection navigation")))?;
        Ok(self.correlated(parent, navigation, foreign_key))
    }

    fn correlated(&mut self, parent: SourceRef, navigation: NavigationId, foreign_key: ForeignKeyId) -> ExpandedQuery {
        let target = self
            .model
            .navigation(navigation)
            .map_or(parent.entity_type, relmap_metadata::Navigation::target_type);
        let mut q = ExpandedQuery::new(self.new_source(target));
        q.correlation = Some(Correlation {
            parent,
            navigation,
            foreign_key,
        });
        q
    }

    /// Join for a reference navigation, reusing an existing one.
    fn reference_join(&mut self, q: &mut ExpandedQuery, source: &SourceRef, navigation: NavigationId) -> Option<SourceRef> {
        let existing = q.joins.iter().find_map(|j| match j {
            ExpandedJoin::Navigation {
                source: s,
                navigation: n,
                target,
                ..
            } if s.alias == source.alias && *n == navigation => Some(target.clone()),
            _ => None,
        });
        if existing.is_some() {
            return existing;
        }
        let nav = self.model.navigation(navigation)?;
        let fk_id = nav.foreign_key()?;
        let fk = self.model.foreign_key(fk_id)?;
        let to_principal = nav.points_to_principal(fk);
        let target_type = nav.target_type();
        let kind = if to_principal && self.model.is_required(fk_id) && !q.is_nullable_source(&source.alias) {
            JoinKind::Inner
        } else {
            JoinKind::LeftOuter
        };
        let target = self.new_source(target_type);
        tracing::debug!(
            target: "relmap::query",
            source = %source.alias,
            navigation = %nav.name(),
            alias = %target.alias,
            ?kind,
            "expanded navigation"
        );
        q.joins.push(ExpandedJoin::Navigation {
            source: source.clone(),
            navigation,
            foreign_key: fk_id,
            to_principal,
            target: target.clone(),
            kind,
        });
        Some(target)
    }

    pub(crate) fn expand_expr(&mut self, expr: Expr, q: &mut ExpandedQuery) -> Result<Expr> {
        match expr {
            Expr::Member { target, member } => {
                let target = self.expand_expr(*target, q)?;
                self.expand_member(target, member, q)
            }
            Expr::Call { target: Some(target), method, args } => {
                let target = self.expand_expr(*target, q)?;
                self.expand_method(target, method, args, q)
            }
            Expr::Subquery(sub) => {
                let expanded = self.expand_query(*sub, Some(q))?;
                Ok(Expr::Correlated(Box::new(expanded)))
            }
            other => map_children(other, |c| self.expand_expr(c, q)),
        }
    }

    fn expand_member(&mut self, target: Expr, member: String, q: &mut ExpandedQuery) -> Result<Expr> {
        match target {
            Expr::Source(source) => {
                let Some(nav_id) = self.model.find_navigation(source.entity_type, &member) else {
                    return Ok(Expr::Source(source).member(member));
                };
                let is_collection = self.model.navigation(nav_id).is_some_and(relmap_metadata::Navigation::is_collection);
                if is_collection {
                    let (navigation, fk) = self
                        .collection_navigation(&source, &member)
                        .ok_or_else(|| TranslationError::unsupported(format!("{}.{member}", source.alias)))?;
                    return Ok(Expr::Correlated(Box::new(self.correlated(source, navigation, fk))));
                }
                match self.reference_join(q, &source, nav_id) {
                    Some(joined) => Ok(Expr::Source(joined)),
                    None => Err(TranslationError::unsupported(format!("{}.{member}", source.alias))
                        .with_detail(format!("navigation '{member}' has no foreign key"))),
                }
            }
            Expr::New(fields) => {
                let construct = format!("{}.{member}", Expr::New(fields.clone()));
                fields
                    .into_iter()
                    .find(|(name, _)| *name == member)
                    .map(|(_, e)| e)
                    .ok_or_else(|| TranslationError::unsupported(construct))
            }
            Expr::Group(group) if member == "Key" => Ok(group.key),
            other => Ok(other.member(member)),
        }
    }

    fn expand_method(&mut self, target: Expr, method: String, args: Vec<Expr>, q: &mut ExpandedQuery) -> Result<Expr> {
        match target {
            Expr::Group(group) => {
                let construct = format!("{}.{method}", Expr::Group(group.clone()));
                let function = AggregateFunction::from_method(&method).ok_or_else(|| TranslationError::unsupported(construct))?;
                let argument = match args.into_iter().next() {
                    Some(Expr::Lambda(lambda)) => {
                        let body = ParameterReplacer::apply(&lambda, &[group.element.clone()]);
                        let body = self.expand_expr(body, q)?;
                        // Count(pred) counts the rows where the predicate holds.
                        Some(Box::new(if function == AggregateFunction::Count {
                            Expr::conditional(body, Expr::constant(1), Expr::null())
                        } else {
                            body
                        }))
                    }
                    Some(other) => Some(Box::new(self.expand_expr(other, q)?)),
                    None if function == AggregateFunction::Count => None,
                    None => Some(Box::new(group.element.clone())),
                };
                Ok(Expr::Aggregate { function, argument })
            }
            Expr::Correlated(mut inner) if inner.terminal.is_none() && terminal_from_method(&method).is_some() => {
                let Some(kind) = terminal_from_method(&method) else {
                    return Err(TranslationError::unsupported(method));
                };
                let lambda = args.into_iter().find_map(|a| match a {
                    Expr::Lambda(l) => Some(*l),
                    _ => None,
                });
                let mut predicate = None;
                if let Some(lambda) = lambda {
                    let body = ParameterReplacer::apply(&lambda, &[inner.selector.clone()]);
                    let body = self.expand_expr(body, &mut inner)?;
                    if kind == TerminalKind::All {
                        predicate = Some(body);
                    } else if kind.takes_predicate() {
                        inner.predicates.push(body);
                    } else {
                        inner.selector = body;
                    }
                }
                inner.terminal = Some(ExpandedTerminal { kind, predicate });
                Ok(Expr::Correlated(inner))
            }
            other => {
                let args = args
                    .into_iter()
                    .map(|a| self.expand_expr(a, q))
                    .collect::<Result<Vec<_>>>()?;
                Ok(other.call(method, args))
            }
        }
    }
}

fn terminal_from_method(method: &str) -> Option<TerminalKind> {
    Some(match method {
        "First" => TerminalKind::First,
        "FirstOrDefault" => TerminalKind::FirstOrDefault,
        "Single" => TerminalKind::Single,
        "SingleOrDefault" => TerminalKind::SingleOrDefault,
        "Count" | "LongCount" => TerminalKind::Count,
        "Any" => TerminalKind::Any,
        "All" => TerminalKind::All,
        "Sum" => TerminalKind::Sum,
        "Average" => TerminalKind::Average,
        "Min" => TerminalKind::Min,
        "Max" => TerminalKind::Max,
        _ => return None,
    })
}

/// Whether `expr` is a correlated subquery without a terminal (a collection).
pub(crate) fn is_collection(expr: &Expr) -> bool {
    matches!(expr, Expr::Correlated(q) if q.terminal_kind().is_none())
}
