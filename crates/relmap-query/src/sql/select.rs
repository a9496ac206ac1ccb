//! Relational select expressions and the command tree.
//!
//! [`SelectExpression`] is the mutable form the lowering stage builds into:
//! tables and joins, a predicate, grouping, a projection and paging.
//! [`SelectExpression::to_command`] freezes it into the tagged
//! [`CommandNode`] tree that renderers consume.

use super::expr::SqlExpr;
use crate::query::SetOperationKind;
use relmap_core::SqlType;
use relmap_metadata::EntityTypeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

impl JoinKind {
    pub const fn keyword(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::LeftOuter => "LEFT JOIN",
        }
    }
}

/// What a FROM item reads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FromItem {
    Table(String),
    /// Derived table.
    Subquery(Box<SelectExpression>),
}

/// A FROM or JOIN item with its alias.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSource {
    pub item: FromItem,
    pub alias: String,
    /// Static entity type when this table is the main table of a query
    /// source. Tables joined in for inherited columns leave it unset.
    pub entity_type: Option<EntityTypeId>,
}

impl TableSource {
    pub fn table(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            item: FromItem::Table(name.into()),
            alias: alias.into(),
            entity_type: None,
        }
    }

    #[must_use]
    pub fn for_entity(mut self, entity_type: EntityTypeId) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    /// Table name, for plain tables.
    pub fn table_name(&self) -> Option<&str> {
        match &self.item {
            FromItem::Table(name) => Some(name),
            FromItem::Subquery(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub table: TableSource,
    pub on: SqlExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionColumn {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderingClause {
    pub expr: SqlExpr,
    pub descending: bool,
}

/// Type and nullability of a column flowing out of a command node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnShape {
    pub table: Option<String>,
    pub name: String,
    pub sql_type: Option<SqlType>,
    pub nullable: bool,
}

// ============================================================================
// SelectExpression
// ============================================================================

/// A SELECT under construction.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SelectExpression {
    pub from: Option<TableSource>,
    pub joins: Vec<JoinClause>,
    pub predicate: Option<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub having: Option<SqlExpr>,
    pub projection: Vec<ProjectionColumn>,
    pub distinct: bool,
    pub orderings: Vec<OrderingClause>,
    pub limit: Option<SqlExpr>,
    pub offset: Option<SqlExpr>,
    pub set_operations: Vec<(SetOperationKind, SelectExpression)>,
}

impl SelectExpression {
    pub fn new(from: TableSource) -> Self {
        Self {
            from: Some(from),
            ..Self::default()
        }
    }

    pub fn add_join(&mut self, kind: JoinKind, table: TableSource, on: SqlExpr) {
        self.joins.push(JoinClause { kind, table, on });
    }

    /// AND a predicate into WHERE.
    pub fn apply_predicate(&mut self, predicate: SqlExpr) {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
    }

    /// AND a predicate into HAVING.
    pub fn apply_having(&mut self, predicate: SqlExpr) {
        self.having = Some(match self.having.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
    }

    /// AND a condition into the ON clause of the join with `alias`.
    pub fn apply_join_condition(&mut self, alias: &str, condition: SqlExpr) -> bool {
        let Some(join) = self.joins.iter_mut().find(|j| j.table.alias == alias) else {
            return false;
        };
        let on = std::mem::replace(&mut join.on, SqlExpr::Constant(relmap_core::Value::Bool(true)));
        join.on = on.and(condition);
        true
    }

    /// Project `expr`, reusing an identical column. Returns its position.
    pub fn add_projection(&mut self, expr: SqlExpr) -> usize {
        if let Some(i) = self.projection.iter().position(|c| c.expr == expr) {
            return i;
        }
        self.projection.push(ProjectionColumn { expr, alias: None });
        self.projection.len() - 1
    }

    pub fn add_ordering(&mut self, expr: SqlExpr, descending: bool) {
        self.orderings.push(OrderingClause { expr, descending });
    }

    /// The FROM table followed by every joined table.
    pub fn tables(&self) -> impl Iterator<Item = &TableSource> {
        self.from.iter().chain(self.joins.iter().map(|j| &j.table))
    }

    /// Paging or de-duplication that must be applied before anything
    /// composed on top (an aggregate, a count).
    pub fn requires_push_down(&self) -> bool {
        self.distinct || self.limit.is_some() || self.offset.is_some() || !self.group_by.is_empty() || !self.set_operations.is_empty()
    }

    /// Wrap this select as a derived table aliased `alias`. Projected
    /// columns are named `c0`, `c1`, ... and re-exposed as columns of the
    /// derived table, in order.
    #[must_use]
    pub fn push_down(mut self, alias: &str) -> SelectExpression {
        let mut outer_columns = Vec::with_capacity(self.projection.len());
        for (i, column) in self.projection.iter_mut().enumerate() {
            let name = format!("c{i}");
            column.alias = Some(name.clone());
            outer_columns.push(SqlExpr::column(
                alias,
                name,
                column.expr.sql_type().unwrap_or(SqlType::Text),
                column.expr.is_nullable(),
            ));
        }
        let mut outer = SelectExpression::new(TableSource {
            item: FromItem::Subquery(Box::new(self)),
            alias: alias.to_string(),
            entity_type: None,
        });
        for column in outer_columns {
            outer.add_projection(column);
        }
        outer
    }

    /// Every scalar expression owned directly by this select (not by
    /// nested subqueries), mutably.
    pub fn expressions_mut(&mut self) -> Vec<&mut SqlExpr> {
        let mut out: Vec<&mut SqlExpr> = Vec::new();
        out.extend(self.joins.iter_mut().map(|j| &mut j.on));
        out.extend(self.predicate.iter_mut());
        out.extend(self.group_by.iter_mut());
        out.extend(self.having.iter_mut());
        out.extend(self.projection.iter_mut().map(|c| &mut c.expr));
        out.extend(self.orderings.iter_mut().map(|o| &mut o.expr));
        out.extend(self.limit.iter_mut());
        out.extend(self.offset.iter_mut());
        out
    }

    /// Visit this select and every select nested in it (derived tables,
    /// subquery expressions, set-operation operands), outermost first.
    pub fn for_each_select_mut(&mut self, f: &mut dyn FnMut(&mut SelectExpression)) {
        f(self);
        for table in self.from.iter_mut().chain(self.joins.iter_mut().map(|j| &mut j.table)) {
            if let FromItem::Subquery(inner) = &mut table.item {
                inner.for_each_select_mut(f);
            }
        }
        for expr in self.expressions_mut() {
            expr.for_each_subquery_mut(&mut |inner| inner.for_each_select_mut(f));
        }
        for (_, other) in &mut self.set_operations {
            other.for_each_select_mut(f);
        }
    }

    /// Freeze into a command tree.
    pub fn to_command(&self) -> CommandNode {
        let referenced = self.referenced_columns();
        let table_node = |t: &TableSource| CommandNode::Table {
            source: t.clone(),
            columns: referenced.get(&t.alias).cloned().unwrap_or_default(),
        };

        let mut node = self.from.as_ref().map(|from| {
            let mut node = table_node(from);
            for join in &self.joins {
                node = CommandNode::Join {
                    kind: join.kind,
                    left: Box::new(node),
                    right: Box::new(table_node(&join.table)),
                    on: join.on.clone(),
                };
            }
            node
        });
        if let Some(predicate) = &self.predicate {
            node = node.map(|input| CommandNode::Filter {
                input: Box::new(input),
                predicate: predicate.clone(),
            });
        }
        if !self.group_by.is_empty() || self.having.is_some() {
            node = node.map(|input| CommandNode::Grouping {
                input: Box::new(input),
                keys: self.group_by.clone(),
                having: self.having.clone(),
            });
        }
        let mut node = CommandNode::Projection {
            input: node.map(Box::new),
            columns: self.projection.clone(),
            distinct: self.distinct,
        };
        for (kind, other) in &self.set_operations {
            node = CommandNode::SetOperation {
                kind: *kind,
                left: Box::new(node),
                right: Box::new(other.to_command()),
            };
        }
        if !self.orderings.is_empty() {
            node = CommandNode::Ordering {
                input: Box::new(node),
                orderings: self.orderings.clone(),
            };
        }
        if self.limit.is_some() || self.offset.is_some() {
            node = CommandNode::Limit {
                input: Box::new(node),
                limit: self.limit.clone(),
                offset: self.offset.clone(),
            };
        }
        node
    }

    fn referenced_columns(&self) -> BTreeMap<String, Vec<ColumnShape>> {
        let mut out: BTreeMap<String, Vec<ColumnShape>> = BTreeMap::new();
        let mut record = |e: &SqlExpr| {
            if let SqlExpr::Column {
                table,
                column,
                sql_type,
                nullable,
            } = e
            {
                let columns = out.entry(table.clone()).or_default();
                if !columns.iter().any(|c| c.name == *column) {
                    columns.push(ColumnShape {
                        table: Some(table.clone()),
                        name: column.clone(),
                        sql_type: Some(*sql_type),
                        nullable: *nullable,
                    });
                }
            }
        };
        let exprs = self
            .joins
            .iter()
            .map(|j| &j.on)
            .chain(self.predicate.iter())
            .chain(self.group_by.iter())
            .chain(self.having.iter())
            .chain(self.projection.iter().map(|c| &c.expr))
            .chain(self.orderings.iter().map(|o| &o.expr));
        for e in exprs {
            e.walk(&mut record);
        }
        out
    }
}

// ============================================================================
// Command tree
// ============================================================================

/// A node of the relational command tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "node")]
pub enum CommandNode {
    Table {
        source: TableSource,
        /// Columns read from this table.
        columns: Vec<ColumnShape>,
    },
    Join {
        kind: JoinKind,
        left: Box<CommandNode>,
        right: Box<CommandNode>,
        on: SqlExpr,
    },
    Filter {
        input: Box<CommandNode>,
        predicate: SqlExpr,
    },
    Grouping {
        input: Box<CommandNode>,
        keys: Vec<SqlExpr>,
        having: Option<SqlExpr>,
    },
    Projection {
        /// `None` for a SELECT without FROM.
        input: Option<Box<CommandNode>>,
        columns: Vec<ProjectionColumn>,
        distinct: bool,
    },
    SetOperation {
        kind: SetOperationKind,
        left: Box<CommandNode>,
        right: Box<CommandNode>,
    },
    Ordering {
        input: Box<CommandNode>,
        orderings: Vec<OrderingClause>,
    },
    Limit {
        input: Box<CommandNode>,
        limit: Option<SqlExpr>,
        offset: Option<SqlExpr>,
    },
}

impl CommandNode {
    pub const fn kind(&self) -> &'static str {
        match self {
            CommandNode::Table { .. } => "Table",
            CommandNode::Join { .. } => "Join",
            CommandNode::Filter { .. } => "Filter",
            CommandNode::Grouping { .. } => "Grouping",
            CommandNode::Projection { .. } => "Projection",
            CommandNode::SetOperation { .. } => "SetOperation",
            CommandNode::Ordering { .. } => "Ordering",
            CommandNode::Limit { .. } => "Limit",
        }
    }

    /// Columns this node produces.
    ///
    /// Row-preserving nodes pass their input's shape through. A LEFT join
    /// makes every column of its right side nullable.
    pub fn shape(&self) -> Vec<ColumnShape> {
        match self {
            CommandNode::Table { columns, .. } => columns.clone(),
            CommandNode::Join { kind, left, right, .. } => {
                let mut out = left.shape();
                out.extend(right.shape().into_iter().map(|mut c| {
                    c.nullable |= *kind == JoinKind::LeftOuter;
                    c
                }));
                out
            }
            CommandNode::Filter { input, .. } | CommandNode::Ordering { input, .. } | CommandNode::Limit { input, .. } => {
                input.shape()
            }
            CommandNode::Grouping { keys, .. } => keys.iter().enumerate().map(|(i, k)| expr_shape(k, i)).collect(),
            CommandNode::Projection { columns, .. } => columns
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let mut shape = expr_shape(&c.expr, i);
                    if let Some(alias) = &c.alias {
                        shape.name.clone_from(alias);
                    }
                    shape
                })
                .collect(),
            CommandNode::SetOperation { left, right, .. } => {
                let right = right.shape();
                left.shape()
                    .into_iter()
                    .enumerate()
                    .map(|(i, mut c)| {
                        c.nullable |= right.get(i).is_some_and(|r| r.nullable);
                        c
                    })
                    .collect()
            }
        }
    }

    /// JSON dump for debugging.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn expr_shape(expr: &SqlExpr, position: usize) -> ColumnShape {
    match expr {
        SqlExpr::Column {
            table,
            column,
            sql_type,
            nullable,
        } => ColumnShape {
            table: Some(table.clone()),
            name: column.clone(),
            sql_type: Some(*sql_type),
            nullable: *nullable,
        },
        other => ColumnShape {
            table: None,
            name: format!("c{position}"),
            sql_type: other.sql_type(),
            nullable: other.is_nullable(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::Value;

    fn gear_select() -> SelectExpression {
        let mut select = SelectExpression::new(TableSource::table("Gear", "g"));
        select.add_join(
            JoinKind::LeftOuter,
            TableSource::table("Squad", "s"),
            SqlExpr::column("s", "Id", SqlType::Integer, false).equal(SqlExpr::column("g", "SquadId", SqlType::Integer, false)),
        );
        select
    }

    #[test]
    fn test_projection_dedup() {
        let mut select = gear_select();
        let a = select.add_projection(SqlExpr::column("g", "Nickname", SqlType::Text, false));
        let b = select.add_projection(SqlExpr::column("s", "Name", SqlType::Text, true));
        let c = select.add_projection(SqlExpr::column("g", "Nickname", SqlType::Text, false));
        assert_eq!((a, b, c), (0, 1, 0));
        assert_eq!(select.projection.len(), 2);
    }

    #[test]
    fn test_command_tree_layers() {
        let mut select = gear_select();
        select.apply_predicate(SqlExpr::column("g", "HasSoulPatch", SqlType::Boolean, false));
        select.add_projection(SqlExpr::column("s", "Name", SqlType::Text, false));
        select.add_ordering(SqlExpr::column("g", "Rank", SqlType::Integer, false), true);
        select.limit = Some(SqlExpr::Constant(Value::Int(5)));

        let node = select.to_command();
        assert_eq!(node.kind(), "Limit");
        let CommandNode::Limit { input, .. } = &node else {
            unreachable!()
        };
        let CommandNode::Ordering { input, .. } = input.as_ref() else {
            panic!("expected ordering");
        };
        let CommandNode::Projection { input: Some(input), .. } = input.as_ref() else {
            panic!("expected projection");
        };
        let CommandNode::Filter { input, .. } = input.as_ref() else {
            panic!("expected filter");
        };
        assert_eq!(input.kind(), "Join");
        // The LEFT join makes squad columns nullable.
        let joined = input.shape();
        let name = joined.iter().find(|c| c.name == "Name").unwrap();
        assert!(name.nullable);
        let projected = node.shape();
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].table.as_deref(), Some("s"));
    }

    #[test]
    fn test_push_down_aliases_columns() {
        let mut select = gear_select();
        select.add_projection(SqlExpr::column("g", "Rank", SqlType::Integer, false));
        select.distinct = true;
        assert!(select.requires_push_down());
        let outer = select.push_down("t");
        assert!(!outer.requires_push_down());
        assert_eq!(
            outer.projection[0].expr,
            SqlExpr::column("t", "c0", SqlType::Integer, false)
        );
        let Some(FromItem::Subquery(inner)) = outer.from.as_ref().map(|f| &f.item) else {
            panic!("expected derived table");
        };
        assert_eq!(inner.projection[0].alias.as_deref(), Some("c0"));
    }

    #[test]
    fn test_join_condition_and_json() {
        let mut select = gear_select();
        assert!(select.apply_join_condition("s", SqlExpr::column("s", "Name", SqlType::Text, true).is_not_null()));
        assert!(!select.apply_join_condition("x", SqlExpr::Constant(Value::Bool(true))));
        select.add_projection(SqlExpr::column("g", "Nickname", SqlType::Text, false));
        let json = select.to_command().to_json();
        assert_eq!(json["node"], "Projection");
    }
}
