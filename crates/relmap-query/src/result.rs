//! Compiled queries and the result shapes the materializer follows.

use crate::client::ClientExpr;
use crate::query::TerminalKind;
use crate::sql::{QuerySqlGenerator, SelectExpression, SqlExpr};
use relmap_core::{Statement, Value};
use relmap_metadata::{EntityTypeId, PropertyId};

/// How to find the concrete type of an entity row.
#[derive(Debug, Clone, PartialEq)]
pub enum ConcreteType {
    /// Always the static type.
    Fixed,
    /// Single-table hierarchy: the discriminator is projected at `index`.
    Discriminator { index: usize },
    /// Table-per-type hierarchy: the first derived type whose key column is
    /// non-null, most derived first. Falls back to the static type.
    LeafKeys(Vec<(EntityTypeId, usize)>),
}

/// An entity built from projected columns.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityShape {
    /// Static type; the concrete type may be derived from it.
    pub entity_type: EntityTypeId,
    /// Every property of the type and its derived types, with its column.
    pub properties: Vec<(PropertyId, usize)>,
    /// Columns of the primary key.
    pub key: Vec<usize>,
    pub concrete: ConcreteType,
    /// Reached through an outer join; an all-null key means no entity.
    pub nullable: bool,
    /// Projected key column of each derived table (table-per-type only).
    pub tables: Vec<(EntityTypeId, usize)>,
}

/// The shape of one result element.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultShape {
    /// A projected column.
    Scalar {
        index: usize,
        /// Property read by the column, when it is a plain property access.
        property: Option<PropertyId>,
        /// Set when the column is the discriminator of the hierarchy rooted
        /// here; values outside the mapping materialize as null.
        discriminator_of: Option<EntityTypeId>,
    },
    /// Evaluated in memory from projected columns.
    Client(ClientExpr),
    Entity(EntityShape),
    Object(Vec<(String, ResultShape)>),
    /// A correlated collection, loaded by the split query at this index.
    Collection(usize),
}

impl ResultShape {
    /// Visit this shape and nested shapes (not split queries), mutably.
    pub fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut ResultShape)) {
        f(self);
        if let ResultShape::Object(fields) = self {
            for (_, shape) in fields {
                shape.for_each_mut(f);
            }
        }
    }

    /// True when evaluating this shape needs client evaluation.
    pub fn has_client_evaluation(&self) -> bool {
        match self {
            ResultShape::Client(_) => true,
            ResultShape::Object(fields) => fields.iter().any(|(_, s)| s.has_client_evaluation()),
            _ => false,
        }
    }
}

/// How many results the caller expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCardinality {
    Sequence,
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
    /// One value computed by the store (`Count`, `Any`, `Sum`, ...).
    Scalar(TerminalKind),
}

/// A second query loading a correlated collection for every parent row.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitQuery {
    pub select: SelectExpression,
    /// Shape of each collection element.
    pub shape: ResultShape,
    /// `None` when the parent is the main query, else the parent split.
    pub parent: Option<usize>,
    /// Parent row columns holding the parent key.
    pub parent_keys: Vec<usize>,
    /// Columns of this query holding the correlation key.
    pub correlation: Vec<usize>,
    /// Correlation key expressions, for binding parent keys.
    pub correlation_columns: Vec<SqlExpr>,
    /// Per-parent `Skip`, applied while stitching.
    pub offset: Option<usize>,
    /// Per-parent `Take`, applied while stitching.
    pub limit: Option<usize>,
}

impl SplitQuery {
    /// The query restricted to `parent_keys` (one tuple per parent row).
    ///
    /// A single-column correlation becomes `IN (...)`; composite ones an OR
    /// of conjunctions. No parents gives a predicate that matches nothing.
    pub fn bind(&self, parent_keys: &[Vec<Value>]) -> SelectExpression {
        let mut select = self.select.clone();
        let mut param = 0usize;
        let mut next = |value: &Value| {
            param += 1;
            SqlExpr::Parameter {
                name: format!("__key_{param}"),
                value: value.clone(),
            }
        };
        let keys: Vec<&Vec<Value>> = parent_keys
            .iter()
            .filter(|k| !k.iter().any(Value::is_null))
            .collect();
        let predicate = if let [column] = self.correlation_columns.as_slice() {
            SqlExpr::In {
                operand: Box::new(column.clone()),
                values: keys.iter().filter_map(|k| k.first()).map(&mut next).collect(),
                negated: false,
            }
        } else {
            let tuples = keys.iter().filter_map(|k| {
                SqlExpr::conjunction(
                    self.correlation_columns
                        .iter()
                        .zip(k.iter())
                        .map(|(c, v)| c.clone().equal(next(v))),
                )
            });
            tuples.reduce(SqlExpr::or).unwrap_or(SqlExpr::Constant(Value::Bool(false)))
        };
        select.apply_predicate(predicate);
        select
    }
}

/// The output of translation: one main select, its result shape and the
/// split queries for collections.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub select: SelectExpression,
    pub shape: ResultShape,
    pub splits: Vec<SplitQuery>,
    pub cardinality: ResultCardinality,
}

impl CompiledQuery {
    /// Render the main query.
    pub fn statement(&self, generator: &dyn QuerySqlGenerator) -> Statement {
        generator.generate(&self.select.to_command())
    }

    /// The command tree as JSON, for debugging.
    pub fn to_json(&self) -> serde_json::Value {
        self.select.to_command().to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{SqlRenderer, TableSource};
    use relmap_core::{Dialect, SqlType};

    fn split(columns: Vec<SqlExpr>) -> SplitQuery {
        let mut select = SelectExpression::new(TableSource::table("Weapon", "w"));
        select.add_projection(SqlExpr::column("w", "Name", SqlType::Text, true));
        SplitQuery {
            select,
            shape: ResultShape::Scalar {
                index: 0,
                property: None,
                discriminator_of: None,
            },
            parent: None,
            parent_keys: vec![0],
            correlation: vec![1],
            correlation_columns: columns,
            offset: None,
            limit: None,
        }
    }

    #[test]
    fn test_bind_single_column_uses_in() {
        let s = split(vec![SqlExpr::column("w", "SquadId", SqlType::Integer, true)]);
        let bound = s.bind(&[vec![Value::Int(1)], vec![Value::Null], vec![Value::Int(2)]]);
        let stmt = SqlRenderer::new(Dialect::Postgres).generate_select(&bound);
        assert_eq!(
            stmt.sql,
            r#"SELECT "w"."Name" FROM "Weapon" AS "w" WHERE "w"."SquadId" IN ($1, $2)"#
        );
        assert_eq!(stmt.params, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_bind_composite_uses_or_of_ands() {
        let s = split(vec![
            SqlExpr::column("w", "OwnerNickname", SqlType::Text, true),
            SqlExpr::column("w", "OwnerSquadId", SqlType::Integer, true),
        ]);
        let bound = s.bind(&[
            vec![Value::from("Marcus"), Value::Int(1)],
            vec![Value::from("Dom"), Value::Int(1)],
        ]);
        let stmt = SqlRenderer::new(Dialect::Sqlite).generate_select(&bound);
        assert_eq!(
            stmt.sql,
            r#"SELECT "w"."Name" FROM "Weapon" AS "w" WHERE "w"."OwnerNickname" = ?1 AND "w"."OwnerSquadId" = ?2 OR "w"."OwnerNickname" = ?3 AND "w"."OwnerSquadId" = ?4"#
        );
        let empty = s.bind(&[]);
        assert_eq!(empty.predicate, Some(SqlExpr::Constant(Value::Bool(false))));
    }
}
