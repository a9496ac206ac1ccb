//! Turning result rows into values, entities and nested collections.
//!
//! The materializer follows the [`ResultShape`] produced by translation. It
//! runs the main query, then every split query with the keys of its parent
//! rows, and stitches collection rows to their parents by correlation key.
//!
//! Entities resolve their concrete type from the discriminator or, for
//! table-per-type hierarchies, from which derived table joined a row. With
//! tracking enabled each entity goes through the identity map, so a row for
//! an already tracked key returns the tracked instance.

use crate::tracker::{ChangeTracker, EntityState, EntryId, normalize};
use relmap_core::{
    Cx, DataSource, Dialect, DynamicEntity, Error, MaterializationError, Outcome, Result, Row,
    Statement, Value,
};
use relmap_metadata::{EntityTypeId, FinalizedModel};
use relmap_query::{
    ClientFunctions, CompiledQuery, ConcreteType, EntityShape, QuerySqlGenerator,
    ResultCardinality, ResultShape, SplitQuery, SqlRenderer,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Whether queried entities are tracked by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueryTrackingBehavior {
    /// Entities enter the identity map as `Unchanged`.
    #[default]
    TrackAll,
    /// Every row builds a fresh entity.
    NoTracking,
    /// Untracked, but rows with the same identity within one query share
    /// one instance.
    NoTrackingWithIdentityResolution,
}

/// One materialized result element.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultValue {
    /// A scalar; `Null` also stands for an absent optional entity.
    Value(Value),
    /// An entity, with its entry when tracked.
    Entity {
        entry: Option<EntryId>,
        entity: DynamicEntity,
    },
    /// An anonymous projection.
    Object(Vec<(String, ResultValue)>),
    Collection(Vec<ResultValue>),
}

impl ResultValue {
    pub const NULL: ResultValue = ResultValue::Value(Value::Null);

    pub fn is_null(&self) -> bool {
        matches!(self, ResultValue::Value(Value::Null))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ResultValue::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&DynamicEntity> {
        match self {
            ResultValue::Entity { entity, .. } => Some(entity),
            _ => None,
        }
    }

    pub fn into_entity(self) -> Option<DynamicEntity> {
        match self {
            ResultValue::Entity { entity, .. } => Some(entity),
            _ => None,
        }
    }

    /// Entry of a tracked entity.
    pub fn entry(&self) -> Option<EntryId> {
        match self {
            ResultValue::Entity { entry, .. } => *entry,
            _ => None,
        }
    }

    /// Field of an anonymous projection.
    pub fn field(&self, name: &str) -> Option<&ResultValue> {
        match self {
            ResultValue::Object(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&[ResultValue]> {
        match self {
            ResultValue::Collection(items) => Some(items),
            _ => None,
        }
    }

    /// JSON view, for logging and debugging.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ResultValue::Value(v) => v.to_json(),
            ResultValue::Entity { entity, .. } => {
                let mut map = serde_json::Map::new();
                map.insert(
                    "$type".to_string(),
                    serde_json::Value::String(entity.entity_type().to_string()),
                );
                for (name, value) in entity.iter() {
                    map.insert(name.to_string(), value.to_json());
                }
                serde_json::Value::Object(map)
            }
            ResultValue::Object(fields) => serde_json::Value::Object(
                fields.iter().map(|(n, v)| (n.clone(), v.to_json())).collect(),
            ),
            ResultValue::Collection(items) => {
                serde_json::Value::Array(items.iter().map(ResultValue::to_json).collect())
            }
        }
    }
}

/// Rows of the split queries, grouped by correlation key.
struct SplitRows<'q> {
    splits: &'q [SplitQuery],
    rows: Vec<Vec<Row>>,
    groups: Vec<HashMap<Vec<Value>, Vec<usize>>>,
}

/// Materializes the results of one query.
pub struct Materializer<'a> {
    model: FinalizedModel,
    functions: &'a ClientFunctions,
    tracking: QueryTrackingBehavior,
    tracker: &'a mut ChangeTracker,
    resolved: HashMap<(EntityTypeId, Vec<Value>), DynamicEntity>,
}

impl<'a> Materializer<'a> {
    pub fn new(
        tracker: &'a mut ChangeTracker,
        functions: &'a ClientFunctions,
        tracking: QueryTrackingBehavior,
    ) -> Self {
        Self {
            model: tracker.model().clone(),
            functions,
            tracking,
            tracker,
            resolved: HashMap::new(),
        }
    }

    /// Run `compiled` against `source` and materialize its results.
    #[tracing::instrument(level = "debug", skip_all, fields(splits = compiled.splits.len()))]
    pub async fn load<D: DataSource>(
        &mut self,
        cx: &Cx,
        source: &D,
        dialect: Dialect,
        compiled: &CompiledQuery,
    ) -> Outcome<Vec<ResultValue>, Error> {
        let renderer = SqlRenderer::new(dialect);
        let main = match fetch(cx, source, &compiled.statement(&renderer)).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if let Err(e) = check_width(&main, compiled.select.projection.len()) {
            return Outcome::Err(e);
        }

        let mut split_rows: Vec<Vec<Row>> = Vec::with_capacity(compiled.splits.len());
        for split in &compiled.splits {
            let parents: &[Row] = match split.parent {
                None => &main,
                Some(p) => split_rows.get(p).map_or(&[], Vec::as_slice),
            };
            let keys = parent_keys(parents, &split.parent_keys);
            let rows = if keys.is_empty() {
                Vec::new()
            } else {
                let statement = renderer.generate_select(&split.bind(&keys));
                match fetch(cx, source, &statement).await {
                    Outcome::Ok(rows) => rows,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            };
            if let Err(e) = check_width(&rows, split.select.projection.len()) {
                return Outcome::Err(e);
            }
            split_rows.push(rows);
        }
        let splits = SplitRows::new(&compiled.splits, split_rows);

        let mut values = Vec::with_capacity(main.len());
        for row in &main {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            match self.shape(&compiled.shape, row, &splits) {
                Ok(value) => values.push(value),
                Err(e) => return Outcome::Err(e),
            }
        }
        match apply_cardinality(compiled.cardinality, values) {
            Ok(values) => Outcome::Ok(values),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Materialize one row with `shape`.
    fn shape(&mut self, shape: &ResultShape, row: &Row, splits: &SplitRows<'_>) -> Result<ResultValue> {
        match shape {
            ResultShape::Scalar {
                index,
                discriminator_of,
                ..
            } => {
                let value = column(row, *index);
                if let Some(root) = discriminator_of {
                    let known = value.is_null()
                        || self
                            .model
                            .hierarchy_mapping(*root)
                            .is_none_or(|m| m.entity_type_for_discriminator(&value).is_some());
                    if !known {
                        tracing::warn!(
                            target: "relmap::materialize",
                            entity_type = self.model.entity_type_name(*root),
                            discriminator = ?value,
                            "unknown discriminator value"
                        );
                        return Ok(ResultValue::NULL);
                    }
                }
                Ok(ResultValue::Value(value))
            }
            ResultShape::Client(expr) => Ok(ResultValue::Value(expr.evaluate(row, self.functions)?)),
            ResultShape::Entity(entity) => self.entity(entity, row),
            ResultShape::Object(fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for (name, field) in fields {
                    values.push((name.clone(), self.shape(field, row, splits)?));
                }
                Ok(ResultValue::Object(values))
            }
            ResultShape::Collection(index) => self.collection(*index, row, splits),
        }
    }

    fn collection(&mut self, index: usize, parent: &Row, splits: &SplitRows<'_>) -> Result<ResultValue> {
        let Some(split) = splits.splits.get(index) else {
            return Err(MaterializationError::new(format!("no split query at index {index}")).into());
        };
        let key = normalize(&columns(parent, &split.parent_keys));
        let members: &[usize] = if key.iter().any(Value::is_null) {
            &[]
        } else {
            splits.groups[index].get(&key).map_or(&[], Vec::as_slice)
        };
        let take = split.limit.unwrap_or(usize::MAX);
        let mut items = Vec::new();
        for &i in members.iter().skip(split.offset.unwrap_or(0)).take(take) {
            items.push(self.shape(&split.shape, &splits.rows[index][i], splits)?);
        }
        Ok(ResultValue::Collection(items))
    }

    fn entity(&mut self, shape: &EntityShape, row: &Row) -> Result<ResultValue> {
        let model = self.model.clone();
        let static_name = model.entity_type_name(shape.entity_type);
        let key = columns(row, &shape.key);
        if key.iter().any(Value::is_null) {
            if shape.nullable {
                return Ok(ResultValue::NULL);
            }
            let column = shape.key.iter().copied().find(|i| column(row, *i).is_null());
            let mut err = MaterializationError::new("key column of a required entity is null")
                .with_entity_type(static_name);
            if let Some(c) = column {
                err = err.at_column(c);
            }
            return Err(err.into());
        }

        let concrete = match &shape.concrete {
            ConcreteType::Fixed => shape.entity_type,
            ConcreteType::Discriminator { index } => {
                let value = column(row, *index);
                let found = model
                    .hierarchy_mapping(shape.entity_type)
                    .and_then(|m| m.entity_type_for_discriminator(&value))
                    .filter(|t| model.is_assignable_from(shape.entity_type, *t));
                let Some(t) = found else {
                    tracing::warn!(
                        target: "relmap::materialize",
                        entity_type = static_name,
                        discriminator = ?value,
                        "unknown discriminator value, row skipped"
                    );
                    return Ok(ResultValue::NULL);
                };
                t
            }
            ConcreteType::LeafKeys(leaves) => leaves
                .iter()
                .find(|(_, i)| !column(row, *i).is_null())
                .map_or(shape.entity_type, |(t, _)| *t),
        };

        let mut entity = DynamicEntity::new(model.entity_type_name(concrete));
        for &(p, index) in &shape.properties {
            let Some(prop) = model.property(p) else {
                continue;
            };
            if model.is_assignable_from(prop.declaring_type(), concrete) {
                entity.set(prop.name(), column(row, index));
            }
        }

        match self.tracking {
            QueryTrackingBehavior::TrackAll => {
                let (id, created) = self.tracker.get_or_create(entity, EntityState::Unchanged)?;
                if !created {
                    tracing::trace!(target: "relmap::materialize", entry = %id, "identity resolved to tracked entry");
                }
                let entity = self
                    .tracker
                    .entry(id)
                    .map(|e| e.entity().clone())
                    .unwrap_or_default();
                Ok(ResultValue::Entity { entry: Some(id), entity })
            }
            QueryTrackingBehavior::NoTrackingWithIdentityResolution => {
                let identity = (model.root(concrete), normalize(&key));
                let entity = self.resolved.entry(identity).or_insert(entity).clone();
                Ok(ResultValue::Entity { entry: None, entity })
            }
            QueryTrackingBehavior::NoTracking => Ok(ResultValue::Entity { entry: None, entity }),
        }
    }
}

impl<'q> SplitRows<'q> {
    fn new(splits: &'q [SplitQuery], rows: Vec<Vec<Row>>) -> Self {
        let groups = splits
            .iter()
            .zip(&rows)
            .map(|(split, rows)| {
                let mut groups: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
                for (i, row) in rows.iter().enumerate() {
                    groups
                        .entry(normalize(&columns(row, &split.correlation)))
                        .or_default()
                        .push(i);
                }
                groups
            })
            .collect();
        Self { splits, rows, groups }
    }
}

async fn fetch<D: DataSource>(cx: &Cx, source: &D, statement: &Statement) -> Outcome<Vec<Row>, Error> {
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    tracing::debug!(target: "relmap::query", sql = %statement.sql, params = statement.params.len(), "query");
    source.query(cx, &statement.sql, &statement.params).await
}

/// Every row must carry at least the projected columns.
fn check_width(rows: &[Row], width: usize) -> Result<()> {
    match rows.iter().position(|r| r.len() < width) {
        Some(i) => Err(MaterializationError::new(format!(
            "row {i} has {} column(s) but the query projects {width}",
            rows[i].len()
        ))
        .at_column(rows[i].len())
        .into()),
        None => Ok(()),
    }
}

fn column(row: &Row, index: usize) -> Value {
    row.get(index).cloned().unwrap_or(Value::Null)
}

fn columns(row: &Row, indexes: &[usize]) -> Vec<Value> {
    indexes.iter().map(|i| column(row, *i)).collect()
}

/// Distinct non-null key tuples of `rows`, in first-seen order.
fn parent_keys(rows: &[Row], indexes: &[usize]) -> Vec<Vec<Value>> {
    let mut seen = std::collections::HashSet::new();
    rows.iter()
        .map(|r| columns(r, indexes))
        .filter(|k| !k.iter().any(Value::is_null))
        .filter(|k| seen.insert(normalize(k)))
        .collect()
}

fn apply_cardinality(cardinality: ResultCardinality, mut values: Vec<ResultValue>) -> Result<Vec<ResultValue>> {
    match cardinality {
        ResultCardinality::Sequence => Ok(values),
        ResultCardinality::First | ResultCardinality::Single if values.is_empty() => {
            Err(MaterializationError::new("sequence contains no elements").into())
        }
        ResultCardinality::Single | ResultCardinality::SingleOrDefault if values.len() > 1 => {
            Err(MaterializationError::new("sequence contains more than one element").into())
        }
        ResultCardinality::FirstOrDefault | ResultCardinality::SingleOrDefault if values.is_empty() => {
            Ok(vec![ResultValue::NULL])
        }
        ResultCardinality::First
        | ResultCardinality::FirstOrDefault
        | ResultCardinality::Single
        | ResultCardinality::SingleOrDefault
        | ResultCardinality::Scalar(_) => {
            values.truncate(1);
            if values.is_empty() {
                values.push(ResultValue::NULL);
            }
            Ok(values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_model::outpost_model;
    use relmap_query::sql::{SelectExpression, TableSource};
    use relmap_query::{Query, QueryCompiler};

    fn row(values: Vec<Value>) -> Row {
        Row::from_values(values)
    }

    fn compile(query: Query) -> CompiledQuery {
        let model = outpost_model();
        QueryCompiler::new(&model).compile(query).unwrap()
    }

    fn entity_shape(compiled: &CompiledQuery) -> &EntityShape {
        match &compiled.shape {
            ResultShape::Entity(e) => e,
            other => panic!("expected an entity shape, got {other:?}"),
        }
    }

    /// A row for the `Gear` shape with the given discriminator.
    fn gear_row(shape: &EntityShape, nickname: &str, discriminator: &str) -> Row {
        let model = outpost_model();
        let width = shape.properties.iter().map(|(_, i)| i + 1).max().unwrap_or(0);
        let mut values = vec![Value::Null; width];
        for &(p, i) in &shape.properties {
            values[i] = match model.property_name(p) {
                "Nickname" => Value::from(nickname),
                "SquadId" => Value::Int(1),
                "Rank" => Value::Int(2),
                "Discriminator" => Value::from(discriminator),
                _ => Value::Null,
            };
        }
        row(values)
    }

    #[test]
    fn test_discriminator_picks_concrete_type() {
        let compiled = compile(Query::from("Gear"));
        let shape = entity_shape(&compiled).clone();
        let functions = ClientFunctions::with_builtins();
        let mut tracker = ChangeTracker::new(outpost_model());
        let mut m = Materializer::new(&mut tracker, &functions, QueryTrackingBehavior::TrackAll);

        let officer = m.entity(&shape, &gear_row(&shape, "Marcus", "Officer")).unwrap();
        assert_eq!(officer.as_entity().unwrap().entity_type(), "Officer");
        assert!(officer.entry().is_some());

        let unknown = m.entity(&shape, &gear_row(&shape, "Dom", "Sniper")).unwrap();
        assert!(unknown.is_null());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_tracked_instance_wins() {
        let compiled = compile(Query::from("Gear"));
        let shape = entity_shape(&compiled).clone();
        let functions = ClientFunctions::with_builtins();
        let mut tracker = ChangeTracker::new(outpost_model());
        let id = tracker
            .attach(
                DynamicEntity::new("Gear")
                    .with("Nickname", "Marcus")
                    .with("SquadId", 1)
                    .with("Rank", 9),
            )
            .unwrap();
        let mut m = Materializer::new(&mut tracker, &functions, QueryTrackingBehavior::TrackAll);
        let value = m.entity(&shape, &gear_row(&shape, "Marcus", "Gear")).unwrap();
        assert_eq!(value.entry(), Some(id));
        assert_eq!(value.as_entity().unwrap().get("Rank"), Some(&Value::Int(9)));
    }

    #[test]
    fn test_identity_resolution_without_tracking() {
        let compiled = compile(Query::from("Gear"));
        let shape = entity_shape(&compiled).clone();
        let functions = ClientFunctions::with_builtins();
        let mut tracker = ChangeTracker::new(outpost_model());
        let mut m = Materializer::new(
            &mut tracker,
            &functions,
            QueryTrackingBehavior::NoTrackingWithIdentityResolution,
        );
        let first = m.entity(&shape, &gear_row(&shape, "Marcus", "Gear")).unwrap();
        let mut again = gear_row(&shape, "Marcus", "Gear").into_values();
        let rank = shape
            .properties
            .iter()
            .find(|(p, _)| outpost_model().property_name(*p) == "Rank")
            .map(|(_, i)| *i)
            .unwrap();
        again[rank] = Value::Int(7);
        let second = m.entity(&shape, &row(again)).unwrap();
        assert_eq!(first, second);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_null_key_on_required_entity_fails() {
        let compiled = compile(Query::from("Squad"));
        let shape = entity_shape(&compiled).clone();
        let functions = ClientFunctions::with_builtins();
        let mut tracker = ChangeTracker::new(outpost_model());
        let mut m = Materializer::new(&mut tracker, &functions, QueryTrackingBehavior::NoTracking);
        let err = m.entity(&shape, &row(vec![Value::Null, Value::from("Delta")])).unwrap_err();
        let Error::Materialization(e) = err else {
            panic!("expected a materialization error");
        };
        assert_eq!(e.entity_type.as_deref(), Some("Squad"));

        let mut optional = shape.clone();
        optional.nullable = true;
        let absent = m.entity(&optional, &row(vec![Value::Null, Value::Null])).unwrap();
        assert!(absent.is_null());
    }

    #[test]
    fn test_collection_stitched_by_correlation_key() {
        let functions = ClientFunctions::with_builtins();
        let mut tracker = ChangeTracker::new(outpost_model());
        let mut m = Materializer::new(&mut tracker, &functions, QueryTrackingBehavior::NoTracking);
        let splits = vec![SplitQuery {
            select: SelectExpression::new(TableSource::table("Weapon", "w")),
            shape: ResultShape::Scalar {
                index: 0,
                property: None,
                discriminator_of: None,
            },
            parent: None,
            parent_keys: vec![0],
            correlation: vec![1],
            correlation_columns: Vec::new(),
            offset: Some(1),
            limit: None,
        }];
        let rows = SplitRows::new(
            &splits,
            vec![vec![
                row(vec![Value::from("Lancer"), Value::BigInt(1)]),
                row(vec![Value::from("Gnasher"), Value::Int(2)]),
                row(vec![Value::from("Longshot"), Value::Int(1)]),
                row(vec![Value::from("Boomshot"), Value::Int(1)]),
            ]],
        );
        let parent = row(vec![Value::Int(1)]);
        let value = m.shape(&ResultShape::Collection(0), &parent, &rows).unwrap();
        let names: Vec<_> = value
            .as_collection()
            .unwrap()
            .iter()
            .map(|v| v.as_value().and_then(Value::as_str).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["Longshot", "Boomshot"]);

        let orphan = m.shape(&ResultShape::Collection(0), &row(vec![Value::Null]), &rows).unwrap();
        assert_eq!(orphan.as_collection().map(<[_]>::len), Some(0));
    }

    #[test]
    fn test_cardinality() {
        let one = || vec![ResultValue::Value(Value::Int(1))];
        let two = || vec![ResultValue::Value(Value::Int(1)), ResultValue::Value(Value::Int(2))];
        assert!(apply_cardinality(ResultCardinality::First, Vec::new()).is_err());
        assert_eq!(apply_cardinality(ResultCardinality::First, two()).unwrap(), one());
        assert_eq!(
            apply_cardinality(ResultCardinality::FirstOrDefault, Vec::new()).unwrap(),
            vec![ResultValue::NULL]
        );
        assert!(apply_cardinality(ResultCardinality::Single, two()).is_err());
        assert!(apply_cardinality(ResultCardinality::SingleOrDefault, two()).is_err());
        assert_eq!(apply_cardinality(ResultCardinality::Single, one()).unwrap(), one());
        assert_eq!(apply_cardinality(ResultCardinality::Sequence, two()).unwrap().len(), 2);
    }

    #[test]
    fn test_to_json_of_object() {
        let value = ResultValue::Object(vec![
            ("name".to_string(), ResultValue::Value(Value::from("Delta"))),
            ("leader".to_string(), ResultValue::NULL),
            (
                "members".to_string(),
                ResultValue::Collection(vec![ResultValue::Entity {
                    entry: None,
                    entity: DynamicEntity::new("Gear").with("Nickname", "Marcus"),
                }]),
            ),
        ]);
        let json = value.to_json();
        assert_eq!(json["members"][0]["$type"], "Gear");
        assert_eq!(json["name"], "Delta");
        assert!(json["leader"].is_null());
        assert_eq!(json["members"][0]["Nickname"], "Marcus");
    }
}
