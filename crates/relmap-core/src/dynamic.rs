//! Dynamically-shaped entity instances.
//!
//! Provides `DynamicEntity`, the property bag the change tracker, the
//! update pipeline and the materializer exchange. Typed structs bridge to
//! it through the [`Entity`](crate::entity::Entity) trait.

use std::collections::BTreeMap;

use crate::error::{MaterializationError, Result};
use crate::row::Row;
use crate::value::Value;

/// An entity instance whose shape is described by runtime metadata.
///
/// Values are stored by property name. A property that was never set reads
/// as absent, which the tracker treats as NULL.
///
/// # Example
///
/// ```
/// use relmap_core::dynamic::DynamicEntity;
/// use relmap_core::value::Value;
///
/// let gear = DynamicEntity::new("Gear")
///     .with("Nickname", "Marcus")
///     .with("SquadId", 1);
///
/// assert_eq!(gear.entity_type(), "Gear");
/// assert_eq!(gear.get("Nickname").and_then(Value::as_str), Some("Marcus"));
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DynamicEntity {
    entity_type: String,
    values: BTreeMap<String, Value>,
}

impl DynamicEntity {
    /// Create an empty instance of the named entity type.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            values: BTreeMap::new(),
        }
    }

    /// Builder-style setter.
    #[must_use]
    pub fn with(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(property.into(), value.into());
        self
    }

    /// The entity type name (the most-derived type).
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Change the entity type name (used when materializing a derived type).
    pub fn set_entity_type(&mut self, entity_type: impl Into<String>) {
        self.entity_type = entity_type.into();
    }

    /// Set a property value.
    pub fn set(&mut self, property: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(property.into(), value.into());
    }

    /// Get a property value.
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    /// Get a property value, treating an absent value as NULL.
    pub fn get_or_null(&self, property: &str) -> Value {
        self.values.get(property).cloned().unwrap_or(Value::Null)
    }

    /// Remove a value, returning it.
    pub fn remove(&mut self, property: &str) -> Option<Value> {
        self.values.remove(property)
    }

    /// Check if a property has a value set.
    pub fn has(&self, property: &str) -> bool {
        self.values.contains_key(property)
    }

    /// All property/value pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Values of the named properties, in the given order.
    pub fn values_of<'a>(&self, properties: impl IntoIterator<Item = &'a str>) -> Vec<Value> {
        properties
            .into_iter()
            .map(|p| self.get_or_null(p))
            .collect()
    }

    /// Populate from named row columns.
    ///
    /// `columns` maps property names to row positions. A position past the
    /// end of the row is a materialization error.
    pub fn from_row(
        entity_type: impl Into<String>,
        columns: &[(String, usize)],
        row: &Row,
    ) -> Result<Self> {
        let mut entity = Self::new(entity_type);
        for (property, index) in columns {
            let value = row.get(*index).ok_or_else(|| {
                MaterializationError::new(format!(
                    "row has {} column(s), property '{property}' expects position {index}",
                    row.len()
                ))
                .at_column(*index)
                .with_entity_type(entity.entity_type.clone())
            })?;
            entity.values.insert(property.clone(), value.clone());
        }
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_entity_basic() {
        let mut gear = DynamicEntity::new("Gear");
        gear.set("Nickname", "Marcus");

        assert_eq!(gear.entity_type(), "Gear");
        assert_eq!(gear.get("Nickname").and_then(Value::as_str), Some("Marcus"));
        assert!(!gear.has("SquadId"));
        assert_eq!(gear.get_or_null("SquadId"), Value::Null);
    }

    #[test]
    fn test_values_of_preserves_order() {
        let gear = DynamicEntity::new("Gear")
            .with("Nickname", "Dom")
            .with("SquadId", 1);
        assert_eq!(
            gear.values_of(["SquadId", "Nickname"]),
            vec![Value::Int(1), Value::from("Dom")]
        );
    }

    #[test]
    fn test_from_row_out_of_range() {
        let row = Row::from_values(vec![Value::Int(1)]);
        let cols = vec![("Id".to_string(), 0), ("Name".to_string(), 3)];
        let err = DynamicEntity::from_row("Squad", &cols, &row).unwrap_err();
        assert!(matches!(err, crate::Error::Materialization(_)));

        let ok = DynamicEntity::from_row("Squad", &cols[..1], &row).unwrap();
        assert_eq!(ok.get("Id"), Some(&Value::Int(1)));
    }
}
