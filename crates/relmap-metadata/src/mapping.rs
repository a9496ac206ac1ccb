//! Hierarchy mapping strategies.
//!
//! Selected once per hierarchy at finalization time. The query pipeline and
//! the update pipeline branch on [`HierarchyMapping`] instead of inspecting
//! the type graph again.

use crate::annotations::names;
use crate::ids::{EntityTypeId, PropertyId};
use crate::model::Model;
use relmap_core::{ModelBuildingError, Value};
use serde::{Deserialize, Serialize};

/// How a hierarchy is laid out in tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MappingStrategy {
    /// One table for the whole hierarchy, rows tagged by a discriminator.
    #[default]
    SingleTable,
    /// One table per type, joined on the shared primary key.
    TablePerType,
}

impl MappingStrategy {
    /// Annotation value for this strategy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MappingStrategy::SingleTable => "TPH",
            MappingStrategy::TablePerType => "TPT",
        }
    }

    /// Parse an annotation value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "TPH" => Some(MappingStrategy::SingleTable),
            "TPT" => Some(MappingStrategy::TablePerType),
            _ => None,
        }
    }
}

/// The frozen mapping of one hierarchy (keyed by its root).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HierarchyMapping {
    /// A root type with no derived types.
    Standalone {
        /// Table name.
        table: String,
    },
    /// All types share the root's table.
    SingleTable {
        /// Shared table.
        table: String,
        /// Discriminator property on the root.
        discriminator: PropertyId,
        /// Discriminator value per type, pre-order from the root.
        values: Vec<(EntityTypeId, Value)>,
        /// True when the table never contains values outside `values`.
        is_complete: bool,
    },
    /// Each type has its own table keyed by the shared primary key.
    TablePerType {
        /// Table per type, pre-order from the root.
        tables: Vec<(EntityTypeId, String)>,
    },
}

impl HierarchyMapping {
    /// Build the mapping for `root`.
    pub(crate) fn build(model: &Model, root: EntityTypeId) -> Result<Self, ModelBuildingError> {
        let types = model.self_and_descendants(root);
        let root_name = model.entity_type_name(root).to_string();
        if types.len() == 1 {
            return Ok(HierarchyMapping::Standalone {
                table: model.table_name(root),
            });
        }
        match model.mapping_strategy(root) {
            MappingStrategy::TablePerType => Ok(HierarchyMapping::TablePerType {
                tables: types.iter().map(|t| (*t, model.table_name(*t))).collect(),
            }),
            MappingStrategy::SingleTable => {
                let discriminator = model.discriminator_property(root).ok_or_else(|| {
                    ModelBuildingError::new("single-table hierarchy has no discriminator property")
                        .with_entity_type(root_name.clone())
                })?;
                let mut values = Vec::with_capacity(types.len());
                for t in &types {
                    let value = model.discriminator_value(*t).cloned().ok_or_else(|| {
                        ModelBuildingError::new("entity type has no discriminator value")
                            .with_entity_type(model.entity_type_name(*t))
                    })?;
                    values.push((*t, value));
                }
                let is_complete = model
                    .entity_type(root)
                    .and_then(|et| {
                        et.annotations()
                            .value(names::IS_DISCRIMINATOR_MAPPING_COMPLETE)
                    })
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Ok(HierarchyMapping::SingleTable {
                    table: model.table_name(root),
                    discriminator,
                    values,
                    is_complete,
                })
            }
        }
    }

    /// Concrete type tagged by a discriminator value, if known.
    pub fn entity_type_for_discriminator(&self, value: &Value) -> Option<EntityTypeId> {
        match self {
            HierarchyMapping::SingleTable { values, .. } => values
                .iter()
                .find(|(_, v)| v.loosely_equals(value))
                .map(|(t, _)| *t),
            _ => None,
        }
    }

    /// Discriminator value of a type, if single-table.
    pub fn discriminator_value_of(&self, entity_type: EntityTypeId) -> Option<&Value> {
        match self {
            HierarchyMapping::SingleTable { values, .. } => values
                .iter()
                .find(|(t, _)| *t == entity_type)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// True for table-per-type hierarchies.
    pub fn is_table_per_type(&self) -> bool {
        matches!(self, HierarchyMapping::TablePerType { .. })
    }
}
