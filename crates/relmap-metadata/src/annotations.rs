//! Named annotations attached to the model, entity types and properties.

use crate::source::ConfigurationSource;
use relmap_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known annotation names.
pub mod names {
    /// Table an entity type maps to.
    pub const TABLE_NAME: &str = "Relational:TableName";
    /// Column a property maps to.
    pub const COLUMN_NAME: &str = "Relational:ColumnName";
    /// Hierarchy mapping strategy on a root type: `"TPH"` or `"TPT"`.
    pub const MAPPING_STRATEGY: &str = "Relational:MappingStrategy";
    /// Discriminator value of a type in a single-table hierarchy.
    pub const DISCRIMINATOR_VALUE: &str = "Relational:DiscriminatorValue";
    /// Whether every discriminator value in the table is known to the model.
    pub const IS_DISCRIMINATOR_MAPPING_COMPLETE: &str = "Relational:IsDiscriminatorMappingComplete";
    /// Property is required (non-nullable).
    pub const REQUIRED: &str = "Required";
    /// Property is a concurrency token.
    pub const CONCURRENCY_CHECK: &str = "ConcurrencyCheck";
    /// Store value generation: `"Identity"`, `"Computed"` or `"None"`.
    pub const DATABASE_GENERATED: &str = "DatabaseGenerated";
    /// Maximum length of a string or binary property.
    pub const MAX_LENGTH: &str = "MaxLength";
}

/// A single annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Annotation name.
    pub name: String,
    /// Annotation value.
    pub value: Value,
    /// Who set it.
    pub source: ConfigurationSource,
}

impl Annotation {
    /// Create an annotation.
    pub fn new(name: impl Into<String>, value: impl Into<Value>, source: ConfigurationSource) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            source,
        }
    }
}

/// The annotations of one element, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    entries: BTreeMap<String, Annotation>,
}

impl Annotations {
    /// Find an annotation.
    pub fn get(&self, name: &str) -> Option<&Annotation> {
        self.entries.get(name)
    }

    /// The value of an annotation.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).map(|a| &a.value)
    }

    /// String value of an annotation.
    pub fn str_value(&self, name: &str) -> Option<&str> {
        self.value(name).and_then(Value::as_str)
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.entries.values()
    }

    /// Number of annotations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no annotations.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(&mut self, annotation: Annotation) -> Option<Annotation> {
        self.entries.insert(annotation.name.clone(), annotation)
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Annotation> {
        self.entries.remove(name)
    }
}
