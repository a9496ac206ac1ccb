//! The frozen, shareable model.

use crate::ids::{EntityTypeId, PropertyId};
use crate::model::Model;
use std::ops::Deref;
use std::sync::Arc;

/// A validated, read-only model.
///
/// Cloning is cheap and the model can be read from many threads at once;
/// there is no mutation surface.
#[derive(Debug, Clone)]
pub struct FinalizedModel {
    inner: Arc<Model>,
}

impl FinalizedModel {
    pub(crate) fn new(model: Model) -> Self {
        Self {
            inner: Arc::new(model),
        }
    }

    /// Entity type id by name.
    pub fn entity_type_id(&self, name: &str) -> Option<EntityTypeId> {
        self.inner.find_entity_type(name).map(|et| et.id())
    }

    /// Property id by entity type and property name, searching base types.
    pub fn property_id(&self, entity_type: &str, property: &str) -> Option<PropertyId> {
        let et = self.entity_type_id(entity_type)?;
        self.inner.find_property(et, property)
    }

    /// Names of the primary-key properties of `entity_type`.
    pub fn key_names(&self, entity_type: EntityTypeId) -> Vec<String> {
        self.inner
            .primary_key_properties(entity_type)
            .into_iter()
            .map(|p| self.inner.property_name(p).to_string())
            .collect()
    }

    /// Serialize the model for debugging.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&*self.inner).unwrap_or(serde_json::Value::Null)
    }
}

impl Deref for FinalizedModel {
    type Target = Model;

    fn deref(&self) -> &Model {
        &self.inner
    }
}
