use super::{BaseTypeChangedConvention, Convention, ConventionContext, ConventionResult};
use crate::builder::ModelBuilder;
use crate::ids::{EntityTypeId, KeyId};
use crate::source::ConfigurationSource;

/// Derived types share the root's key: setting a base type removes the
/// derived type's own convention-configured keys.
#[derive(Debug, Default)]
pub struct BaseTypeKeyConvention;

impl Convention for BaseTypeKeyConvention {
    fn name(&self) -> &'static str {
        "BaseTypeKey"
    }
}

impl BaseTypeChangedConvention for BaseTypeKeyConvention {
    fn process_base_type_changed(
        &self,
        builder: &mut ModelBuilder,
        entity_type: EntityTypeId,
        new_base: Option<EntityTypeId>,
        _old_base: Option<EntityTypeId>,
        _context: &mut ConventionContext,
    ) -> ConventionResult {
        if new_base.is_none() {
            return Ok(());
        }
        let keys: Vec<KeyId> = builder
            .model()
            .entity_type(entity_type)
            .map(|et| et.declared_keys().to_vec())
            .unwrap_or_default();
        for key in keys {
            if let Err(rejection) = builder.remove_key(key, ConfigurationSource::Convention) {
                tracing::debug!(
                    target: "relmap::conventions",
                    entity_type = builder.model().entity_type_name(entity_type),
                    %rejection,
                    "Derived type keeps its key"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::*;
    use relmap_core::SqlType;

    #[test]
    fn test_base_type_removes_derived_key() {
        let mut mb = ModelBuilder::new();
        let gear = mb.entity("Gear").unwrap();
        mb.property(gear, "Id", SqlType::Integer).unwrap();
        let officer = mb.entity("Officer").unwrap();
        mb.property(officer, "OfficerId", SqlType::Integer).unwrap();
        assert!(mb.model().entity_type(officer).unwrap().declared_primary_key().is_some());

        mb.set_base_type(officer, Some(gear), ConfigurationSource::Explicit).unwrap();
        let model = mb.model();
        assert!(model.entity_type(officer).unwrap().declared_keys().is_empty());
        assert_eq!(model.primary_key_properties(officer), model.primary_key_properties(gear));
    }
}
