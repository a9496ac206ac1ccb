use super::{
    BaseTypeChangedConvention, Convention, ConventionContext, ConventionResult,
    ForeignKeyAddedConvention, KeyAddedConvention, ModelFinalizingConvention,
    PrimaryKeyChangedConvention, PropertyAddedConvention,
};
use crate::builder::ModelBuilder;
use crate::elements::{EntityType, ValueGenerated};
use crate::ids::{EntityTypeId, ForeignKeyId, KeyId, PropertyId};
use crate::source::ConfigurationSource;
use relmap_core::SqlType;

/// Discovers `Id` or `<EntityName>Id` as the primary key of root types.
#[derive(Debug, Default)]
pub struct KeyDiscoveryConvention;

impl KeyDiscoveryConvention {
    fn discover(builder: &mut ModelBuilder, entity_type: EntityTypeId) {
        let model = builder.model();
        let Some(et) = model.entity_type(entity_type) else {
            return;
        };
        if et.base_type().is_some() {
            return;
        }
        let current = et.declared_primary_key().and_then(|k| model.key(k));
        if current.is_some_and(|k| k.source() > ConfigurationSource::Convention) {
            return;
        }
        let typed_id = format!("{}Id", et.name());
        let find = |wanted: &str| {
            et.declared_properties()
                .iter()
                .copied()
                .find(|p| model.property(*p).is_some_and(|p| p.name().eq_ignore_ascii_case(wanted)))
        };
        let Some(candidate) = find("Id").or_else(|| find(&typed_id)) else {
            return;
        };
        if current.is_some_and(|k| k.properties() == [candidate]) {
            return;
        }
        if let Err(rejection) = builder.set_primary_key(entity_type, &[candidate], ConfigurationSource::Convention) {
            tracing::debug!(
                target: "relmap::conventions",
                entity_type = builder.model().entity_type_name(entity_type),
                %rejection,
                "Key discovery skipped"
            );
        }
    }
}

impl Convention for KeyDiscoveryConvention {
    fn name(&self) -> &'static str {
        "KeyDiscovery"
    }
}

impl PropertyAddedConvention for KeyDiscoveryConvention {
    fn process_property_added(
        &self,
        builder: &mut ModelBuilder,
        property: PropertyId,
        _context: &mut ConventionContext,
    ) -> ConventionResult {
        if let Some(et) = builder.model().property(property).map(|p| p.declaring_type()) {
            Self::discover(builder, et);
        }
        Ok(())
    }
}

impl BaseTypeChangedConvention for KeyDiscoveryConvention {
    fn process_base_type_changed(
        &self,
        builder: &mut ModelBuilder,
        entity_type: EntityTypeId,
        new_base: Option<EntityTypeId>,
        _old_base: Option<EntityTypeId>,
        _context: &mut ConventionContext,
    ) -> ConventionResult {
        if new_base.is_none() {
            Self::discover(builder, entity_type);
        }
        Ok(())
    }
}

impl ModelFinalizingConvention for KeyDiscoveryConvention {
    fn process_model_finalizing(&self, builder: &mut ModelBuilder, _context: &mut ConventionContext) -> ConventionResult {
        let roots: Vec<EntityTypeId> = builder
            .model()
            .entity_types()
            .filter(|et| et.base_type().is_none() && et.declared_primary_key().is_none())
            .map(EntityType::id)
            .collect();
        for root in roots {
            Self::discover(builder, root);
        }
        Ok(())
    }
}

/// Makes key properties non-nullable.
#[derive(Debug, Default)]
pub struct NonNullableKeyConvention;

impl Convention for NonNullableKeyConvention {
    fn name(&self) -> &'static str {
        "NonNullableKey"
    }
}

impl KeyAddedConvention for NonNullableKeyConvention {
    fn process_key_added(&self, builder: &mut ModelBuilder, key: KeyId, _context: &mut ConventionContext) -> ConventionResult {
        let properties = builder
            .model()
            .key(key)
            .map(|k| k.properties().to_vec())
            .unwrap_or_default();
        for p in properties {
            // An explicit nullable key is reported by validation.
            let _ = builder.set_nullable(p, false, ConfigurationSource::Convention);
        }
        Ok(())
    }
}

/// Marks single-column integer or uuid primary keys as generated on add.
#[derive(Debug, Default)]
pub struct ValueGenerationConvention;

impl ValueGenerationConvention {
    fn is_convention_generated(builder: &ModelBuilder, property: PropertyId) -> bool {
        builder.model().property(property).is_some_and(|p| {
            p.value_generated() == ValueGenerated::OnAdd
                && p.value_generated_source() == Some(ConfigurationSource::Convention)
        })
    }
}

impl Convention for ValueGenerationConvention {
    fn name(&self) -> &'static str {
        "ValueGeneration"
    }
}

impl PrimaryKeyChangedConvention for ValueGenerationConvention {
    fn process_primary_key_changed(
        &self,
        builder: &mut ModelBuilder,
        entity_type: EntityTypeId,
        new: Option<KeyId>,
        _old: Option<KeyId>,
        _context: &mut ConventionContext,
    ) -> ConventionResult {
        let model = builder.model();
        let key_properties = new
            .and_then(|k| model.key(k))
            .map(|k| k.properties().to_vec())
            .unwrap_or_default();
        let stale: Vec<PropertyId> = model
            .entity_type(entity_type)
            .map(|et| et.declared_properties().to_vec())
            .unwrap_or_default()
            .into_iter()
            .filter(|p| !key_properties.contains(p) && Self::is_convention_generated(builder, *p))
            .collect();
        for p in stale {
            let _ = builder.set_value_generated(p, ValueGenerated::Never, ConfigurationSource::Convention);
        }
        if let [single] = key_properties[..] {
            let generated = builder.model().property(single).is_some_and(|p| {
                let ty = p.sql_type();
                (ty.is_integer() || ty == SqlType::Uuid) && p.containing_foreign_keys().is_empty()
            });
            if generated {
                let _ = builder.set_value_generated(single, ValueGenerated::OnAdd, ConfigurationSource::Convention);
            }
        }
        Ok(())
    }
}

impl ForeignKeyAddedConvention for ValueGenerationConvention {
    fn process_foreign_key_added(
        &self,
        builder: &mut ModelBuilder,
        foreign_key: ForeignKeyId,
        _context: &mut ConventionContext,
    ) -> ConventionResult {
        let properties = builder
            .model()
            .foreign_key(foreign_key)
            .map(|fk| fk.properties().to_vec())
            .unwrap_or_default();
        for p in properties {
            if Self::is_convention_generated(builder, p) {
                let _ = builder.set_value_generated(p, ValueGenerated::Never, ConfigurationSource::Convention);
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
    fn test_key_discovery_and_value_generation() {
        let mut mb = ModelBuilder::new();
        let squad = mb.entity("Squad").unwrap();
        let id = mb.property(squad, "SquadId", SqlType::Integer).unwrap();
        let model = mb.model();
        assert_eq!(model.primary_key_properties(squad), vec![id]);
        assert_eq!(model.property(id).unwrap().value_generated(), ValueGenerated::OnAdd);

        let plain = mb.property(squad, "Id", SqlType::Integer).unwrap();
        let model = mb.model();
        assert_eq!(model.primary_key_properties(squad), vec![plain]);
        assert_eq!(model.property(id).unwrap().value_generated(), ValueGenerated::Never);
    }
}
