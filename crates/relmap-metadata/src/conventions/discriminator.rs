use super::{
    BaseTypeChangedConvention, Convention, ConventionContext, ConventionResult,
    EntityTypeAnnotationChangedConvention, ModelFinalizingConvention,
};
use crate::annotations::{Annotation, names};
use crate::builder::{AnnotationTarget, ModelBuilder};
use crate::elements::EntityType;
use crate::ids::{EntityTypeId, PropertyId};
use crate::mapping::MappingStrategy;
use crate::model::DISCRIMINATOR_PROPERTY;
use crate::source::ConfigurationSource;
use relmap_core::SqlType;

/// Keeps the shadow discriminator property and per-type discriminator
/// values in step with the shape of single-table hierarchies.
///
/// A hierarchy with more than one type mapped to a single table gets a
/// non-nullable `Discriminator` text column on its root, and every type
/// without an explicit value is tagged with its own name. Switching the
/// hierarchy to table-per-type, or dissolving it, removes both again.
#[derive(Debug, Default)]
pub struct DiscriminatorConvention;

impl DiscriminatorConvention {
    fn convention_discriminator(builder: &ModelBuilder, entity_type: EntityTypeId) -> Option<PropertyId> {
        let model = builder.model();
        model
            .find_declared_property(entity_type, DISCRIMINATOR_PROPERTY)
            .filter(|p| {
                model
                    .property(*p)
                    .is_some_and(|p| p.is_shadow() && p.source() == ConfigurationSource::Convention)
            })
    }

    fn sync_hierarchy(builder: &mut ModelBuilder, root: EntityTypeId) -> ConventionResult {
        let model = builder.model();
        if model.entity_type(root).is_none() {
            return Ok(());
        }
        let types = model.self_and_descendants(root);
        let needs_discriminator =
            model.mapping_strategy(root) == MappingStrategy::SingleTable && types.len() > 1;

        if needs_discriminator {
            if model.find_property(root, DISCRIMINATOR_PROPERTY).is_none() {
                builder
                    .add_shadow_property(root, DISCRIMINATOR_PROPERTY, SqlType::Text, false, ConfigurationSource::Convention)
                    .map_err(|r| {
                        relmap_core::ModelBuildingError::new(format!("cannot add discriminator: {r}"))
                            .with_entity_type(builder.model().entity_type_name(root))
                    })?;
            }
            for t in types {
                let Some(et) = builder.model().entity_type(t) else {
                    continue;
                };
                if et.annotations().get(names::DISCRIMINATOR_VALUE).is_some() {
                    continue;
                }
                let value = et.name().to_string();
                let _ = builder.set_annotation(
                    AnnotationTarget::EntityType(t),
                    names::DISCRIMINATOR_VALUE,
                    value,
                    ConfigurationSource::Convention,
                );
            }
        } else {
            if let Some(p) = Self::convention_discriminator(builder, root) {
                let _ = builder.remove_property(p, ConfigurationSource::Convention);
            }
            for t in types {
                let by_convention = builder
                    .model()
                    .entity_type(t)
                    .and_then(|et| et.annotations().get(names::DISCRIMINATOR_VALUE))
                    .is_some_and(|a| a.source == ConfigurationSource::Convention);
                if by_convention {
                    let _ = builder.remove_annotation(
                        AnnotationTarget::EntityType(t),
                        names::DISCRIMINATOR_VALUE,
                        ConfigurationSource::Convention,
                    );
                }
            }
        }
        Ok(())
    }
}

impl Convention for DiscriminatorConvention {
    fn name(&self) -> &'static str {
        "Discriminator"
    }
}

impl BaseTypeChangedConvention for DiscriminatorConvention {
    fn process_base_type_changed(
        &self,
        builder: &mut ModelBuilder,
        entity_type: EntityTypeId,
        new_base: Option<EntityTypeId>,
        old_base: Option<EntityTypeId>,
        _context: &mut ConventionContext,
    ) -> ConventionResult {
        if new_base.is_some() {
            if let Some(p) = Self::convention_discriminator(builder, entity_type) {
                let _ = builder.remove_property(p, ConfigurationSource::Convention);
            }
        }
        let root = builder.model().root(entity_type);
        Self::sync_hierarchy(builder, root)?;
        if let Some(old) = old_base {
            let old_root = builder.model().root(old);
            if old_root != root {
                Self::sync_hierarchy(builder, old_root)?;
            }
        }
        Ok(())
    }
}

impl EntityTypeAnnotationChangedConvention for DiscriminatorConvention {
    fn process_entity_type_annotation_changed(
        &self,
        builder: &mut ModelBuilder,
        entity_type: EntityTypeId,
        name: &str,
        _new: Option<&Annotation>,
        _old: Option<&Annotation>,
        _context: &mut ConventionContext,
    ) -> ConventionResult {
        if name != names::MAPPING_STRATEGY {
            return Ok(());
        }
        let root = builder.model().root(entity_type);
        Self::sync_hierarchy(builder, root)
    }
}

impl ModelFinalizingConvention for DiscriminatorConvention {
    fn process_model_finalizing(&self, builder: &mut ModelBuilder, _context: &mut ConventionContext) -> ConventionResult {
        let roots: Vec<EntityTypeId> = builder
            .model()
            .entity_types()
            .filter(|et| et.base_type().is_none())
            .map(EntityType::id)
            .collect();
        for root in roots {
            Self::sync_hierarchy(builder, root)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_model::gears_model;
    use crate::*;
    use relmap_core::Value;

    #[test]
    fn test_discriminator_follows_hierarchy_shape() {
        let mut mb = gears_model();
        let gear = mb.model().find_entity_type("Gear").unwrap().id();
        let officer = mb.model().find_entity_type("Officer").unwrap().id();

        let disc = mb.model().discriminator_property(gear).unwrap();
        assert!(mb.model().property(disc).unwrap().is_shadow());
        assert_eq!(mb.model().discriminator_value(gear), Some(&Value::from("Gear")));
        assert_eq!(mb.model().discriminator_value(officer), Some(&Value::from("Officer")));

        mb.use_mapping_strategy(gear, MappingStrategy::TablePerType).unwrap();
        assert!(mb.model().find_property(gear, DISCRIMINATOR_PROPERTY).is_none());
        assert!(mb.model().discriminator_value(officer).is_none());

        mb.use_mapping_strategy(gear, MappingStrategy::SingleTable).unwrap();
        mb.set_base_type(officer, None, ConfigurationSource::Explicit).unwrap();
        assert!(mb.model().find_property(gear, DISCRIMINATOR_PROPERTY).is_none());
    }

    #[test]
    fn test_explicit_discriminator_value_survives() {
        let mut mb = gears_model();
        let officer = mb.model().find_entity_type("Officer").unwrap().id();
        mb.has_discriminator_value(officer, "O").unwrap();
        let model = mb.finalize().unwrap();
        let gear = model.entity_type_id("Gear").unwrap();
        let mapping = model.hierarchy_mapping(gear).unwrap();
        assert_eq!(mapping.entity_type_for_discriminator(&Value::from("O")), Some(officer));
        assert_eq!(mapping.entity_type_for_discriminator(&Value::from("Officer")), None);
    }
}
