use super::{
    Convention, ConventionContext, ConventionResult, EntityTypeAddedConvention,
    PropertyAddedConvention,
};
use crate::builder::ModelBuilder;
use crate::ids::{EntityTypeId, PropertyId};
use crate::source::ConfigurationSource;

/// Removes entity types and properties registered with
/// [`ModelBuilder::ignore`] as soon as they are added.
#[derive(Debug, Default)]
pub struct IgnoredMembersConvention;

impl Convention for IgnoredMembersConvention {
    fn name(&self) -> &'static str {
        "IgnoredMembers"
    }
}

impl EntityTypeAddedConvention for IgnoredMembersConvention {
    fn process_entity_type_added(
        &self,
        builder: &mut ModelBuilder,
        entity_type: EntityTypeId,
        context: &mut ConventionContext,
    ) -> ConventionResult {
        let name = builder.model().entity_type_name(entity_type).to_string();
        if builder.is_ignored(&name)
            && builder
                .remove_entity_type(entity_type, ConfigurationSource::Explicit)
                .is_ok()
        {
            context.stop_processing();
        }
        Ok(())
    }
}

impl PropertyAddedConvention for IgnoredMembersConvention {
    fn process_property_added(
        &self,
        builder: &mut ModelBuilder,
        property: PropertyId,
        context: &mut ConventionContext,
    ) -> ConventionResult {
        let model = builder.model();
        let Some(p) = model.property(property) else {
            return Ok(());
        };
        let qualified = format!("{}.{}", model.entity_type_name(p.declaring_type()), p.name());
        if builder.is_ignored(&qualified)
            && builder
                .remove_property(property, ConfigurationSource::Explicit)
                .is_ok()
        {
            context.stop_processing();
        }
        Ok(())
    }
}
