use super::{Convention, ConventionContext, ConventionResult, PropertyAnnotationChangedConvention};
use crate::annotations::{Annotation, names};
use crate::builder::ModelBuilder;
use crate::elements::ValueGenerated;
use crate::ids::PropertyId;
use crate::source::ConfigurationSource;
use relmap_core::{ModelBuildingError, SqlType, Value};

/// Applies `Required`, `ConcurrencyCheck` and `DatabaseGenerated`
/// annotations to property facets. Removing an annotation restores the
/// facet's default.
#[derive(Debug, Default)]
pub struct DataAnnotationConvention;

fn flag(annotation: Option<&Annotation>) -> bool {
    annotation.is_some_and(|a| match &a.value {
        Value::Bool(b) => *b,
        Value::Null => false,
        _ => true,
    })
}

impl Convention for DataAnnotationConvention {
    fn name(&self) -> &'static str {
        "DataAnnotation"
    }
}

impl PropertyAnnotationChangedConvention for DataAnnotationConvention {
    fn process_property_annotation_changed(
        &self,
        builder: &mut ModelBuilder,
        property: PropertyId,
        name: &str,
        new: Option<&Annotation>,
        _old: Option<&Annotation>,
        _context: &mut ConventionContext,
    ) -> ConventionResult {
        let source = ConfigurationSource::DataAnnotation;
        let result = match name {
            names::REQUIRED => {
                let required = flag(new);
                let default_nullable = builder.model().property(property).is_some_and(|p| {
                    p.containing_keys().is_empty()
                        && matches!(
                            p.sql_type(),
                            SqlType::Text | SqlType::VarChar(_) | SqlType::Blob | SqlType::Json
                        )
                });
                builder.set_nullable(property, if required { false } else { default_nullable }, source)
            }
            names::CONCURRENCY_CHECK => builder.set_concurrency_token(property, flag(new), source),
            names::DATABASE_GENERATED => {
                let generated = match new.and_then(|a| a.value.as_str()) {
                    None | Some("None") => ValueGenerated::Never,
                    Some("Identity") => ValueGenerated::OnAdd,
                    Some("Computed") => ValueGenerated::OnAddOrUpdate,
                    Some(other) => {
                        return Err(ModelBuildingError::new(format!(
                            "unknown DatabaseGenerated option '{other}'"
                        ))
                        .with_entity_type(
                            builder
                                .model()
                                .property(property)
                                .map(|p| builder.model().entity_type_name(p.declaring_type()))
                                .unwrap_or("?"),
                        )
                        .with_property(builder.model().property_name(property)));
                    }
                };
                builder.set_value_generated(property, generated, source)
            }
            _ => return Ok(()),
        };
        if let Err(rejection) = result {
            tracing::debug!(
                target: "relmap::conventions",
                property = builder.model().property_name(property),
                annotation = name,
                %rejection,
                "Data annotation overridden by explicit configuration"
            );
        }
        Ok(())
    }
}
