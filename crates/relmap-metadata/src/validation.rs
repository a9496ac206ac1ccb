//! Model validation run at finalization.

use crate::mapping::MappingStrategy;
use crate::model::Model;
use crate::ids::EntityTypeId;
use relmap_core::{ModelBuildingError, SqlType, Value};
use std::collections::BTreeMap;

/// Check the invariants a finalized model must satisfy.
pub(crate) fn validate(model: &Model) -> Result<(), ModelBuildingError> {
    validate_keys(model)?;
    validate_foreign_keys(model)?;
    validate_navigations(model)?;
    validate_discriminators(model)?;
    validate_columns(model)?;
    Ok(())
}

fn validate_keys(model: &Model) -> Result<(), ModelBuildingError> {
    for et in model.entity_types() {
        if et.base_type().is_some() {
            if !et.declared_keys().is_empty() {
                return Err(ModelBuildingError::new(
                    "a derived type cannot declare keys; keys are defined on the root of the hierarchy",
                )
                .with_entity_type(et.name()));
            }
            continue;
        }
        let Some(pk) = model.primary_key(et.id()) else {
            return Err(ModelBuildingError::new("entity type requires a primary key").with_entity_type(et.name()));
        };
        for p in pk.properties() {
            if model.property(*p).is_some_and(|p| p.is_nullable()) {
                return Err(ModelBuildingError::new("key property cannot be nullable")
                    .with_entity_type(et.name())
                    .with_property(model.property_name(*p)));
            }
        }
    }
    Ok(())
}

fn validate_foreign_keys(model: &Model) -> Result<(), ModelBuildingError> {
    for fk in model.foreign_keys() {
        let dependent = model.entity_type_name(fk.dependent_type());
        let Some(key) = model.key(fk.principal_key()) else {
            return Err(ModelBuildingError::new("foreign key references a removed key").with_entity_type(dependent));
        };
        if key.properties().len() != fk.properties().len() {
            return Err(ModelBuildingError::new(format!(
                "foreign key has {} properties but the principal key of '{}' has {}",
                fk.properties().len(),
                model.entity_type_name(fk.principal_type()),
                key.properties().len()
            ))
            .with_entity_type(dependent));
        }
        for (dep, principal) in fk.properties().iter().zip(key.properties()) {
            let (Some(dep), Some(principal)) = (model.property(*dep), model.property(*principal)) else {
                continue;
            };
            if !dep.sql_type().is_compatible_with(&principal.sql_type()) {
                return Err(ModelBuildingError::new(format!(
                    "foreign key property type {} is incompatible with principal key type {}",
                    dep.sql_type().sql_name(),
                    principal.sql_type().sql_name()
                ))
                .with_entity_type(dependent)
                .with_property(dep.name()));
            }
        }
    }
    Ok(())
}

fn validate_navigations(model: &Model) -> Result<(), ModelBuildingError> {
    for nav in model.navigations() {
        if nav.foreign_key().is_none() {
            return Err(ModelBuildingError::new(format!(
                "navigation '{}' to '{}' has no foreign key",
                nav.name(),
                model.entity_type_name(nav.target_type())
            ))
            .with_entity_type(model.entity_type_name(nav.declaring_type())));
        }
    }
    Ok(())
}

fn validate_discriminators(model: &Model) -> Result<(), ModelBuildingError> {
    for root in model.entity_types().filter(|et| et.base_type().is_none()) {
        let types = model.self_and_descendants(root.id());
        if types.len() < 2 || model.mapping_strategy(root.id()) != MappingStrategy::SingleTable {
            continue;
        }
        if model.discriminator_property(root.id()).is_none() {
            return Err(ModelBuildingError::new("single-table hierarchy has no discriminator property")
                .with_entity_type(root.name()));
        }
        let mut seen: Vec<(EntityTypeId, &Value)> = Vec::with_capacity(types.len());
        for t in types {
            let Some(value) = model.discriminator_value(t) else {
                return Err(ModelBuildingError::new("entity type has no discriminator value")
                    .with_entity_type(model.entity_type_name(t)));
            };
            if let Some((other, _)) = seen.iter().find(|(_, v)| v.loosely_equals(value)) {
                return Err(ModelBuildingError::new(format!(
                    "discriminator value {value} is used by both '{}' and '{}'",
                    model.entity_type_name(*other),
                    model.entity_type_name(t)
                ))
                .with_entity_type(model.entity_type_name(root.id())));
            }
            seen.push((t, value));
        }
    }
    Ok(())
}

fn validate_columns(model: &Model) -> Result<(), ModelBuildingError> {
    let mut columns: BTreeMap<(String, String), (String, SqlType)> = BTreeMap::new();
    for et in model.entity_types() {
        for p in et.declared_properties().iter().filter_map(|p| model.property(*p)) {
            let slot = (model.table_name(et.id()), model.column_name(p.id()));
            let owner = format!("{}.{}", et.name(), p.name());
            match columns.get(&slot) {
                Some((other, ty)) if !ty.is_compatible_with(&p.sql_type()) => {
                    return Err(ModelBuildingError::new(format!(
                        "'{owner}' and '{other}' both map to column '{}.{}' with incompatible types {} and {}",
                        slot.0,
                        slot.1,
                        p.sql_type().sql_name(),
                        ty.sql_name()
                    ))
                    .with_entity_type(et.name())
                    .with_property(p.name()));
                }
                Some(_) => {}
                None => {
                    columns.insert(slot, (owner, p.sql_type()));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::test_model::gears_model;
    use crate::*;
    use relmap_core::{Error, SqlType};

    #[test]
    fn test_missing_primary_key_fails_finalization() {
        let mut mb = ModelBuilder::new();
        let log = mb.entity("LogEntry").unwrap();
        mb.property(log, "Message", SqlType::Text).unwrap();
        let Err(Error::ModelBuilding(e)) = mb.finalize() else {
            panic!("expected model building error");
        };
        assert_eq!(e.entity_type.as_deref(), Some("LogEntry"));
    }

    #[test]
    fn test_duplicate_discriminator_values_fail_finalization() {
        let mut mb = gears_model();
        let gear = mb.model().find_entity_type("Gear").unwrap().id();
        let officer = mb.model().find_entity_type("Officer").unwrap().id();
        mb.has_discriminator_value(gear, "G").unwrap();
        mb.has_discriminator_value(officer, "G").unwrap();
        let err = mb.finalize().unwrap_err();
        assert!(err.to_string().contains("discriminator value"));
    }

    #[test]
    fn test_incompatible_shared_column_fails_finalization() {
        let mut mb = gears_model();
        let officer = mb.model().find_entity_type("Officer").unwrap().id();
        let gear = mb.model().find_entity_type("Gear").unwrap().id();
        let rank = mb.property(gear, "Rank", SqlType::Integer).unwrap();
        let title = mb.property(officer, "Title", SqlType::Text).unwrap();
        mb.has_column_name(rank, "Extra").unwrap();
        mb.has_column_name(title, "Extra").unwrap();
        let err = mb.finalize().unwrap_err();
        assert!(err.to_string().contains("incompatible types"));
    }
}
