use super::{
    Convention, ConventionContext, ConventionResult, ForeignKeyAddedConvention,
    ModelFinalizingConvention, NavigationAddedConvention, PrimaryKeyChangedConvention,
};
use crate::builder::ModelBuilder;
use crate::elements::Navigation;
use crate::ids::{EntityTypeId, ForeignKeyId, KeyId, NavigationId, PropertyId};
use crate::source::ConfigurationSource;
use relmap_core::SqlType;

/// Binds navigations to foreign keys.
///
/// A navigation whose inverse already has a foreign key adopts it.
/// Otherwise the dependent side is searched for `<Navigation><PrincipalKey>`
/// (reference navigations only), then `<Principal><PrincipalKey>`, then the
/// principal key name itself. A candidate that is exactly the dependent's
/// primary key is skipped. When nothing matches, nullable shadow
/// properties are created. Navigations to a type without a primary key wait
/// until one appears.
#[derive(Debug, Default)]
pub struct ForeignKeyDiscoveryConvention;

impl ForeignKeyDiscoveryConvention {
    fn discover(builder: &mut ModelBuilder, navigation: NavigationId) -> ConventionResult {
        let model = builder.model();
        let Some(nav) = model.navigation(navigation) else {
            return Ok(());
        };
        if nav.foreign_key().is_some() {
            return Ok(());
        }
        let inverse = nav.inverse();
        if let Some(fk) = inverse.and_then(|i| model.navigation(i)).and_then(Navigation::foreign_key) {
            let _ = builder.set_navigation_foreign_key(navigation, fk);
            return Ok(());
        }

        let (dependent, principal, nav_prefix) = if nav.is_collection() {
            (nav.target_type(), nav.declaring_type(), None)
        } else {
            (nav.declaring_type(), nav.target_type(), Some(nav.name().to_string()))
        };
        let Some(principal_key) = model.primary_key(principal) else {
            return Ok(());
        };
        let principal_key_id: KeyId = principal_key.id();
        let key_columns: Vec<(String, SqlType)> = principal_key
            .properties()
            .iter()
            .filter_map(|p| model.property(*p))
            .map(|p| (p.name().to_string(), p.sql_type()))
            .collect();
        let principal_name = model.entity_type_name(principal).to_string();
        let dependent_key = model.primary_key_properties(dependent);

        let mut candidates: Vec<Vec<String>> = Vec::new();
        if let Some(prefix) = &nav_prefix {
            candidates.push(key_columns.iter().map(|(k, _)| format!("{prefix}{k}")).collect());
        }
        candidates.push(key_columns.iter().map(|(k, _)| format!("{principal_name}{k}")).collect());
        if dependent != principal {
            candidates.push(key_columns.iter().map(|(k, _)| k.clone()).collect());
        }

        let matched = candidates.iter().find_map(|names| {
            names
                .iter()
                .zip(&key_columns)
                .map(|(name, (_, ty))| {
                    model.find_property(dependent, name).filter(|p| {
                        model.property(*p).is_some_and(|p| p.sql_type().is_compatible_with(ty))
                    })
                })
                .collect::<Option<Vec<PropertyId>>>()
                .filter(|found| *found != dependent_key)
        });

        let properties = if let Some(found) = matched {
            found
        } else {
            let base_names = candidates.first().cloned().unwrap_or_default();
            let mut created = Vec::with_capacity(base_names.len());
            for (name, (_, ty)) in base_names.iter().zip(&key_columns) {
                let mut unique = name.clone();
                let mut suffix = 1;
                while builder.model().find_property_in_hierarchy(dependent, &unique).is_some() {
                    unique = format!("{name}{suffix}");
                    suffix += 1;
                }
                match builder.add_shadow_property(dependent, &unique, *ty, true, ConfigurationSource::Convention) {
                    Ok(p) => created.push(p),
                    Err(rejection) => {
                        tracing::debug!(
                            target: "relmap::conventions",
                            property = %unique,
                            %rejection,
                            "Shadow foreign key property not created"
                        );
                        return Ok(());
                    }
                }
            }
            created
        };

        match builder.add_foreign_key(dependent, &properties, principal, Some(principal_key_id), ConfigurationSource::Convention) {
            Ok(fk) => {
                let _ = builder.set_navigation_foreign_key(navigation, fk);
                if let Some(inv) = inverse {
                    let _ = builder.set_navigation_foreign_key(inv, fk);
                }
            }
            Err(rejection) => {
                tracing::debug!(
                    target: "relmap::conventions",
                    navigation = %navigation,
                    %rejection,
                    "Foreign key not discovered"
                );
            }
        }
        Ok(())
    }

    fn discover_pending(builder: &mut ModelBuilder, principal: Option<EntityTypeId>) -> ConventionResult {
        let model = builder.model();
        let pending: Vec<NavigationId> = model
            .navigations()
            .filter(|n| n.foreign_key().is_none())
            .filter(|n| {
                principal.is_none_or(|p| {
                    let other = if n.is_collection() { n.declaring_type() } else { n.target_type() };
                    model.root(other) == model.root(p)
                })
            })
            .map(Navigation::id)
            .collect();
        for navigation in pending {
            Self::discover(builder, navigation)?;
        }
        Ok(())
    }
}

impl Convention for ForeignKeyDiscoveryConvention {
    fn name(&self) -> &'static str {
        "ForeignKeyDiscovery"
    }
}

impl NavigationAddedConvention for ForeignKeyDiscoveryConvention {
    fn process_navigation_added(
        &self,
        builder: &mut ModelBuilder,
        navigation: NavigationId,
        _context: &mut ConventionContext,
    ) -> ConventionResult {
        Self::discover(builder, navigation)
    }
}

impl PrimaryKeyChangedConvention for ForeignKeyDiscoveryConvention {
    fn process_primary_key_changed(
        &self,
        builder: &mut ModelBuilder,
        entity_type: EntityTypeId,
        new: Option<KeyId>,
        _old: Option<KeyId>,
        _context: &mut ConventionContext,
    ) -> ConventionResult {
        if new.is_some() {
            Self::discover_pending(builder, Some(entity_type))?;
        }
        Ok(())
    }
}

impl ModelFinalizingConvention for ForeignKeyDiscoveryConvention {
    fn process_model_finalizing(&self, builder: &mut ModelBuilder, _context: &mut ConventionContext) -> ConventionResult {
        Self::discover_pending(builder, None)
    }
}

/// Adds a non-unique index over each foreign key's properties.
#[derive(Debug, Default)]
pub struct ForeignKeyIndexConvention;

impl Convention for ForeignKeyIndexConvention {
    fn name(&self) -> &'static str {
        "ForeignKeyIndex"
    }
}

impl ForeignKeyAddedConvention for ForeignKeyIndexConvention {
    fn process_foreign_key_added(
        &self,
        builder: &mut ModelBuilder,
        foreign_key: ForeignKeyId,
        _context: &mut ConventionContext,
    ) -> ConventionResult {
        let model = builder.model();
        let Some(fk) = model.foreign_key(foreign_key) else {
            return Ok(());
        };
        let dependent = fk.dependent_type();
        let properties = fk.properties().to_vec();
        if model.primary_key_properties(dependent) == properties {
            return Ok(());
        }
        let _ = builder.add_index(dependent, &properties, false, None, ConfigurationSource::Convention);
        Ok(())
    }
}
