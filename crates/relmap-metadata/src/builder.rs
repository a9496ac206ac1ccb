//! The only legal mutation surface of the metadata model.
//!
//! Every mutation returns a [`BuildResult`]: the affected element's id on
//! success, or a [`Rejection`] naming why the mutation was not applied. A
//! rejection leaves the existing configuration in place, so callers may
//! treat it as "keep what is there" instead of failing.
//!
//! Each successful mutation raises a [`ConventionEvent`]; by the time the
//! outermost builder call returns, all convention follow-ups have run.

use crate::annotations::{Annotation, names};
use crate::conventions::{ConventionEvent, ConventionSet};
use crate::elements::{
    Cardinality, DeleteBehavior, EntityType, ForeignKey, Index, Key, Navigation, Property,
    ValueGenerated,
};
use crate::finalized::FinalizedModel;
use crate::ids::{EntityTypeId, ForeignKeyId, IndexId, KeyId, NavigationId, PropertyId};
use crate::mapping::MappingStrategy;
use crate::model::Model;
use crate::source::{ConfigurationSource, Configured};
use relmap_core::{Error, ModelBuildingError, SqlType, Value, is_valid_identifier};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Why a builder mutation was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// An element with that name already exists.
    AlreadyExists {
        /// Element kind.
        kind: &'static str,
        /// Element name.
        name: String,
    },
    /// The referenced element does not exist.
    NotFound {
        /// Element kind.
        kind: &'static str,
        /// Element name or id.
        name: String,
    },
    /// The name is not a valid identifier.
    InvalidName(String),
    /// The value was configured by a higher-precedence source.
    LowerPrecedence {
        /// Recorded source.
        existing: ConfigurationSource,
        /// Source of the rejected write.
        attempted: ConfigurationSource,
    },
    /// A convention removed the element while reacting to its creation.
    ConventionVetoed {
        /// The vetoed element.
        name: String,
    },
    /// The mutation would break a model invariant.
    InvariantViolation(String),
    /// Model building was aborted by an earlier fatal error.
    Aborted(ModelBuildingError),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::AlreadyExists { kind, name } => write!(f, "{kind} '{name}' already exists"),
            Rejection::NotFound { kind, name } => write!(f, "{kind} '{name}' not found"),
            Rejection::InvalidName(name) => write!(f, "'{name}' is not a valid identifier"),
            Rejection::LowerPrecedence {
                existing,
                attempted,
            } => write!(
                f,
                "configured by {existing:?}, cannot be overridden by {attempted:?}"
            ),
            Rejection::ConventionVetoed { name } => write!(f, "'{name}' was removed by a convention"),
            Rejection::InvariantViolation(msg) => f.write_str(msg),
            Rejection::Aborted(e) => write!(f, "model building aborted: {e}"),
        }
    }
}

/// Result of a builder mutation.
pub type BuildResult<T> = Result<T, Rejection>;

/// Options for new models.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelBuilderOptions {
    /// Strategy for hierarchies that do not set `Relational:MappingStrategy`.
    pub default_mapping_strategy: MappingStrategy,
}

impl ModelBuilderOptions {
    /// Set the default mapping strategy.
    pub fn with_default_mapping_strategy(mut self, strategy: MappingStrategy) -> Self {
        self.default_mapping_strategy = strategy;
        self
    }
}

/// What an annotation is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationTarget {
    /// The model itself.
    Model,
    /// An entity type.
    EntityType(EntityTypeId),
    /// A property.
    Property(PropertyId),
}

/// Mutable model under construction.
pub struct ModelBuilder {
    pub(crate) model: Model,
    pub(crate) conventions: Arc<ConventionSet>,
    pub(crate) pending: VecDeque<ConventionEvent>,
    pub(crate) dispatching: bool,
    pub(crate) aborted: Option<ModelBuildingError>,
    pub(crate) dispatched: u64,
    ignored: BTreeSet<String>,
}

impl fmt::Debug for ModelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelBuilder")
            .field("entity_types", &self.model.entity_types().count())
            .field("conventions", &self.conventions.len())
            .field("dispatched", &self.dispatched)
            .field("aborted", &self.aborted.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn check_precedence<T: Clone + PartialEq>(
    configured: &Configured<T>,
    source: ConfigurationSource,
) -> BuildResult<()> {
    match configured.source() {
        Some(existing) if !source.overrides(existing) => Err(Rejection::LowerPrecedence {
            existing,
            attempted: source,
        }),
        _ => Ok(()),
    }
}

fn check_element_source(existing: ConfigurationSource, source: ConfigurationSource) -> BuildResult<()> {
    if source.overrides(existing) {
        Ok(())
    } else {
        Err(Rejection::LowerPrecedence {
            existing,
            attempted: source,
        })
    }
}

impl ModelBuilder {
    /// A builder with the built-in conventions and default options.
    pub fn new() -> Self {
        Self::with_conventions(ConventionSet::with_defaults(), ModelBuilderOptions::default())
    }

    /// A builder with a custom convention set.
    pub fn with_conventions(conventions: ConventionSet, options: ModelBuilderOptions) -> Self {
        let model = Model {
            default_strategy: options.default_mapping_strategy,
            ..Model::default()
        };
        Self {
            model,
            conventions: Arc::new(conventions),
            pending: VecDeque::new(),
            dispatching: false,
            aborted: None,
            dispatched: 0,
            ignored: BTreeSet::new(),
        }
    }

    /// Read access to the model being built.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Number of convention events dispatched so far.
    pub fn dispatched_events(&self) -> u64 {
        self.dispatched
    }

    /// The fatal error that aborted building, if any.
    pub fn abort_error(&self) -> Option<&ModelBuildingError> {
        self.aborted.as_ref()
    }

    fn guard(&self) -> BuildResult<()> {
        match &self.aborted {
            Some(e) => Err(Rejection::Aborted(e.clone())),
            None => Ok(()),
        }
    }

    /// After raising an event, report an abort that happened during dispatch.
    fn settle<T>(&self, value: T) -> BuildResult<T> {
        self.guard()?;
        Ok(value)
    }

    fn entity_ref(&self, id: EntityTypeId) -> BuildResult<&EntityType> {
        self.model.entity_type(id).ok_or_else(|| Rejection::NotFound {
            kind: "entity type",
            name: id.to_string(),
        })
    }

    fn entity_mut(&mut self, id: EntityTypeId) -> BuildResult<&mut EntityType> {
        self.model
            .entity_types
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| Rejection::NotFound {
                kind: "entity type",
                name: id.to_string(),
            })
    }

    fn property_ref(&self, id: PropertyId) -> BuildResult<&Property> {
        self.model.property(id).ok_or_else(|| Rejection::NotFound {
            kind: "property",
            name: id.to_string(),
        })
    }

    fn property_mut(&mut self, id: PropertyId) -> BuildResult<&mut Property> {
        self.model
            .properties
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| Rejection::NotFound {
                kind: "property",
                name: id.to_string(),
            })
    }

    fn navigation_mut(&mut self, id: NavigationId) -> BuildResult<&mut Navigation> {
        self.model
            .navigations
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| Rejection::NotFound {
                kind: "navigation",
                name: id.to_string(),
            })
    }

    fn foreign_key_mut(&mut self, id: ForeignKeyId) -> BuildResult<&mut ForeignKey> {
        self.model
            .foreign_keys
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| Rejection::NotFound {
                kind: "foreign key",
                name: id.to_string(),
            })
    }

    // ========================================================================
    // Entity types
    // ========================================================================

    /// Get or add an entity type with explicit configuration.
    pub fn entity(&mut self, name: &str) -> BuildResult<EntityTypeId> {
        if let Some(et) = self.model.find_entity_type(name) {
            return Ok(et.id);
        }
        self.add_entity_type(name, ConfigurationSource::Explicit)
    }

    /// Add an entity type.
    pub fn add_entity_type(&mut self, name: &str, source: ConfigurationSource) -> BuildResult<EntityTypeId> {
        self.guard()?;
        if !is_valid_identifier(name) {
            return Err(Rejection::InvalidName(name.to_string()));
        }
        if self.model.find_entity_type(name).is_some() {
            return Err(Rejection::AlreadyExists {
                kind: "entity type",
                name: name.to_string(),
            });
        }
        let id = EntityTypeId::from_index(self.model.entity_types.len());
        self.model.entity_types.push(Some(EntityType {
            id,
            name: name.to_string(),
            source,
            base_type: Configured::unset(None),
            derived_types: Vec::new(),
            properties: Vec::new(),
            primary_key: Configured::unset(None),
            keys: Vec::new(),
            foreign_keys: Vec::new(),
            navigations: Vec::new(),
            indexes: Vec::new(),
            annotations: crate::annotations::Annotations::default(),
        }));
        self.raise(ConventionEvent::EntityTypeAdded(id));
        self.guard()?;
        if self.model.entity_type(id).is_none() {
            return Err(Rejection::ConventionVetoed {
                name: name.to_string(),
            });
        }
        Ok(id)
    }

    /// Remove an entity type with no derived types and no incoming references.
    pub fn remove_entity_type(&mut self, id: EntityTypeId, source: ConfigurationSource) -> BuildResult<()> {
        self.guard()?;
        let et = self.entity_ref(id)?;
        check_element_source(et.source, source)?;
        if !et.derived_types.is_empty() {
            return Err(Rejection::InvariantViolation(format!(
                "entity type '{}' has derived types",
                et.name
            )));
        }
        let name = et.name.clone();
        let base = et.base_type();
        let referenced = self.model.foreign_keys().any(|fk| fk.principal_type == id && fk.dependent_type != id)
            || self.model.navigations().any(|n| n.target_type == id && n.declaring_type != id);
        if referenced {
            return Err(Rejection::InvariantViolation(format!(
                "entity type '{name}' is referenced by other types"
            )));
        }
        let et = self.entity_ref(id)?;
        let navigations = et.navigations.clone();
        let foreign_keys = et.foreign_keys.clone();
        let indexes = et.indexes.clone();
        let keys = et.keys.clone();
        let properties = et.properties.clone();
        for n in navigations {
            self.drop_navigation(n);
        }
        for fk in foreign_keys {
            self.drop_foreign_key(fk);
        }
        for ix in indexes {
            self.drop_index(ix);
        }
        for k in keys {
            self.drop_key(k);
        }
        for p in properties {
            if let Some(slot) = self.model.properties.get_mut(p.index()) {
                *slot = None;
            }
        }
        if let Some(base) = base {
            if let Ok(b) = self.entity_mut(base) {
                b.derived_types.retain(|d| *d != id);
            }
        }
        if let Some(slot) = self.model.entity_types.get_mut(id.index()) {
            *slot = None;
        }
        tracing::debug!(target: "relmap::conventions", entity_type = %name, "Entity type removed");
        Ok(())
    }

    /// Set or clear the base type.
    pub fn set_base_type(
        &mut self,
        id: EntityTypeId,
        base: Option<EntityTypeId>,
        source: ConfigurationSource,
    ) -> BuildResult<EntityTypeId> {
        self.guard()?;
        let et = self.entity_ref(id)?;
        check_precedence(&et.base_type, source)?;
        let old = et.base_type();
        if let Some(b) = base {
            self.entity_ref(b)?;
            if self.model.base_chain(b).contains(&id) {
                return Err(Rejection::InvariantViolation(format!(
                    "setting '{}' as base of '{}' creates a cycle",
                    self.model.entity_type_name(b),
                    self.model.entity_type_name(id)
                )));
            }
        }
        let changed = self
            .entity_mut(id)?
            .base_type
            .set(base, source)
            .map_err(|existing| Rejection::LowerPrecedence {
                existing,
                attempted: source,
            })?;
        if !changed {
            return Ok(id);
        }
        if let Some(o) = old {
            if let Ok(o) = self.entity_mut(o) {
                o.derived_types.retain(|d| *d != id);
            }
        }
        if let Some(b) = base {
            self.entity_mut(b)?.derived_types.push(id);
        }
        self.raise(ConventionEvent::BaseTypeChanged {
            entity_type: id,
            new_base: base,
            old_base: old,
        });
        self.settle(id)
    }

    // ========================================================================
    // Properties
    // ========================================================================

    /// Get or add a mapped property with explicit configuration.
    pub fn property(&mut self, entity_type: EntityTypeId, name: &str, sql_type: SqlType) -> BuildResult<PropertyId> {
        if let Some(p) = self.model.find_property(entity_type, name) {
            return Ok(p);
        }
        self.add_property(entity_type, name, sql_type, ConfigurationSource::Explicit)
    }

    /// Add a property backed by a member of the mapped object.
    ///
    /// Character, binary and JSON properties start nullable; other types
    /// start non-nullable.
    pub fn add_property(
        &mut self,
        entity_type: EntityTypeId,
        name: &str,
        sql_type: SqlType,
        source: ConfigurationSource,
    ) -> BuildResult<PropertyId> {
        let nullable = matches!(
            sql_type,
            SqlType::Text | SqlType::VarChar(_) | SqlType::Blob | SqlType::Json
        );
        self.insert_property(entity_type, name, sql_type, false, nullable, source)
    }

    /// Add a shadow property (metadata only, no object member).
    pub fn add_shadow_property(
        &mut self,
        entity_type: EntityTypeId,
        name: &str,
        sql_type: SqlType,
        nullable: bool,
        source: ConfigurationSource,
    ) -> BuildResult<PropertyId> {
        self.insert_property(entity_type, name, sql_type, true, nullable, source)
    }

    fn insert_property(
        &mut self,
        entity_type: EntityTypeId,
        name: &str,
        sql_type: SqlType,
        is_shadow: bool,
        nullable: bool,
        source: ConfigurationSource,
    ) -> BuildResult<PropertyId> {
        self.guard()?;
        if !is_valid_identifier(name) {
            return Err(Rejection::InvalidName(name.to_string()));
        }
        self.entity_ref(entity_type)?;
        if self.model.find_property(entity_type, name).is_some()
            || self.model.find_navigation(entity_type, name).is_some()
        {
            return Err(Rejection::AlreadyExists {
                kind: "member",
                name: format!("{}.{name}", self.model.entity_type_name(entity_type)),
            });
        }
        let id = PropertyId::from_index(self.model.properties.len());
        self.model.properties.push(Some(Property {
            id,
            name: name.to_string(),
            declaring_type: entity_type,
            source,
            sql_type,
            is_shadow,
            nullable: Configured::unset(nullable),
            value_generated: Configured::unset(ValueGenerated::Never),
            concurrency_token: Configured::unset(false),
            keys: Vec::new(),
            foreign_keys: Vec::new(),
            annotations: crate::annotations::Annotations::default(),
        }));
        self.entity_mut(entity_type)?.properties.push(id);
        self.raise(ConventionEvent::PropertyAdded(id));
        self.guard()?;
        if self.model.property(id).is_none() {
            return Err(Rejection::ConventionVetoed {
                name: name.to_string(),
            });
        }
        Ok(id)
    }

    /// Remove a property that is not part of a key or foreign key.
    pub fn remove_property(&mut self, id: PropertyId, source: ConfigurationSource) -> BuildResult<()> {
        self.guard()?;
        let p = self.property_ref(id)?;
        check_element_source(p.source, source)?;
        if !p.keys.is_empty() || !p.foreign_keys.is_empty() {
            return Err(Rejection::InvariantViolation(format!(
                "property '{}' is part of a key or foreign key",
                p.name
            )));
        }
        let declaring = p.declaring_type;
        let name = p.name.clone();
        let indexes: Vec<IndexId> = self
            .model
            .entity_type(declaring)
            .map(|et| {
                et.indexes
                    .iter()
                    .copied()
                    .filter(|ix| self.model.index(*ix).is_some_and(|ix| ix.properties.contains(&id)))
                    .collect()
            })
            .unwrap_or_default();
        for ix in indexes {
            self.drop_index(ix);
        }
        self.entity_mut(declaring)?.properties.retain(|p| *p != id);
        if let Some(slot) = self.model.properties.get_mut(id.index()) {
            *slot = None;
        }
        tracing::debug!(target: "relmap::conventions", property = %name, "Property removed");
        Ok(())
    }

    /// Configure nullability.
    pub fn set_nullable(&mut self, id: PropertyId, nullable: bool, source: ConfigurationSource) -> BuildResult<PropertyId> {
        self.guard()?;
        self.property_mut(id)?
            .nullable
            .set(nullable, source)
            .map_err(|existing| Rejection::LowerPrecedence {
                existing,
                attempted: source,
            })?;
        Ok(id)
    }

    /// Configure store value generation.
    pub fn set_value_generated(
        &mut self,
        id: PropertyId,
        value_generated: ValueGenerated,
        source: ConfigurationSource,
    ) -> BuildResult<PropertyId> {
        self.guard()?;
        self.property_mut(id)?
            .value_generated
            .set(value_generated, source)
            .map_err(|existing| Rejection::LowerPrecedence {
                existing,
                attempted: source,
            })?;
        Ok(id)
    }

    /// Configure whether the property is a concurrency token.
    pub fn set_concurrency_token(&mut self, id: PropertyId, is_token: bool, source: ConfigurationSource) -> BuildResult<PropertyId> {
        self.guard()?;
        self.property_mut(id)?
            .concurrency_token
            .set(is_token, source)
            .map_err(|existing| Rejection::LowerPrecedence {
                existing,
                attempted: source,
            })?;
        Ok(id)
    }

    // ========================================================================
    // Annotations
    // ========================================================================

    /// Set an annotation.
    ///
    /// Setting the same value again is a no-op (no event is raised).
    pub fn set_annotation(
        &mut self,
        target: AnnotationTarget,
        name: &str,
        value: impl Into<Value>,
        source: ConfigurationSource,
    ) -> BuildResult<()> {
        self.guard()?;
        let annotation = Annotation::new(name, value, source);
        let annotations = match target {
            AnnotationTarget::Model => &mut self.model.annotations,
            AnnotationTarget::EntityType(id) => &mut self.entity_mut(id)?.annotations,
            AnnotationTarget::Property(id) => &mut self.property_mut(id)?.annotations,
        };
        let old = annotations.get(name).cloned();
        if let Some(existing) = &old {
            if !source.overrides(existing.source) {
                return Err(Rejection::LowerPrecedence {
                    existing: existing.source,
                    attempted: source,
                });
            }
            if existing.value == annotation.value {
                if existing.source < source {
                    annotations.insert(annotation);
                }
                return Ok(());
            }
        }
        annotations.insert(annotation.clone());
        self.raise_annotation_changed(target, name, Some(annotation), old);
        self.settle(())
    }

    /// Remove an annotation.
    pub fn remove_annotation(&mut self, target: AnnotationTarget, name: &str, source: ConfigurationSource) -> BuildResult<()> {
        self.guard()?;
        let annotations = match target {
            AnnotationTarget::Model => &mut self.model.annotations,
            AnnotationTarget::EntityType(id) => &mut self.entity_mut(id)?.annotations,
            AnnotationTarget::Property(id) => &mut self.property_mut(id)?.annotations,
        };
        let Some(existing) = annotations.get(name) else {
            return Ok(());
        };
        if !source.overrides(existing.source) {
            return Err(Rejection::LowerPrecedence {
                existing: existing.source,
                attempted: source,
            });
        }
        let old = annotations.remove(name);
        self.raise_annotation_changed(target, name, None, old);
        self.settle(())
    }

    fn raise_annotation_changed(
        &mut self,
        target: AnnotationTarget,
        name: &str,
        new: Option<Annotation>,
        old: Option<Annotation>,
    ) {
        match target {
            AnnotationTarget::Model => {}
            AnnotationTarget::EntityType(entity_type) => {
                self.raise(ConventionEvent::EntityTypeAnnotationChanged {
                    entity_type,
                    name: name.to_string(),
                    new,
                    old,
                });
            }
            AnnotationTarget::Property(property) => {
                self.raise(ConventionEvent::PropertyAnnotationChanged {
                    property,
                    name: name.to_string(),
                    new,
                    old,
                });
            }
        }
    }

    /// Map an entity type to a table.
    pub fn to_table(&mut self, id: EntityTypeId, table: &str) -> BuildResult<()> {
        if !is_valid_identifier(table) {
            return Err(Rejection::InvalidName(table.to_string()));
        }
        self.set_annotation(
            AnnotationTarget::EntityType(id),
            names::TABLE_NAME,
            table,
            ConfigurationSource::Explicit,
        )
    }

    /// Map a property to a column.
    pub fn has_column_name(&mut self, id: PropertyId, column: &str) -> BuildResult<()> {
        if !is_valid_identifier(column) {
            return Err(Rejection::InvalidName(column.to_string()));
        }
        self.set_annotation(
            AnnotationTarget::Property(id),
            names::COLUMN_NAME,
            column,
            ConfigurationSource::Explicit,
        )
    }

    /// Choose the mapping strategy of the hierarchy rooted at `root`.
    pub fn use_mapping_strategy(&mut self, root: EntityTypeId, strategy: MappingStrategy) -> BuildResult<()> {
        self.set_annotation(
            AnnotationTarget::EntityType(root),
            names::MAPPING_STRATEGY,
            strategy.as_str(),
            ConfigurationSource::Explicit,
        )
    }

    /// Set the discriminator value of a type.
    pub fn has_discriminator_value(&mut self, id: EntityTypeId, value: impl Into<Value>) -> BuildResult<()> {
        self.set_annotation(
            AnnotationTarget::EntityType(id),
            names::DISCRIMINATOR_VALUE,
            value,
            ConfigurationSource::Explicit,
        )
    }

    // ========================================================================
    // Keys
    // ========================================================================

    /// Set the primary key.
    pub fn set_primary_key(
        &mut self,
        entity_type: EntityTypeId,
        properties: &[PropertyId],
        source: ConfigurationSource,
    ) -> BuildResult<KeyId> {
        self.guard()?;
        let et = self.entity_ref(entity_type)?;
        check_precedence(&et.primary_key, source)?;
        let old = et.declared_primary_key();
        if let Some(existing) = old.and_then(|k| self.model.key(k)) {
            if existing.properties == properties {
                let id = existing.id;
                let _ = self.entity_mut(entity_type)?.primary_key.set(Some(id), source);
                return Ok(id);
            }
            if !existing.referencing_foreign_keys.is_empty() {
                return Err(Rejection::InvariantViolation(format!(
                    "primary key of '{}' is referenced by foreign keys",
                    self.model.entity_type_name(entity_type)
                )));
            }
        }
        let key = self.insert_key(entity_type, properties, source)?;
        if let Some(old) = old {
            self.drop_key(old);
        }
        let _ = self.entity_mut(entity_type)?.primary_key.set(Some(key), source);
        self.raise(ConventionEvent::KeyAdded(key));
        self.raise(ConventionEvent::PrimaryKeyChanged {
            entity_type,
            new: Some(key),
            old,
        });
        self.settle(key)
    }

    /// Set the primary key by property names.
    pub fn has_key(&mut self, entity_type: EntityTypeId, property_names: &[&str]) -> BuildResult<KeyId> {
        let properties = self.resolve_properties(entity_type, property_names)?;
        self.set_primary_key(entity_type, &properties, ConfigurationSource::Explicit)
    }

    /// Add an alternate key.
    pub fn add_key(
        &mut self,
        entity_type: EntityTypeId,
        properties: &[PropertyId],
        source: ConfigurationSource,
    ) -> BuildResult<KeyId> {
        self.guard()?;
        let exists = self.entity_ref(entity_type)?.keys.iter().any(|k| {
            self.model.key(*k).is_some_and(|k| k.properties == properties)
        });
        if exists {
            return Err(Rejection::AlreadyExists {
                kind: "key",
                name: self.describe_properties(properties),
            });
        }
        let key = self.insert_key(entity_type, properties, source)?;
        self.raise(ConventionEvent::KeyAdded(key));
        self.settle(key)
    }

    /// Remove a key not referenced by any foreign key.
    pub fn remove_key(&mut self, key: KeyId, source: ConfigurationSource) -> BuildResult<()> {
        self.guard()?;
        let k = self.model.key(key).ok_or_else(|| Rejection::NotFound {
            kind: "key",
            name: key.to_string(),
        })?;
        check_element_source(k.source, source)?;
        if !k.referencing_foreign_keys.is_empty() {
            return Err(Rejection::InvariantViolation(format!(
                "key {} is referenced by foreign keys",
                self.describe_properties(&k.properties)
            )));
        }
        let declaring = k.declaring_type;
        let was_primary = self
            .model
            .entity_type(declaring)
            .is_some_and(|et| et.declared_primary_key() == Some(key));
        if was_primary {
            check_precedence(&self.entity_ref(declaring)?.primary_key, source)?;
        }
        self.drop_key(key);
        if was_primary {
            self.raise(ConventionEvent::PrimaryKeyChanged {
                entity_type: declaring,
                new: None,
                old: Some(key),
            });
        }
        self.settle(())
    }

    fn insert_key(
        &mut self,
        entity_type: EntityTypeId,
        properties: &[PropertyId],
        source: ConfigurationSource,
    ) -> BuildResult<KeyId> {
        if properties.is_empty() {
            return Err(Rejection::InvariantViolation("a key needs at least one property".to_string()));
        }
        for p in properties {
            let prop = self.property_ref(*p)?;
            if !self.model.is_assignable_from(prop.declaring_type, entity_type) {
                return Err(Rejection::InvariantViolation(format!(
                    "property '{}' is not declared on '{}' or its bases",
                    prop.name,
                    self.model.entity_type_name(entity_type)
                )));
            }
        }
        let id = KeyId::from_index(self.model.keys.len());
        self.model.keys.push(Some(Key {
            id,
            declaring_type: entity_type,
            properties: properties.to_vec(),
            source,
            referencing_foreign_keys: Vec::new(),
        }));
        for p in properties {
            self.property_mut(*p)?.keys.push(id);
        }
        self.entity_mut(entity_type)?.keys.push(id);
        Ok(id)
    }

    pub(crate) fn drop_key(&mut self, key: KeyId) {
        let Some(k) = self.model.keys.get_mut(key.index()).and_then(Option::take) else {
            return;
        };
        for p in &k.properties {
            if let Ok(p) = self.property_mut(*p) {
                p.keys.retain(|x| *x != key);
            }
        }
        if let Ok(et) = self.entity_mut(k.declaring_type) {
            et.keys.retain(|x| *x != key);
            if et.declared_primary_key() == Some(key) {
                et.primary_key = Configured::unset(None);
            }
        }
    }

    // ========================================================================
    // Foreign keys
    // ========================================================================

    /// Add a foreign key. `principal_key` defaults to the principal's primary key.
    pub fn add_foreign_key(
        &mut self,
        dependent: EntityTypeId,
        properties: &[PropertyId],
        principal: EntityTypeId,
        principal_key: Option<KeyId>,
        source: ConfigurationSource,
    ) -> BuildResult<ForeignKeyId> {
        self.guard()?;
        self.entity_ref(dependent)?;
        self.entity_ref(principal)?;
        let principal_key = match principal_key {
            Some(k) => k,
            None => self
                .model
                .primary_key(principal)
                .map(Key::id)
                .ok_or_else(|| Rejection::NotFound {
                    kind: "primary key",
                    name: self.model.entity_type_name(principal).to_string(),
                })?,
        };
        let key = self.model.key(principal_key).ok_or_else(|| Rejection::NotFound {
            kind: "key",
            name: principal_key.to_string(),
        })?;
        if key.properties.len() != properties.len() {
            return Err(Rejection::InvariantViolation(format!(
                "foreign key {} has {} properties but the principal key has {}",
                self.describe_properties(properties),
                properties.len(),
                key.properties.len()
            )));
        }
        for p in properties {
            let prop = self.property_ref(*p)?;
            if !self.model.is_assignable_from(prop.declaring_type, dependent) {
                return Err(Rejection::InvariantViolation(format!(
                    "property '{}' is not declared on '{}' or its bases",
                    prop.name,
                    self.model.entity_type_name(dependent)
                )));
            }
        }
        let duplicate = self.model.foreign_keys().any(|fk| {
            fk.dependent_type == dependent && fk.properties == properties && fk.principal_key == principal_key
        });
        if duplicate {
            return Err(Rejection::AlreadyExists {
                kind: "foreign key",
                name: self.describe_properties(properties),
            });
        }
        let id = ForeignKeyId::from_index(self.model.foreign_keys.len());
        self.model.foreign_keys.push(Some(ForeignKey {
            id,
            dependent_type: dependent,
            properties: properties.to_vec(),
            principal_type: principal,
            principal_key,
            source,
            delete_behavior: Configured::unset(None),
            dependent_to_principal: None,
            principal_to_dependent: None,
        }));
        for p in properties {
            self.property_mut(*p)?.foreign_keys.push(id);
        }
        if let Some(Some(k)) = self.model.keys.get_mut(principal_key.index()) {
            k.referencing_foreign_keys.push(id);
        }
        self.entity_mut(dependent)?.foreign_keys.push(id);
        self.raise(ConventionEvent::ForeignKeyAdded(id));
        self.settle(id)
    }

    /// Remove a foreign key, detaching it from its navigations.
    pub fn remove_foreign_key(&mut self, fk: ForeignKeyId, source: ConfigurationSource) -> BuildResult<()> {
        self.guard()?;
        let existing = self.model.foreign_key(fk).ok_or_else(|| Rejection::NotFound {
            kind: "foreign key",
            name: fk.to_string(),
        })?;
        check_element_source(existing.source, source)?;
        self.drop_foreign_key(fk);
        Ok(())
    }

    /// Configure delete behavior.
    pub fn set_delete_behavior(
        &mut self,
        fk: ForeignKeyId,
        behavior: DeleteBehavior,
        source: ConfigurationSource,
    ) -> BuildResult<ForeignKeyId> {
        self.guard()?;
        self.foreign_key_mut(fk)?
            .delete_behavior
            .set(Some(behavior), source)
            .map_err(|existing| Rejection::LowerPrecedence {
                existing,
                attempted: source,
            })?;
        Ok(fk)
    }

    pub(crate) fn drop_foreign_key(&mut self, fk: ForeignKeyId) {
        let Some(f) = self.model.foreign_keys.get_mut(fk.index()).and_then(Option::take) else {
            return;
        };
        for p in &f.properties {
            if let Ok(p) = self.property_mut(*p) {
                p.foreign_keys.retain(|x| *x != fk);
            }
        }
        if let Some(Some(k)) = self.model.keys.get_mut(f.principal_key.index()) {
            k.referencing_foreign_keys.retain(|x| *x != fk);
        }
        if let Ok(et) = self.entity_mut(f.dependent_type) {
            et.foreign_keys.retain(|x| *x != fk);
        }
        for nav in [f.dependent_to_principal, f.principal_to_dependent].into_iter().flatten() {
            if let Ok(n) = self.navigation_mut(nav) {
                n.foreign_key = None;
            }
        }
    }

    // ========================================================================
    // Navigations
    // ========================================================================

    /// Get or add a navigation with explicit configuration.
    pub fn navigation(
        &mut self,
        entity_type: EntityTypeId,
        name: &str,
        target: EntityTypeId,
        cardinality: Cardinality,
    ) -> BuildResult<NavigationId> {
        if let Some(n) = self.model.find_navigation(entity_type, name) {
            return Ok(n);
        }
        self.add_navigation(entity_type, name, target, cardinality, ConfigurationSource::Explicit)
    }

    /// Add a navigation.
    pub fn add_navigation(
        &mut self,
        entity_type: EntityTypeId,
        name: &str,
        target: EntityTypeId,
        cardinality: Cardinality,
        source: ConfigurationSource,
    ) -> BuildResult<NavigationId> {
        self.guard()?;
        if !is_valid_identifier(name) {
            return Err(Rejection::InvalidName(name.to_string()));
        }
        self.entity_ref(entity_type)?;
        self.entity_ref(target)?;
        if self.model.find_property(entity_type, name).is_some()
            || self.model.find_navigation(entity_type, name).is_some()
        {
            return Err(Rejection::AlreadyExists {
                kind: "member",
                name: format!("{}.{name}", self.model.entity_type_name(entity_type)),
            });
        }
        let id = NavigationId::from_index(self.model.navigations.len());
        self.model.navigations.push(Some(Navigation {
            id,
            name: name.to_string(),
            declaring_type: entity_type,
            target_type: target,
            cardinality,
            source,
            inverse: None,
            foreign_key: None,
        }));
        self.entity_mut(entity_type)?.navigations.push(id);
        self.raise(ConventionEvent::NavigationAdded(id));
        self.settle(id)
    }

    /// Pair two navigations as inverses of each other.
    pub fn set_inverse(&mut self, navigation: NavigationId, inverse: NavigationId) -> BuildResult<NavigationId> {
        self.guard()?;
        let (a, b) = match (self.model.navigation(navigation), self.model.navigation(inverse)) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(Rejection::NotFound {
                    kind: "navigation",
                    name: format!("{navigation}/{inverse}"),
                });
            }
        };
        let compatible = self.model.is_assignable_from(b.target_type, a.declaring_type)
            && self.model.is_assignable_from(a.target_type, b.declaring_type);
        if !compatible || navigation == inverse {
            return Err(Rejection::InvariantViolation(format!(
                "navigations '{}' and '{}' do not point at each other",
                a.name, b.name
            )));
        }
        if a.is_collection() && b.is_collection() {
            return Err(Rejection::InvariantViolation(format!(
                "many-to-many between '{}' and '{}' is not supported",
                a.name, b.name
            )));
        }
        for (this, other) in [(navigation, inverse), (inverse, navigation)] {
            let previous = self.navigation_mut(this)?.inverse.replace(other);
            if let Some(prev) = previous.filter(|p| *p != other) {
                if let Ok(p) = self.navigation_mut(prev) {
                    p.inverse = None;
                }
            }
        }
        Ok(navigation)
    }

    /// Bind a navigation to a foreign key, recording the direction on the key.
    pub fn set_navigation_foreign_key(&mut self, navigation: NavigationId, fk: ForeignKeyId) -> BuildResult<NavigationId> {
        self.guard()?;
        let nav = self.model.navigation(navigation).ok_or_else(|| Rejection::NotFound {
            kind: "navigation",
            name: navigation.to_string(),
        })?;
        let key = self.model.foreign_key(fk).ok_or_else(|| Rejection::NotFound {
            kind: "foreign key",
            name: fk.to_string(),
        })?;
        let to_principal = !nav.is_collection()
            && self.model.is_assignable_from(key.dependent_type, nav.declaring_type)
            && self.model.is_assignable_from(key.principal_type, nav.target_type);
        let to_dependent = self.model.is_assignable_from(key.principal_type, nav.declaring_type)
            && self.model.is_assignable_from(key.dependent_type, nav.target_type);
        let previous = nav.foreign_key;
        if !to_principal && !to_dependent {
            return Err(Rejection::InvariantViolation(format!(
                "navigation '{}' does not follow the foreign key",
                nav.name
            )));
        }
        if let Some(prev) = previous.filter(|p| *p != fk) {
            if let Ok(p) = self.foreign_key_mut(prev) {
                if p.dependent_to_principal == Some(navigation) {
                    p.dependent_to_principal = None;
                }
                if p.principal_to_dependent == Some(navigation) {
                    p.principal_to_dependent = None;
                }
            }
        }
        self.navigation_mut(navigation)?.foreign_key = Some(fk);
        let key = self.foreign_key_mut(fk)?;
        if to_principal {
            key.dependent_to_principal = Some(navigation);
        } else {
            key.principal_to_dependent = Some(navigation);
        }
        Ok(navigation)
    }

    /// Configure the foreign-key properties of a reference navigation
    /// explicitly, replacing any convention-discovered foreign key.
    pub fn has_foreign_key(&mut self, navigation: NavigationId, property_names: &[&str]) -> BuildResult<ForeignKeyId> {
        self.guard()?;
        let nav = self.model.navigation(navigation).ok_or_else(|| Rejection::NotFound {
            kind: "navigation",
            name: navigation.to_string(),
        })?;
        let (dependent, principal) = if nav.is_collection() {
            (nav.target_type, nav.declaring_type)
        } else {
            (nav.declaring_type, nav.target_type)
        };
        let inverse = nav.inverse;
        let previous = nav.foreign_key;
        let properties = self.resolve_properties(dependent, property_names)?;
        if let Some(prev) = previous {
            let prev_fk = self.model.foreign_key(prev);
            if prev_fk.is_some_and(|f| f.properties == properties) {
                return Ok(prev);
            }
            let shadows: Vec<PropertyId> = prev_fk
                .map(|f| {
                    f.properties
                        .iter()
                        .copied()
                        .filter(|p| {
                            !properties.contains(p)
                                && self.model.property(*p).is_some_and(|p| {
                                    p.is_shadow && p.source == ConfigurationSource::Convention
                                })
                        })
                        .collect()
                })
                .unwrap_or_default();
            self.remove_foreign_key(prev, ConfigurationSource::Explicit)?;
            self.remove_convention_indexes_over(&shadows);
            for p in shadows {
                let _ = self.remove_property(p, ConfigurationSource::Explicit);
            }
        }
        let fk = self.add_foreign_key(dependent, &properties, principal, None, ConfigurationSource::Explicit)?;
        self.set_navigation_foreign_key(navigation, fk)?;
        if let Some(inv) = inverse {
            self.set_navigation_foreign_key(inv, fk)?;
        }
        self.settle(fk)
    }

    fn remove_convention_indexes_over(&mut self, properties: &[PropertyId]) {
        let indexes: Vec<IndexId> = self
            .model
            .indexes
            .iter()
            .flatten()
            .filter(|ix| {
                ix.source == ConfigurationSource::Convention
                    && ix.properties.iter().any(|p| properties.contains(p))
            })
            .map(Index::id)
            .collect();
        for ix in indexes {
            self.drop_index(ix);
        }
    }

    pub(crate) fn drop_navigation(&mut self, navigation: NavigationId) {
        let Some(n) = self.model.navigations.get_mut(navigation.index()).and_then(Option::take) else {
            return;
        };
        if let Some(inv) = n.inverse {
            if let Ok(i) = self.navigation_mut(inv) {
                i.inverse = None;
            }
        }
        if let Some(fk) = n.foreign_key {
            if let Ok(f) = self.foreign_key_mut(fk) {
                if f.dependent_to_principal == Some(navigation) {
                    f.dependent_to_principal = None;
                }
                if f.principal_to_dependent == Some(navigation) {
                    f.principal_to_dependent = None;
                }
            }
        }
        if let Ok(et) = self.entity_mut(n.declaring_type) {
            et.navigations.retain(|x| *x != navigation);
        }
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    /// Add an index.
    pub fn add_index(
        &mut self,
        entity_type: EntityTypeId,
        properties: &[PropertyId],
        is_unique: bool,
        name: Option<&str>,
        source: ConfigurationSource,
    ) -> BuildResult<IndexId> {
        self.guard()?;
        if let Some(n) = name {
            if !is_valid_identifier(n) {
                return Err(Rejection::InvalidName(n.to_string()));
            }
        }
        let et = self.entity_ref(entity_type)?;
        if let Some(existing) = et
            .indexes
            .iter()
            .filter_map(|ix| self.model.index(*ix))
            .find(|ix| ix.properties == properties)
        {
            if !source.overrides(existing.source) {
                return Err(Rejection::LowerPrecedence {
                    existing: existing.source,
                    attempted: source,
                });
            }
            let id = existing.id;
            if let Some(Some(ix)) = self.model.indexes.get_mut(id.index()) {
                ix.is_unique = is_unique;
                ix.name = name.map(ToString::to_string);
                ix.source = source;
            }
            return Ok(id);
        }
        let id = IndexId::from_index(self.model.indexes.len());
        self.model.indexes.push(Some(Index {
            id,
            declaring_type: entity_type,
            properties: properties.to_vec(),
            is_unique,
            name: name.map(ToString::to_string),
            source,
        }));
        self.entity_mut(entity_type)?.indexes.push(id);
        Ok(id)
    }

    pub(crate) fn drop_index(&mut self, index: IndexId) {
        let Some(ix) = self.model.indexes.get_mut(index.index()).and_then(Option::take) else {
            return;
        };
        if let Ok(et) = self.entity_mut(ix.declaring_type) {
            et.indexes.retain(|x| *x != index);
        }
    }

    // ========================================================================
    // Ignored members
    // ========================================================================

    /// Exclude an entity type (`"Name"`) or member (`"Type.Member"`) from the
    /// model. Existing elements are removed; future additions are vetoed.
    pub fn ignore(&mut self, name: &str) -> BuildResult<()> {
        self.guard()?;
        self.ignored.insert(name.to_string());
        if let Some((type_name, member)) = name.split_once('.') {
            let Some(et) = self.model.find_entity_type(type_name).map(EntityType::id) else {
                return Ok(());
            };
            if let Some(p) = self.model.find_declared_property(et, member) {
                return self.remove_property(p, ConfigurationSource::Explicit);
            }
            if let Some(n) = self.model.find_navigation(et, member) {
                if let Some(fk) = self.model.navigation(n).and_then(Navigation::foreign_key) {
                    let only_nav = self.model.foreign_key(fk).is_some_and(|f| {
                        f.source == ConfigurationSource::Convention
                            && f.dependent_to_principal.is_none_or(|x| x == n)
                            && f.principal_to_dependent.is_none_or(|x| x == n)
                    });
                    if only_nav {
                        self.drop_foreign_key(fk);
                    }
                }
                self.drop_navigation(n);
            }
            Ok(())
        } else {
            match self.model.find_entity_type(name).map(EntityType::id) {
                Some(et) => self.remove_entity_type(et, ConfigurationSource::Explicit),
                None => Ok(()),
            }
        }
    }

    /// Whether a name was ignored.
    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignored.contains(name)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Resolve property names on `entity_type` or its bases.
    pub fn resolve_properties(&self, entity_type: EntityTypeId, property_names: &[&str]) -> BuildResult<Vec<PropertyId>> {
        property_names
            .iter()
            .map(|n| {
                self.model
                    .find_property(entity_type, n)
                    .ok_or_else(|| Rejection::NotFound {
                        kind: "property",
                        name: format!("{}.{n}", self.model.entity_type_name(entity_type)),
                    })
            })
            .collect()
    }

    fn describe_properties(&self, properties: &[PropertyId]) -> String {
        let names: Vec<&str> = properties.iter().map(|p| self.model.property_name(*p)).collect();
        format!("{{{}}}", names.join(", "))
    }

    // ========================================================================
    // Finalization
    // ========================================================================

    /// Run finalizing conventions, validate and freeze the model.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn finalize(mut self) -> Result<FinalizedModel, Error> {
        if let Some(e) = self.aborted.take() {
            return Err(Error::ModelBuilding(e));
        }
        self.raise(ConventionEvent::ModelFinalizing);
        if let Some(e) = self.aborted.take() {
            return Err(Error::ModelBuilding(e));
        }
        crate::validation::validate(&self.model)?;
        let roots: Vec<EntityTypeId> = self
            .model
            .entity_types()
            .filter(|et| et.base_type().is_none())
            .map(EntityType::id)
            .collect();
        for root in roots {
            let mapping = crate::mapping::HierarchyMapping::build(&self.model, root)?;
            self.model.mappings.insert(root, mapping);
        }
        self.model.finalized = true;
        tracing::info!(
            target: "relmap::conventions",
            entity_types = self.model.entity_types().count(),
            events = self.dispatched,
            "Model finalized"
        );
        Ok(FinalizedModel::new(self.model))
    }
}
