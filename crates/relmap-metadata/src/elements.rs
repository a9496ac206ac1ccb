//! Metadata elements stored in the model arena.
//!
//! Fields are crate-private: the only legal mutation surface is
//! [`ModelBuilder`](crate::builder::ModelBuilder). Readers go through the
//! accessor methods here and the lookup methods on [`Model`](crate::model::Model).

use crate::annotations::Annotations;
use crate::ids::{EntityTypeId, ForeignKeyId, IndexId, KeyId, NavigationId, PropertyId};
use crate::source::{ConfigurationSource, Configured};
use relmap_core::SqlType;
use serde::{Deserialize, Serialize};

/// When the store generates a value for a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueGenerated {
    /// The application always supplies the value.
    #[default]
    Never,
    /// Generated when the row is inserted.
    OnAdd,
    /// Generated on insert and on every update.
    OnAddOrUpdate,
}

/// Navigation multiplicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    /// Reference navigation (at most one target).
    One,
    /// Collection navigation.
    Many,
}

/// What happens to dependents when their principal is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeleteBehavior {
    /// The store rejects the delete while dependents exist.
    Restrict,
    /// Dependents are deleted too.
    Cascade,
    /// Dependents' foreign keys are set to NULL, in the store and the tracker.
    SetNull,
    /// Dependents' foreign keys are set to NULL by the tracker only.
    ClientSetNull,
}

/// An entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityType {
    pub(crate) id: EntityTypeId,
    pub(crate) name: String,
    pub(crate) source: ConfigurationSource,
    pub(crate) base_type: Configured<Option<EntityTypeId>>,
    pub(crate) derived_types: Vec<EntityTypeId>,
    pub(crate) properties: Vec<PropertyId>,
    pub(crate) primary_key: Configured<Option<KeyId>>,
    pub(crate) keys: Vec<KeyId>,
    pub(crate) foreign_keys: Vec<ForeignKeyId>,
    pub(crate) navigations: Vec<NavigationId>,
    pub(crate) indexes: Vec<IndexId>,
    pub(crate) annotations: Annotations,
}

impl EntityType {
    /// Handle of this entity type.
    pub fn id(&self) -> EntityTypeId {
        self.id
    }

    /// Type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Who added the type.
    pub fn source(&self) -> ConfigurationSource {
        self.source
    }

    /// Direct base type.
    pub fn base_type(&self) -> Option<EntityTypeId> {
        *self.base_type.get()
    }

    /// Direct derived types.
    pub fn derived_types(&self) -> &[EntityTypeId] {
        &self.derived_types
    }

    /// Properties declared on this type (not inherited ones).
    pub fn declared_properties(&self) -> &[PropertyId] {
        &self.properties
    }

    /// Primary key declared on this type. Derived types have none.
    pub fn declared_primary_key(&self) -> Option<KeyId> {
        *self.primary_key.get()
    }

    /// Keys declared on this type, primary included.
    pub fn declared_keys(&self) -> &[KeyId] {
        &self.keys
    }

    /// Foreign keys where this type is the dependent.
    pub fn declared_foreign_keys(&self) -> &[ForeignKeyId] {
        &self.foreign_keys
    }

    /// Navigations declared on this type.
    pub fn declared_navigations(&self) -> &[NavigationId] {
        &self.navigations
    }

    /// Indexes declared on this type.
    pub fn declared_indexes(&self) -> &[IndexId] {
        &self.indexes
    }

    /// Annotations.
    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }
}

/// A scalar property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub(crate) id: PropertyId,
    pub(crate) name: String,
    pub(crate) declaring_type: EntityTypeId,
    pub(crate) source: ConfigurationSource,
    pub(crate) sql_type: SqlType,
    pub(crate) is_shadow: bool,
    pub(crate) nullable: Configured<bool>,
    pub(crate) value_generated: Configured<ValueGenerated>,
    pub(crate) concurrency_token: Configured<bool>,
    pub(crate) keys: Vec<KeyId>,
    pub(crate) foreign_keys: Vec<ForeignKeyId>,
    pub(crate) annotations: Annotations,
}

impl Property {
    /// Handle of this property.
    pub fn id(&self) -> PropertyId {
        self.id
    }

    /// Property name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type that declares the property.
    pub fn declaring_type(&self) -> EntityTypeId {
        self.declaring_type
    }

    /// Who added the property.
    pub fn source(&self) -> ConfigurationSource {
        self.source
    }

    /// Store type.
    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    /// True for properties that exist only in metadata.
    pub fn is_shadow(&self) -> bool {
        self.is_shadow
    }

    /// Whether NULL is allowed.
    pub fn is_nullable(&self) -> bool {
        *self.nullable.get()
    }

    /// Store value generation.
    pub fn value_generated(&self) -> ValueGenerated {
        *self.value_generated.get()
    }

    /// Whether the property participates in optimistic concurrency checks.
    pub fn is_concurrency_token(&self) -> bool {
        *self.concurrency_token.get()
    }

    /// Keys containing this property.
    pub fn containing_keys(&self) -> &[KeyId] {
        &self.keys
    }

    /// Foreign keys containing this property.
    pub fn containing_foreign_keys(&self) -> &[ForeignKeyId] {
        &self.foreign_keys
    }

    /// Annotations.
    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub(crate) fn nullable_source(&self) -> Option<ConfigurationSource> {
        self.nullable.source()
    }

    pub(crate) fn value_generated_source(&self) -> Option<ConfigurationSource> {
        self.value_generated.source()
    }
}

/// A primary or alternate key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    pub(crate) id: KeyId,
    pub(crate) declaring_type: EntityTypeId,
    pub(crate) properties: Vec<PropertyId>,
    pub(crate) source: ConfigurationSource,
    pub(crate) referencing_foreign_keys: Vec<ForeignKeyId>,
}

impl Key {
    /// Handle of this key.
    pub fn id(&self) -> KeyId {
        self.id
    }

    /// Declaring type.
    pub fn declaring_type(&self) -> EntityTypeId {
        self.declaring_type
    }

    /// Key properties in order.
    pub fn properties(&self) -> &[PropertyId] {
        &self.properties
    }

    /// Who added the key.
    pub fn source(&self) -> ConfigurationSource {
        self.source
    }

    /// Foreign keys that reference this key.
    pub fn referencing_foreign_keys(&self) -> &[ForeignKeyId] {
        &self.referencing_foreign_keys
    }
}

/// A foreign key from a dependent type to a principal key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub(crate) id: ForeignKeyId,
    pub(crate) dependent_type: EntityTypeId,
    pub(crate) properties: Vec<PropertyId>,
    pub(crate) principal_type: EntityTypeId,
    pub(crate) principal_key: KeyId,
    pub(crate) source: ConfigurationSource,
    pub(crate) delete_behavior: Configured<Option<DeleteBehavior>>,
    pub(crate) dependent_to_principal: Option<NavigationId>,
    pub(crate) principal_to_dependent: Option<NavigationId>,
}

impl ForeignKey {
    /// Handle of this foreign key.
    pub fn id(&self) -> ForeignKeyId {
        self.id
    }

    /// The type holding the foreign-key properties.
    pub fn dependent_type(&self) -> EntityTypeId {
        self.dependent_type
    }

    /// Foreign-key properties, aligned with the principal key's properties.
    pub fn properties(&self) -> &[PropertyId] {
        &self.properties
    }

    /// The referenced type.
    pub fn principal_type(&self) -> EntityTypeId {
        self.principal_type
    }

    /// The referenced key.
    pub fn principal_key(&self) -> KeyId {
        self.principal_key
    }

    /// Who added the foreign key.
    pub fn source(&self) -> ConfigurationSource {
        self.source
    }

    /// Navigation from dependent to principal.
    pub fn dependent_to_principal(&self) -> Option<NavigationId> {
        self.dependent_to_principal
    }

    /// Navigation from principal to dependents.
    pub fn principal_to_dependent(&self) -> Option<NavigationId> {
        self.principal_to_dependent
    }

    pub(crate) fn configured_delete_behavior(&self) -> Option<DeleteBehavior> {
        *self.delete_behavior.get()
    }
}

/// A navigation between entity types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Navigation {
    pub(crate) id: NavigationId,
    pub(crate) name: String,
    pub(crate) declaring_type: EntityTypeId,
    pub(crate) target_type: EntityTypeId,
    pub(crate) cardinality: Cardinality,
    pub(crate) source: ConfigurationSource,
    pub(crate) inverse: Option<NavigationId>,
    pub(crate) foreign_key: Option<ForeignKeyId>,
}

impl Navigation {
    /// Handle of this navigation.
    pub fn id(&self) -> NavigationId {
        self.id
    }

    /// Navigation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type declaring the navigation.
    pub fn declaring_type(&self) -> EntityTypeId {
        self.declaring_type
    }

    /// Type the navigation points to.
    pub fn target_type(&self) -> EntityTypeId {
        self.target_type
    }

    /// Reference or collection.
    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    /// True for collection navigations.
    pub fn is_collection(&self) -> bool {
        self.cardinality == Cardinality::Many
    }

    /// Who added the navigation.
    pub fn source(&self) -> ConfigurationSource {
        self.source
    }

    /// Paired navigation on the target type.
    pub fn inverse(&self) -> Option<NavigationId> {
        self.inverse
    }

    /// Foreign key backing this navigation.
    pub fn foreign_key(&self) -> Option<ForeignKeyId> {
        self.foreign_key
    }

    /// True when the navigation goes from the dependent to the principal.
    pub fn points_to_principal(&self, fk: &ForeignKey) -> bool {
        fk.dependent_to_principal == Some(self.id)
    }
}

/// An index over properties of one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    pub(crate) id: IndexId,
    pub(crate) declaring_type: EntityTypeId,
    pub(crate) properties: Vec<PropertyId>,
    pub(crate) is_unique: bool,
    pub(crate) name: Option<String>,
    pub(crate) source: ConfigurationSource,
}

impl Index {
    /// Handle of this index.
    pub fn id(&self) -> IndexId {
        self.id
    }

    /// Declaring type.
    pub fn declaring_type(&self) -> EntityTypeId {
        self.declaring_type
    }

    /// Indexed properties in order.
    pub fn properties(&self) -> &[PropertyId] {
        &self.properties
    }

    /// Whether the index enforces uniqueness.
    pub fn is_unique(&self) -> bool {
        self.is_unique
    }

    /// Explicit index name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Who added the index.
    pub fn source(&self) -> ConfigurationSource {
        self.source
    }
}
