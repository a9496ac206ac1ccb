//! Conventions and the dispatcher that drives them.
//!
//! A convention implements one or more narrow capability traits, one per
//! kind of model mutation it reacts to. The [`ConventionSet`] keeps one
//! handler table per event kind; handlers run in registration order.
//!
//! Events are processed strictly in the order they are raised. A mutation
//! made by a convention while an event is being dispatched only enqueues the
//! follow-up event; the dispatcher drains the queue before the outermost
//! builder call returns.

mod base_type;
mod data_annotations;
mod discriminator;
mod dispatcher;
mod foreign_keys;
mod ignored;
mod inverse;
mod keys;

pub use base_type::BaseTypeKeyConvention;
pub use data_annotations::DataAnnotationConvention;
pub use discriminator::DiscriminatorConvention;
pub use foreign_keys::{ForeignKeyDiscoveryConvention, ForeignKeyIndexConvention};
pub use ignored::IgnoredMembersConvention;
pub use inverse::InverseNavigationConvention;
pub use keys::{KeyDiscoveryConvention, NonNullableKeyConvention, ValueGenerationConvention};

use crate::annotations::Annotation;
use crate::builder::ModelBuilder;
use crate::ids::{EntityTypeId, ForeignKeyId, KeyId, NavigationId, PropertyId};
use relmap_core::ModelBuildingError;
use std::fmt;
use std::sync::Arc;

/// Outcome of a convention handler. An error aborts model building.
pub type ConventionResult = Result<(), ModelBuildingError>;

/// A model mutation that conventions may react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ConventionEvent {
    /// An entity type was added.
    EntityTypeAdded(EntityTypeId),
    /// An entity type's base type changed.
    BaseTypeChanged {
        /// The type whose base changed.
        entity_type: EntityTypeId,
        /// New base.
        new_base: Option<EntityTypeId>,
        /// Previous base.
        old_base: Option<EntityTypeId>,
    },
    /// An annotation was added, changed or removed on an entity type.
    EntityTypeAnnotationChanged {
        /// Annotated type.
        entity_type: EntityTypeId,
        /// Annotation name.
        name: String,
        /// New annotation (`None` when removed).
        new: Option<Annotation>,
        /// Previous annotation (`None` when added).
        old: Option<Annotation>,
    },
    /// A property was added.
    PropertyAdded(PropertyId),
    /// An annotation was added, changed or removed on a property.
    PropertyAnnotationChanged {
        /// Annotated property.
        property: PropertyId,
        /// Annotation name.
        name: String,
        /// New annotation (`None` when removed).
        new: Option<Annotation>,
        /// Previous annotation (`None` when added).
        old: Option<Annotation>,
    },
    /// A key was added.
    KeyAdded(KeyId),
    /// An entity type's primary key changed.
    PrimaryKeyChanged {
        /// The type whose key changed.
        entity_type: EntityTypeId,
        /// New primary key.
        new: Option<KeyId>,
        /// Previous primary key (already removed from the model).
        old: Option<KeyId>,
    },
    /// A foreign key was added.
    ForeignKeyAdded(ForeignKeyId),
    /// A navigation was added.
    NavigationAdded(NavigationId),
    /// The model is about to be validated and frozen.
    ModelFinalizing,
}

impl ConventionEvent {
    /// Short event kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ConventionEvent::EntityTypeAdded(_) => "EntityTypeAdded",
            ConventionEvent::BaseTypeChanged { .. } => "BaseTypeChanged",
            ConventionEvent::EntityTypeAnnotationChanged { .. } => "EntityTypeAnnotationChanged",
            ConventionEvent::PropertyAdded(_) => "PropertyAdded",
            ConventionEvent::PropertyAnnotationChanged { .. } => "PropertyAnnotationChanged",
            ConventionEvent::KeyAdded(_) => "KeyAdded",
            ConventionEvent::PrimaryKeyChanged { .. } => "PrimaryKeyChanged",
            ConventionEvent::ForeignKeyAdded(_) => "ForeignKeyAdded",
            ConventionEvent::NavigationAdded(_) => "NavigationAdded",
            ConventionEvent::ModelFinalizing => "ModelFinalizing",
        }
    }
}

/// Per-event state shared by the handlers of one event.
#[derive(Debug, Default)]
pub struct ConventionContext {
    stopped: bool,
}

impl ConventionContext {
    /// Skip the remaining handlers for this event.
    pub fn stop_processing(&mut self) {
        self.stopped = true;
    }

    /// Whether a handler stopped processing.
    pub fn should_stop(&self) -> bool {
        self.stopped
    }
}

/// Common supertrait of every convention.
pub trait Convention: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &'static str;
}

/// Reacts to entity types being added.
pub trait EntityTypeAddedConvention: Convention {
    /// Handle the event.
    fn process_entity_type_added(
        &self,
        builder: &mut ModelBuilder,
        entity_type: EntityTypeId,
        context: &mut ConventionContext,
    ) -> ConventionResult;
}

/// Reacts to base type changes.
pub trait BaseTypeChangedConvention: Convention {
    /// Handle the event.
    fn process_base_type_changed(
        &self,
        builder: &mut ModelBuilder,
        entity_type: EntityTypeId,
        new_base: Option<EntityTypeId>,
        old_base: Option<EntityTypeId>,
        context: &mut ConventionContext,
    ) -> ConventionResult;
}

/// Reacts to entity type annotation changes.
pub trait EntityTypeAnnotationChangedConvention: Convention {
    /// Handle the event.
    fn process_entity_type_annotation_changed(
        &self,
        builder: &mut ModelBuilder,
        entity_type: EntityTypeId,
        name: &str,
        new: Option<&Annotation>,
        old: Option<&Annotation>,
        context: &mut ConventionContext,
    ) -> ConventionResult;
}

/// Reacts to properties being added.
pub trait PropertyAddedConvention: Convention {
    /// Handle the event.
    fn process_property_added(
        &self,
        builder: &mut ModelBuilder,
        property: PropertyId,
        context: &mut ConventionContext,
    ) -> ConventionResult;
}

/// Reacts to property annotation changes.
///
/// Must be idempotent: receiving the same (name, value) twice is a no-op.
pub trait PropertyAnnotationChangedConvention: Convention {
    /// Handle the event.
    fn process_property_annotation_changed(
        &self,
        builder: &mut ModelBuilder,
        property: PropertyId,
        name: &str,
        new: Option<&Annotation>,
        old: Option<&Annotation>,
        context: &mut ConventionContext,
    ) -> ConventionResult;
}

/// Reacts to keys being added.
pub trait KeyAddedConvention: Convention {
    /// Handle the event.
    fn process_key_added(
        &self,
        builder: &mut ModelBuilder,
        key: KeyId,
        context: &mut ConventionContext,
    ) -> ConventionResult;
}

/// Reacts to primary key changes.
pub trait PrimaryKeyChangedConvention: Convention {
    /// Handle the event.
    fn process_primary_key_changed(
        &self,
        builder: &mut ModelBuilder,
        entity_type: EntityTypeId,
        new: Option<KeyId>,
        old: Option<KeyId>,
        context: &mut ConventionContext,
    ) -> ConventionResult;
}

/// Reacts to foreign keys being added.
pub trait ForeignKeyAddedConvention: Convention {
    /// Handle the event.
    fn process_foreign_key_added(
        &self,
        builder: &mut ModelBuilder,
        foreign_key: ForeignKeyId,
        context: &mut ConventionContext,
    ) -> ConventionResult;
}

/// Reacts to navigations being added.
pub trait NavigationAddedConvention: Convention {
    /// Handle the event.
    fn process_navigation_added(
        &self,
        builder: &mut ModelBuilder,
        navigation: NavigationId,
        context: &mut ConventionContext,
    ) -> ConventionResult;
}

/// Runs once before validation.
pub trait ModelFinalizingConvention: Convention {
    /// Handle the event.
    fn process_model_finalizing(
        &self,
        builder: &mut ModelBuilder,
        context: &mut ConventionContext,
    ) -> ConventionResult;
}

/// Handler tables, one per event kind, in registration order.
#[derive(Clone, Default)]
pub struct ConventionSet {
    /// Entity type added.
    pub entity_type_added: Vec<Arc<dyn EntityTypeAddedConvention>>,
    /// Base type changed.
    pub base_type_changed: Vec<Arc<dyn BaseTypeChangedConvention>>,
    /// Entity type annotation changed.
    pub entity_type_annotation_changed: Vec<Arc<dyn EntityTypeAnnotationChangedConvention>>,
    /// Property added.
    pub property_added: Vec<Arc<dyn PropertyAddedConvention>>,
    /// Property annotation changed.
    pub property_annotation_changed: Vec<Arc<dyn PropertyAnnotationChangedConvention>>,
    /// Key added.
    pub key_added: Vec<Arc<dyn KeyAddedConvention>>,
    /// Primary key changed.
    pub primary_key_changed: Vec<Arc<dyn PrimaryKeyChangedConvention>>,
    /// Foreign key added.
    pub foreign_key_added: Vec<Arc<dyn ForeignKeyAddedConvention>>,
    /// Navigation added.
    pub navigation_added: Vec<Arc<dyn NavigationAddedConvention>>,
    /// Model finalizing.
    pub model_finalizing: Vec<Arc<dyn ModelFinalizingConvention>>,
}

impl ConventionSet {
    /// A set with no conventions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in conventions.
    pub fn with_defaults() -> Self {
        let ignored = Arc::new(IgnoredMembersConvention);
        let key_discovery = Arc::new(KeyDiscoveryConvention);
        let non_nullable = Arc::new(NonNullableKeyConvention);
        let value_generation = Arc::new(ValueGenerationConvention);
        let discriminator = Arc::new(DiscriminatorConvention);
        let base_type = Arc::new(BaseTypeKeyConvention);
        let fk_discovery = Arc::new(ForeignKeyDiscoveryConvention);
        let fk_index = Arc::new(ForeignKeyIndexConvention);
        let inverse = Arc::new(InverseNavigationConvention);
        let data_annotations = Arc::new(DataAnnotationConvention);

        let mut set = Self::empty();
        set.entity_type_added.push(ignored.clone());
        set.property_added.push(ignored);
        set.property_added.push(key_discovery.clone());
        set.base_type_changed.push(base_type);
        set.base_type_changed.push(key_discovery.clone());
        set.base_type_changed.push(discriminator.clone());
        set.entity_type_annotation_changed.push(discriminator.clone());
        set.property_annotation_changed.push(data_annotations);
        set.key_added.push(non_nullable);
        set.primary_key_changed.push(value_generation.clone());
        set.primary_key_changed.push(fk_discovery.clone());
        set.foreign_key_added.push(value_generation);
        set.foreign_key_added.push(fk_index);
        set.navigation_added.push(inverse);
        set.navigation_added.push(fk_discovery.clone());
        set.model_finalizing.push(key_discovery);
        set.model_finalizing.push(fk_discovery);
        set.model_finalizing.push(discriminator);
        set
    }

    /// Total number of registered handlers.
    pub fn len(&self) -> usize {
        self.entity_type_added.len()
            + self.base_type_changed.len()
            + self.entity_type_annotation_changed.len()
            + self.property_added.len()
            + self.property_annotation_changed.len()
            + self.key_added.len()
            + self.primary_key_changed.len()
            + self.foreign_key_added.len()
            + self.navigation_added.len()
            + self.model_finalizing.len()
    }

    /// True when no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ConventionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn names<T: Convention + ?Sized>(list: &[Arc<T>]) -> Vec<&'static str> {
            list.iter().map(|c| c.name()).collect()
        }
        f.debug_struct("ConventionSet")
            .field("entity_type_added", &names(&self.entity_type_added))
            .field("base_type_changed", &names(&self.base_type_changed))
            .field(
                "entity_type_annotation_changed",
                &names(&self.entity_type_annotation_changed),
            )
            .field("property_added", &names(&self.property_added))
            .field(
                "property_annotation_changed",
                &names(&self.property_annotation_changed),
            )
            .field("key_added", &names(&self.key_added))
            .field("primary_key_changed", &names(&self.primary_key_changed))
            .field("foreign_key_added", &names(&self.foreign_key_added))
            .field("navigation_added", &names(&self.navigation_added))
            .field("model_finalizing", &names(&self.model_finalizing))
            .finish()
    }
}
