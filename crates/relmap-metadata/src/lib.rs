//! Conventions-driven metadata model for relmap.
//!
//! `relmap-metadata` owns the description of what is mapped: entity types,
//! properties, keys, foreign keys, navigations, indexes and annotations.
//!
//! # Building a model
//!
//! [`ModelBuilder`] is the only mutation surface. Each mutation raises an
//! event that the registered conventions react to (key discovery,
//! discriminators, foreign-key discovery, inverse pairing, data
//! annotations). Events are processed in the order they are raised; by the
//! time a builder call returns the model reflects every follow-up.
//!
//! Rejected mutations return a [`Rejection`] instead of failing, so the
//! caller can keep the existing configuration. Precedence between sources is
//! the total order [`ConfigurationSource`]: `Convention < DataAnnotation <
//! Explicit`.
//!
//! # Finalization
//!
//! [`ModelBuilder::finalize`] validates the model, selects a
//! [`HierarchyMapping`] per hierarchy and returns a [`FinalizedModel`], an
//! immutable `Arc`-backed snapshot that is `Send + Sync`.
//!
//! ```
//! use relmap_core::SqlType;
//! use relmap_metadata::{Cardinality, ModelBuilder};
//!
//! let mut mb = ModelBuilder::new();
//! let squad = mb.entity("Squad").unwrap();
//! mb.property(squad, "Id", SqlType::Integer).unwrap();
//! mb.property(squad, "Name", SqlType::Text).unwrap();
//! let gear = mb.entity("Gear").unwrap();
//! mb.property(gear, "Id", SqlType::Integer).unwrap();
//! mb.navigation(gear, "Squad", squad, Cardinality::One).unwrap();
//!
//! let model = mb.finalize().unwrap();
//! let gear = model.entity_type_id("Gear").unwrap();
//! assert!(model.find_property(gear, "SquadId").is_some());
//! ```

pub mod annotations;
pub mod builder;
pub mod conventions;
pub mod elements;
pub mod finalized;
pub mod ids;
pub mod mapping;
pub mod model;
pub mod source;
mod validation;

pub use annotations::{Annotation, Annotations};
pub use builder::{AnnotationTarget, BuildResult, ModelBuilder, ModelBuilderOptions, Rejection};
pub use conventions::{ConventionContext, ConventionEvent, ConventionSet};
pub use elements::{
    Cardinality, DeleteBehavior, EntityType, ForeignKey, Index, Key, Navigation, Property,
    ValueGenerated,
};
pub use finalized::FinalizedModel;
pub use ids::{EntityTypeId, ForeignKeyId, IndexId, KeyId, NavigationId, PropertyId};
pub use mapping::{HierarchyMapping, MappingStrategy};
pub use model::{DISCRIMINATOR_PROPERTY, Model};
pub use source::{ConfigurationSource, Configured};

#[cfg(test)]
mod test_model;
