//! The metadata arena and its read-only query surface.

use crate::annotations::{Annotations, names};
use crate::elements::{
    DeleteBehavior, EntityType, ForeignKey, Index, Key, Navigation, Property,
};
use crate::ids::{EntityTypeId, ForeignKeyId, IndexId, KeyId, NavigationId, PropertyId};
use crate::mapping::{HierarchyMapping, MappingStrategy};
use relmap_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Default name of the shadow discriminator property.
pub const DISCRIMINATOR_PROPERTY: &str = "Discriminator";

/// The metadata graph.
///
/// Elements live in per-kind arenas addressed by ids. Removed elements
/// leave an empty slot so ids stay stable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Model {
    pub(crate) entity_types: Vec<Option<EntityType>>,
    pub(crate) properties: Vec<Option<Property>>,
    pub(crate) keys: Vec<Option<Key>>,
    pub(crate) foreign_keys: Vec<Option<ForeignKey>>,
    pub(crate) navigations: Vec<Option<Navigation>>,
    pub(crate) indexes: Vec<Option<Index>>,
    pub(crate) annotations: Annotations,
    pub(crate) default_strategy: MappingStrategy,
    pub(crate) mappings: BTreeMap<EntityTypeId, HierarchyMapping>,
    pub(crate) finalized: bool,
}

fn slot<T>(arena: &[Option<T>], index: usize) -> Option<&T> {
    arena.get(index).and_then(Option::as_ref)
}

impl Model {
    // ========================================================================
    // Element lookup
    // ========================================================================

    /// Entity type by id.
    pub fn entity_type(&self, id: EntityTypeId) -> Option<&EntityType> {
        slot(&self.entity_types, id.index())
    }

    /// Property by id.
    pub fn property(&self, id: PropertyId) -> Option<&Property> {
        slot(&self.properties, id.index())
    }

    /// Key by id.
    pub fn key(&self, id: KeyId) -> Option<&Key> {
        slot(&self.keys, id.index())
    }

    /// Foreign key by id.
    pub fn foreign_key(&self, id: ForeignKeyId) -> Option<&ForeignKey> {
        slot(&self.foreign_keys, id.index())
    }

    /// Navigation by id.
    pub fn navigation(&self, id: NavigationId) -> Option<&Navigation> {
        slot(&self.navigations, id.index())
    }

    /// Index by id.
    pub fn index(&self, id: IndexId) -> Option<&Index> {
        slot(&self.indexes, id.index())
    }

    /// Model-level annotations.
    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// Whether the model has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// All live entity types in creation order.
    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.entity_types.iter().filter_map(Option::as_ref)
    }

    /// All live foreign keys in creation order.
    pub fn foreign_keys(&self) -> impl Iterator<Item = &ForeignKey> {
        self.foreign_keys.iter().filter_map(Option::as_ref)
    }

    /// All live navigations in creation order.
    pub fn navigations(&self) -> impl Iterator<Item = &Navigation> {
        self.navigations.iter().filter_map(Option::as_ref)
    }

    /// Entity type by name.
    pub fn find_entity_type(&self, name: &str) -> Option<&EntityType> {
        self.entity_types().find(|et| et.name == name)
    }

    /// Entity type name, or `"?"` for a dead id.
    pub fn entity_type_name(&self, id: EntityTypeId) -> &str {
        self.entity_type(id).map_or("?", EntityType::name)
    }

    /// Property name, or `"?"` for a dead id.
    pub fn property_name(&self, id: PropertyId) -> &str {
        self.property(id).map_or("?", Property::name)
    }

    // ========================================================================
    // Hierarchies
    // ========================================================================

    /// Root of the hierarchy containing `id`.
    pub fn root(&self, id: EntityTypeId) -> EntityTypeId {
        let mut current = id;
        // Base links are acyclic; the builder rejects cycles.
        while let Some(base) = self.entity_type(current).and_then(EntityType::base_type) {
            current = base;
        }
        current
    }

    /// `id` and its bases, root first.
    pub fn base_chain(&self, id: EntityTypeId) -> Vec<EntityTypeId> {
        let mut chain = vec![id];
        let mut current = id;
        while let Some(base) = self.entity_type(current).and_then(EntityType::base_type) {
            chain.push(base);
            current = base;
        }
        chain.reverse();
        chain
    }

    /// `id` and all types derived from it, in pre-order.
    pub fn self_and_descendants(&self, id: EntityTypeId) -> Vec<EntityTypeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            if let Some(et) = self.entity_type(current) {
                stack.extend(et.derived_types.iter().rev().copied());
            }
        }
        out
    }

    /// True when `derived` is `base` or inherits from it.
    pub fn is_assignable_from(&self, base: EntityTypeId, derived: EntityTypeId) -> bool {
        self.base_chain(derived).contains(&base)
    }

    /// True when `id` has a base type or derived types.
    pub fn is_in_hierarchy(&self, id: EntityTypeId) -> bool {
        let root = self.root(id);
        self.entity_type(root)
            .is_some_and(|et| !et.derived_types.is_empty())
    }

    /// Mapping strategy of the hierarchy containing `id`.
    pub fn mapping_strategy(&self, id: EntityTypeId) -> MappingStrategy {
        let root = self.root(id);
        self.entity_type(root)
            .and_then(|et| et.annotations.str_value(names::MAPPING_STRATEGY))
            .and_then(MappingStrategy::parse)
            .unwrap_or(self.default_strategy)
    }

    // ========================================================================
    // Members
    // ========================================================================

    /// All properties of `id`, inherited first.
    pub fn properties(&self, id: EntityTypeId) -> Vec<PropertyId> {
        self.base_chain(id)
            .into_iter()
            .filter_map(|t| self.entity_type(t))
            .flat_map(|et| et.properties.iter().copied())
            .collect()
    }

    /// Property declared on `id` itself.
    pub fn find_declared_property(&self, id: EntityTypeId, name: &str) -> Option<PropertyId> {
        self.entity_type(id)?
            .properties
            .iter()
            .copied()
            .find(|p| self.property(*p).is_some_and(|p| p.name == name))
    }

    /// Property declared on `id` or one of its bases.
    pub fn find_property(&self, id: EntityTypeId, name: &str) -> Option<PropertyId> {
        self.base_chain(id)
            .into_iter()
            .rev()
            .find_map(|t| self.find_declared_property(t, name))
    }

    /// Property declared on any type of the hierarchy containing `id`.
    pub fn find_property_in_hierarchy(&self, id: EntityTypeId, name: &str) -> Option<PropertyId> {
        self.self_and_descendants(self.root(id))
            .into_iter()
            .find_map(|t| self.find_declared_property(t, name))
    }

    /// Primary key of `id` (declared on the root).
    pub fn primary_key(&self, id: EntityTypeId) -> Option<&Key> {
        let root = self.root(id);
        self.entity_type(root)
            .and_then(EntityType::declared_primary_key)
            .and_then(|k| self.key(k))
    }

    /// Primary-key properties of `id`.
    pub fn primary_key_properties(&self, id: EntityTypeId) -> Vec<PropertyId> {
        self.primary_key(id)
            .map(|k| k.properties.clone())
            .unwrap_or_default()
    }

    /// All navigations of `id`, inherited first.
    pub fn all_navigations(&self, id: EntityTypeId) -> Vec<NavigationId> {
        self.base_chain(id)
            .into_iter()
            .filter_map(|t| self.entity_type(t))
            .flat_map(|et| et.navigations.iter().copied())
            .collect()
    }

    /// Navigation declared on `id` or one of its bases.
    pub fn find_navigation(&self, id: EntityTypeId, name: &str) -> Option<NavigationId> {
        self.all_navigations(id)
            .into_iter()
            .find(|n| self.navigation(*n).is_some_and(|n| n.name == name))
    }

    /// Foreign keys where `id` or a base is the dependent.
    pub fn all_foreign_keys(&self, id: EntityTypeId) -> Vec<ForeignKeyId> {
        self.base_chain(id)
            .into_iter()
            .filter_map(|t| self.entity_type(t))
            .flat_map(|et| et.foreign_keys.iter().copied())
            .collect()
    }

    /// Foreign keys whose principal is `id` or one of its bases.
    pub fn referencing_foreign_keys(&self, id: EntityTypeId) -> Vec<ForeignKeyId> {
        let chain = self.base_chain(id);
        self.foreign_keys()
            .filter(|fk| chain.contains(&fk.principal_type))
            .map(ForeignKey::id)
            .collect()
    }

    /// A foreign key is required when none of its properties are nullable.
    pub fn is_required(&self, fk: ForeignKeyId) -> bool {
        self.foreign_key(fk).is_some_and(|fk| {
            fk.properties
                .iter()
                .all(|p| self.property(*p).is_some_and(|p| !p.is_nullable()))
        })
    }

    /// Effective delete behavior: configured, else `Cascade` for required and
    /// `ClientSetNull` for optional relationships.
    pub fn delete_behavior(&self, fk: ForeignKeyId) -> DeleteBehavior {
        self.foreign_key(fk)
            .and_then(ForeignKey::configured_delete_behavior)
            .unwrap_or_else(|| {
                if self.is_required(fk) {
                    DeleteBehavior::Cascade
                } else {
                    DeleteBehavior::ClientSetNull
                }
            })
    }

    // ========================================================================
    // Relational mapping
    // ========================================================================

    /// Table the columns declared on `id` live in.
    ///
    /// Single-table hierarchies store every type in the root's table;
    /// table-per-type hierarchies give each type its own.
    pub fn table_name(&self, id: EntityTypeId) -> String {
        let owner = match self.mapping_strategy(id) {
            MappingStrategy::SingleTable => self.root(id),
            MappingStrategy::TablePerType => id,
        };
        self.entity_type(owner).map_or_else(String::new, |et| {
            et.annotations
                .str_value(names::TABLE_NAME)
                .map_or_else(|| et.name.clone(), ToString::to_string)
        })
    }

    /// Table of the type declaring `property`.
    pub fn table_of_property(&self, property: PropertyId) -> String {
        self.property(property)
            .map(|p| self.table_name(p.declaring_type))
            .unwrap_or_default()
    }

    /// Column name of a property.
    pub fn column_name(&self, property: PropertyId) -> String {
        self.property(property).map_or_else(String::new, |p| {
            p.annotations
                .str_value(names::COLUMN_NAME)
                .map_or_else(|| p.name.clone(), ToString::to_string)
        })
    }

    /// Discriminator property of a single-table hierarchy.
    pub fn discriminator_property(&self, id: EntityTypeId) -> Option<PropertyId> {
        if self.mapping_strategy(id) != MappingStrategy::SingleTable {
            return None;
        }
        let root = self.root(id);
        self.find_declared_property(root, DISCRIMINATOR_PROPERTY)
    }

    /// Discriminator value of a type.
    pub fn discriminator_value(&self, id: EntityTypeId) -> Option<&Value> {
        self.entity_type(id)?
            .annotations
            .value(names::DISCRIMINATOR_VALUE)
    }

    /// Mapping of the hierarchy containing `id`; present after finalization.
    pub fn hierarchy_mapping(&self, id: EntityTypeId) -> Option<&HierarchyMapping> {
        self.mappings.get(&self.root(id))
    }

    // ========================================================================
    // Debug view
    // ========================================================================

    /// Human-readable dump of the model.
    pub fn debug_view(&self) -> String {
        let mut out = String::from("Model:\n");
        for et in self.entity_types() {
            let _ = write!(out, "  EntityType: {}", et.name);
            if let Some(base) = et.base_type() {
                let _ = write!(out, " Base: {}", self.entity_type_name(base));
            }
            out.push('\n');
            for p in et.properties.iter().filter_map(|p| self.property(*p)) {
                let _ = write!(out, "    {} ({})", p.name, p.sql_type.sql_name());
                if !p.is_nullable() {
                    out.push_str(" Required");
                }
                if p.is_shadow {
                    out.push_str(" Shadow");
                }
                if p.is_concurrency_token() {
                    out.push_str(" Concurrency");
                }
                if et.primary_key.get().is_some_and(|k| p.keys.contains(&k)) {
                    out.push_str(" PK");
                }
                let _ = writeln!(out, " ValueGenerated.{:?}", p.value_generated());
            }
            for n in et.navigations.iter().filter_map(|n| self.navigation(*n)) {
                let _ = write!(
                    out,
                    "    Navigation: {} -> {} ({:?})",
                    n.name,
                    self.entity_type_name(n.target_type),
                    n.cardinality
                );
                if let Some(inv) = n.inverse.and_then(|i| self.navigation(i)) {
                    let _ = write!(out, " Inverse: {}", inv.name);
                }
                out.push('\n');
            }
            for fk in et.foreign_keys.iter().filter_map(|f| self.foreign_key(*f)) {
                let props: Vec<&str> = fk.properties.iter().map(|p| self.property_name(*p)).collect();
                let _ = writeln!(
                    out,
                    "    ForeignKey: {} -> {} {:?}",
                    props.join(", "),
                    self.entity_type_name(fk.principal_type),
                    self.delete_behavior(fk.id)
                );
            }
            for a in et.annotations.iter() {
                let _ = writeln!(out, "    Annotation: {} = {}", a.name, a.value);
            }
        }
        out
    }
}
