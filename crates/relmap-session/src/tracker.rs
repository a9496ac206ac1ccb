//! Change tracking: the identity map, entity states and change detection.
//!
//! Every tracked entity is an [`EntityEntry`] addressed by an [`EntryId`].
//! The identity map guarantees at most one entry per `(root type, key)`
//! pair; a second instance with a tracked identity is an
//! [`IdentityConflictError`].
//!
//! Change detection is pull-based: user code edits the current values of an
//! entry and [`ChangeTracker::detect_changes`] compares them with the
//! original values, flipping per-property modified flags and moving entries
//! between `Unchanged` and `Modified`.

use relmap_core::{DynamicEntity, EntryInfo, Error, IdentityConflictError, Result, SqlType, Value};
use relmap_metadata::{
    DeleteBehavior, EntityTypeId, FinalizedModel, ForeignKeyId, PropertyId, ValueGenerated,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

/// First temporary key value handed out; counts upwards from here so
/// temporary values stay far away from store-generated ones.
const TEMPORARY_KEY_BASE: i64 = i32::MIN as i64 + 1000;

/// Handle to a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry#{}", self.0)
    }
}

/// State of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Not tracked.
    Detached,
    /// Loaded or saved, no pending changes.
    Unchanged,
    /// Marked for DELETE on save.
    Deleted,
    /// At least one property differs from its original value.
    Modified,
    /// New, needs INSERT on save.
    Added,
}

impl EntityState {
    /// True for states that produce a command on save.
    pub const fn is_pending(self) -> bool {
        matches!(self, EntityState::Added | EntityState::Modified | EntityState::Deleted)
    }
}

/// A state transition, delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub entry: EntryId,
    pub entity_type: EntityTypeId,
    pub old: EntityState,
    pub new: EntityState,
}

/// One tracked entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEntry {
    id: EntryId,
    entity_type: EntityTypeId,
    state: EntityState,
    current: DynamicEntity,
    original: DynamicEntity,
    modified: BTreeSet<PropertyId>,
    temporary: BTreeSet<PropertyId>,
    /// Identity under which the entry is registered.
    identity: Vec<Value>,
}

impl EntityEntry {
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// The concrete entity type.
    pub fn entity_type(&self) -> EntityTypeId {
        self.entity_type
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Current property values.
    pub fn entity(&self) -> &DynamicEntity {
        &self.current
    }

    /// Values as loaded, or as of the last successful save.
    pub fn original(&self) -> &DynamicEntity {
        &self.original
    }

    pub fn current_value(&self, property: &str) -> Value {
        self.current.get_or_null(property)
    }

    pub fn original_value(&self, property: &str) -> Value {
        self.original.get_or_null(property)
    }

    /// Whether the last change detection found `property` modified.
    pub fn is_modified(&self, property: PropertyId) -> bool {
        self.modified.contains(&property)
    }

    pub fn modified_properties(&self) -> impl Iterator<Item = PropertyId> + '_ {
        self.modified.iter().copied()
    }

    /// Whether `property` holds a temporary value awaiting the store.
    pub fn has_temporary_value(&self, property: PropertyId) -> bool {
        self.temporary.contains(&property)
    }
}

/// The identity map and entries: everything that a failed save restores.
#[derive(Debug, Clone)]
pub(crate) struct TrackerState {
    entries: BTreeMap<EntryId, EntityEntry>,
    identity_map: HashMap<(EntityTypeId, Vec<Value>), EntryId>,
    next_id: u64,
    next_temporary: i64,
}

impl Default for TrackerState {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            identity_map: HashMap::new(),
            next_id: 1,
            next_temporary: TEMPORARY_KEY_BASE,
        }
    }
}

type Observer = Box<dyn FnMut(&StateChange) + Send>;

/// Identity map and state machine for one unit of work.
///
/// Not synchronized: one session owns one tracker.
pub struct ChangeTracker {
    model: FinalizedModel,
    state: TrackerState,
    observers: Vec<Observer>,
    sensitive_data_logging: bool,
}

impl fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("entries", &self.state.entries.len())
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl ChangeTracker {
    pub fn new(model: FinalizedModel) -> Self {
        Self {
            model,
            state: TrackerState::default(),
            observers: Vec::new(),
            sensitive_data_logging: false,
        }
    }

    /// Include key values in tracking logs.
    pub fn set_sensitive_data_logging(&mut self, enabled: bool) {
        self.sensitive_data_logging = enabled;
    }

    pub fn model(&self) -> &FinalizedModel {
        &self.model
    }

    /// Register an observer for every state transition.
    pub fn subscribe(&mut self, observer: impl FnMut(&StateChange) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn entry(&self, id: EntryId) -> Option<&EntityEntry> {
        self.state.entries.get(&id)
    }

    /// Entries in the order they started being tracked.
    pub fn entries(&self) -> impl Iterator<Item = &EntityEntry> {
        self.state.entries.values()
    }

    pub fn len(&self) -> usize {
        self.state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.is_empty()
    }

    /// State of `id`; `Detached` once the entry is gone.
    pub fn state(&self, id: EntryId) -> EntityState {
        self.entry(id).map_or(EntityState::Detached, EntityEntry::state)
    }

    /// Entry tracking the identity `key` of `entity_type` or any type in
    /// its hierarchy.
    pub fn find(&self, entity_type: EntityTypeId, key: &[Value]) -> Option<EntryId> {
        let identity = (self.model.root(entity_type), normalize(key));
        self.state.identity_map.get(&identity).copied()
    }

    /// Mutable access to the current values of an entry.
    ///
    /// Edits are picked up by the next [`detect_changes`](Self::detect_changes).
    pub fn entity_mut(&mut self, id: EntryId) -> Option<&mut DynamicEntity> {
        self.state.entries.get_mut(&id).map(|e| &mut e.current)
    }

    /// Set one property of an entry.
    pub fn set_value(&mut self, id: EntryId, property: &str, value: impl Into<Value>) -> Result<()> {
        let entity_type = self
            .entry(id)
            .map(EntityEntry::entity_type)
            .ok_or_else(|| Error::custom(format!("{id} is not tracked")))?;
        if self.model.find_property(entity_type, property).is_none() {
            return Err(Error::custom(format!(
                "'{}' has no property '{property}'",
                self.model.entity_type_name(entity_type)
            )));
        }
        if let Some(entity) = self.entity_mut(id) {
            entity.set(property, value);
        }
        Ok(())
    }

    /// Description of an entry for error reports.
    pub fn entry_info(&self, id: EntryId) -> EntryInfo {
        match self.entry(id) {
            Some(e) => EntryInfo::new(
                self.model.entity_type_name(e.entity_type),
                self.key_values(e.entity_type, &e.current),
            ),
            None => EntryInfo::new(id.to_string(), Vec::new()),
        }
    }

    /// Number of entries per pending state: `(added, modified, deleted)`.
    pub fn pending_counts(&self) -> (usize, usize, usize) {
        self.entries().fold((0, 0, 0), |(a, m, d), e| match e.state {
            EntityState::Added => (a + 1, m, d),
            EntityState::Modified => (a, m + 1, d),
            EntityState::Deleted => (a, m, d + 1),
            _ => (a, m, d),
        })
    }

    /// True when a save would issue at least one command.
    pub fn has_changes(&self) -> bool {
        self.entries().any(|e| e.state.is_pending())
    }

    // ========================================================================
    // Start tracking
    // ========================================================================

    /// Track a new entity to be inserted.
    ///
    /// Missing store-generated key values get temporary values, replaced
    /// by the store's values when the entity is saved.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity_type = entity.entity_type()))]
    pub fn add(&mut self, entity: DynamicEntity) -> Result<EntryId> {
        let (id, _) = self.track(entity, EntityState::Added, false)?;
        Ok(id)
    }

    /// Track an existing entity as unchanged.
    ///
    /// An entity whose generated key has no value is new and tracked as
    /// `Added` instead.
    pub fn attach(&mut self, entity: DynamicEntity) -> Result<EntryId> {
        let entity_type = self.resolve(&entity)?;
        let state = if self.missing_generated_key(entity_type, &entity) {
            EntityState::Added
        } else {
            EntityState::Unchanged
        };
        let (id, _) = self.track(entity, state, false)?;
        Ok(id)
    }

    /// The entry tracking `entity`'s identity, or a new entry in `state`.
    ///
    /// Returns whether the entry was created. An existing entry keeps its
    /// values: the tracked instance wins over the incoming one.
    pub fn get_or_create(&mut self, entity: DynamicEntity, state: EntityState) -> Result<(EntryId, bool)> {
        self.track(entity, state, true)
    }

    fn track(&mut self, mut entity: DynamicEntity, state: EntityState, reuse: bool) -> Result<(EntryId, bool)> {
        let entity_type = self.resolve(&entity)?;
        let mut temporary = BTreeSet::new();
        if state == EntityState::Added {
            for p in self.model.primary_key_properties(entity_type) {
                let Some(prop) = self.model.property(p) else {
                    continue;
                };
                let (name, sql_type) = (prop.name().to_string(), prop.sql_type());
                if prop.value_generated() != ValueGenerated::Never && entity.get_or_null(&name).is_null() {
                    let value = self.temporary_value(sql_type);
                    entity.set(name, value);
                    temporary.insert(p);
                }
            }
        }
        let key = self.key_values(entity_type, &entity);
        if let Some(missing) = key.iter().position(Value::is_null) {
            let names = self.model.primary_key_properties(entity_type);
            let name = names.get(missing).map_or("?", |p| self.model.property_name(*p));
            return Err(Error::custom(format!(
                "cannot track '{}': key property '{name}' has no value",
                entity.entity_type()
            )));
        }
        let identity = (self.model.root(entity_type), normalize(&key));
        if let Some(existing) = self.state.identity_map.get(&identity).copied() {
            if reuse {
                return Ok((existing, false));
            }
            return Err(IdentityConflictError {
                entry: EntryInfo::new(entity.entity_type(), key),
            }
            .into());
        }

        let id = EntryId(self.state.next_id);
        self.state.next_id += 1;
        let entry = EntityEntry {
            id,
            entity_type,
            state,
            original: entity.clone(),
            current: entity,
            modified: BTreeSet::new(),
            temporary,
            identity: identity.1.clone(),
        };
        self.state.entries.insert(id, entry);
        self.state.identity_map.insert(identity, id);
        self.notify(StateChange {
            entry: id,
            entity_type,
            old: EntityState::Detached,
            new: state,
        });
        Ok((id, true))
    }

    fn resolve(&self, entity: &DynamicEntity) -> Result<EntityTypeId> {
        self.model.entity_type_id(entity.entity_type()).ok_or_else(|| {
            Error::custom(format!(
                "entity type '{}' is not part of the model",
                entity.entity_type()
            ))
        })
    }

    fn missing_generated_key(&self, entity_type: EntityTypeId, entity: &DynamicEntity) -> bool {
        self.model.primary_key_properties(entity_type).iter().any(|p| {
            self.model.property(*p).is_some_and(|prop| {
                prop.value_generated() != ValueGenerated::Never && entity.get_or_null(prop.name()).is_null()
            })
        })
    }

    fn temporary_value(&mut self, sql_type: SqlType) -> Value {
        let n = self.state.next_temporary;
        self.state.next_temporary += 1;
        match sql_type {
            SqlType::BigInt => Value::BigInt(n),
            SqlType::Uuid => {
                let mut bytes = [0xff_u8; 16];
                bytes[8..].copy_from_slice(&n.to_be_bytes());
                Value::Uuid(bytes)
            }
            t if t.is_integer() => Value::Int(n as i32),
            _ => Value::Text(format!("__temporary_{}", n - TEMPORARY_KEY_BASE)),
        }
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// Mark an entry for deletion.
    ///
    /// An added entry is simply forgotten. Tracked dependents follow the
    /// delete behavior of their relationship: `Cascade` dependents are
    /// deleted too, `SetNull`/`ClientSetNull` dependents lose their foreign
    /// key values, `Restrict` dependents are left for the store to reject.
    pub fn delete(&mut self, id: EntryId) -> Result<()> {
        if self.entry(id).is_none() {
            return Err(Error::custom(format!("{id} is not tracked")));
        }
        let mut pending = VecDeque::from([id]);
        while let Some(id) = pending.pop_front() {
            let Some(state) = self.entry(id).map(EntityEntry::state) else {
                continue;
            };
            if matches!(state, EntityState::Deleted | EntityState::Detached) {
                continue;
            }
            let dependents = self.dependents_of(id);
            if state == EntityState::Added {
                self.forget(id);
            } else {
                self.set_state(id, EntityState::Deleted);
            }
            for (dependent, fk, behavior) in dependents {
                match behavior {
                    DeleteBehavior::Cascade => pending.push_back(dependent),
                    DeleteBehavior::SetNull | DeleteBehavior::ClientSetNull => {
                        self.null_foreign_key(dependent, fk);
                    }
                    DeleteBehavior::Restrict => {}
                }
            }
        }
        Ok(())
    }

    /// Stop tracking an entry.
    pub fn detach(&mut self, id: EntryId) {
        self.forget(id);
    }

    /// Stop tracking everything.
    pub fn clear(&mut self) {
        let ids: Vec<EntryId> = self.state.entries.keys().copied().collect();
        for id in ids {
            self.forget(id);
        }
    }

    fn forget(&mut self, id: EntryId) {
        let Some(entry) = self.state.entries.remove(&id) else {
            return;
        };
        let root = self.model.root(entry.entity_type);
        self.state.identity_map.remove(&(root, entry.identity));
        self.notify(StateChange {
            entry: id,
            entity_type: entry.entity_type,
            old: entry.state,
            new: EntityState::Detached,
        });
    }

    fn set_state(&mut self, id: EntryId, new: EntityState) {
        let Some(entry) = self.state.entries.get_mut(&id) else {
            return;
        };
        let old = entry.state;
        if old == new {
            return;
        }
        entry.state = new;
        let entity_type = entry.entity_type;
        self.notify(StateChange {
            entry: id,
            entity_type,
            old,
            new,
        });
    }

    fn notify(&mut self, change: StateChange) {
        let entity_type = self.model.entity_type_name(change.entity_type);
        if self.sensitive_data_logging {
            let key = self
                .entry(change.entry)
                .map(|e| e.identity.clone())
                .unwrap_or_default();
            tracing::debug!(
                target: "relmap::tracking",
                entry = %change.entry,
                entity_type,
                key = ?key,
                old = ?change.old,
                new = ?change.new,
                "state changed"
            );
        } else {
            tracing::debug!(
                target: "relmap::tracking",
                entry = %change.entry,
                entity_type,
                old = ?change.old,
                new = ?change.new,
                "state changed"
            );
        }
        for observer in &mut self.observers {
            observer(&change);
        }
    }

    // ========================================================================
    // Change detection
    // ========================================================================

    /// Compare current and original values of every entry.
    ///
    /// Unchanged and modified entries get their modified flags recomputed
    /// and move between `Unchanged` and `Modified`. An added entry whose
    /// key was assigned by user code is re-registered under the new key and
    /// its tracked dependents are pointed at it. Returns the number of state
    /// transitions; a second call without edits in between returns zero.
    ///
    /// # Errors
    ///
    /// Changing a key property of an entry that exists in the store, or
    /// re-keying an added entry onto a tracked identity.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn detect_changes(&mut self) -> Result<usize> {
        let ids: Vec<EntryId> = self.state.entries.keys().copied().collect();
        let mut transitions = 0;
        for id in ids {
            let Some(entry) = self.entry(id) else {
                continue;
            };
            let (entity_type, state) = (entry.entity_type, entry.state);
            match state {
                EntityState::Added => {
                    let key = self.key_values(entity_type, &entry.current);
                    if normalize(&key) != entry.identity {
                        let before = entry.original.clone();
                        self.rekey(id)?;
                        self.fixup_dependents(id, &before)?;
                        if let Some(e) = self.state.entries.get_mut(&id) {
                            e.original = e.current.clone();
                        }
                    }
                }
                EntityState::Unchanged | EntityState::Modified => {
                    let modified: BTreeSet<PropertyId> = self
                        .model
                        .properties(entity_type)
                        .into_iter()
                        .filter(|p| {
                            let name = self.model.property_name(*p);
                            !same_value(&entry.current.get_or_null(name), &entry.original.get_or_null(name))
                        })
                        .collect();
                    let key = self.model.primary_key_properties(entity_type);
                    if let Some(p) = key.iter().find(|p| modified.contains(p)) {
                        return Err(Error::custom(format!(
                            "key property '{}' of {} was modified; keys of saved entities are immutable",
                            self.model.property_name(*p),
                            self.entry_info(id)
                        )));
                    }
                    let new = if modified.is_empty() {
                        EntityState::Unchanged
                    } else {
                        EntityState::Modified
                    };
                    if let Some(e) = self.state.entries.get_mut(&id) {
                        e.modified = modified;
                    }
                    if new != state {
                        self.set_state(id, new);
                        transitions += 1;
                    }
                }
                EntityState::Deleted | EntityState::Detached => {}
            }
        }
        tracing::debug!(target: "relmap::tracking", transitions, "changes detected");
        Ok(transitions)
    }

    /// Re-register an entry under the key its current values hold.
    fn rekey(&mut self, id: EntryId) -> Result<()> {
        let Some(entry) = self.entry(id) else {
            return Ok(());
        };
        let root = self.model.root(entry.entity_type);
        let key = self.key_values(entry.entity_type, &entry.current);
        let identity = normalize(&key);
        if identity == entry.identity {
            return Ok(());
        }
        if key.iter().any(Value::is_null) {
            return Err(Error::custom(format!(
                "the key of {} was set to null",
                self.model.entity_type_name(entry.entity_type)
            )));
        }
        if self.state.identity_map.contains_key(&(root, identity.clone())) {
            return Err(IdentityConflictError {
                entry: EntryInfo::new(self.model.entity_type_name(entry.entity_type), key),
            }
            .into());
        }
        let old = entry.identity.clone();
        self.state.identity_map.remove(&(root, old));
        self.state.identity_map.insert((root, identity.clone()), id);
        if let Some(e) = self.state.entries.get_mut(&id) {
            e.identity = identity;
            let key_properties = self.model.primary_key_properties(e.entity_type);
            e.temporary.retain(|p| !key_properties.contains(p));
        }
        Ok(())
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    /// Tracked entries whose foreign key currently points at `principal`.
    fn dependents_of(&self, principal: EntryId) -> Vec<(EntryId, ForeignKeyId, DeleteBehavior)> {
        let Some(entry) = self.entry(principal) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for fk in self.model.referencing_foreign_keys(entry.entity_type) {
            let principal_key = self.principal_values(fk, &entry.current);
            if principal_key.iter().any(Value::is_null) {
                continue;
            }
            let behavior = self.model.delete_behavior(fk);
            for dependent in self.entries() {
                if dependent.id == principal || !self.is_dependent_of_fk(dependent, fk) {
                    continue;
                }
                if matches!(dependent.state, EntityState::Deleted | EntityState::Detached) {
                    continue;
                }
                if values_match(&self.foreign_key_values(fk, &dependent.current), &principal_key) {
                    found.push((dependent.id, fk, behavior));
                }
            }
        }
        found
    }

    fn is_dependent_of_fk(&self, entry: &EntityEntry, fk: ForeignKeyId) -> bool {
        self.model
            .foreign_key(fk)
            .is_some_and(|f| self.model.is_assignable_from(f.dependent_type(), entry.entity_type))
    }

    fn null_foreign_key(&mut self, dependent: EntryId, fk: ForeignKeyId) {
        let names: Vec<String> = self
            .model
            .foreign_key(fk)
            .map(|f| {
                f.properties()
                    .iter()
                    .map(|p| self.model.property_name(*p).to_string())
                    .collect()
            })
            .unwrap_or_default();
        if let Some(entity) = self.entity_mut(dependent) {
            for name in names {
                entity.set(name, Value::Null);
            }
        }
    }

    /// Point dependents that referenced the key in `before` at the key the
    /// principal holds now. Dependents whose own key contains the foreign
    /// key are re-registered, and their dependents fixed up in turn.
    fn fixup_dependents(&mut self, principal: EntryId, before: &DynamicEntity) -> Result<()> {
        let Some(entry) = self.entry(principal) else {
            return Ok(());
        };
        let after = entry.current.clone();
        let mut updates: Vec<(EntryId, Vec<(String, Value)>)> = Vec::new();
        for fk in self.model.referencing_foreign_keys(entry.entity_type) {
            let old = self.principal_values(fk, before);
            let new = self.principal_values(fk, &after);
            if old.iter().any(Value::is_null) || values_match(&old, &new) {
                continue;
            }
            let names: Vec<String> = self
                .model
                .foreign_key(fk)
                .map(|f| {
                    f.properties()
                        .iter()
                        .map(|p| self.model.property_name(*p).to_string())
                        .collect()
                })
                .unwrap_or_default();
            for dependent in self.entries() {
                if dependent.id != principal
                    && self.is_dependent_of_fk(dependent, fk)
                    && values_match(&self.foreign_key_values(fk, &dependent.current), &old)
                {
                    updates.push((
                        dependent.id,
                        names.iter().cloned().zip(new.iter().cloned()).collect(),
                    ));
                }
            }
        }
        for (dependent, values) in updates {
            tracing::debug!(
                target: "relmap::tracking",
                principal = %principal,
                dependent = %dependent,
                "foreign key fixed up"
            );
            let Some(dependent_before) = self.entry(dependent).map(|e| e.current.clone()) else {
                continue;
            };
            if let Some(entity) = self.entity_mut(dependent) {
                for (name, value) in values {
                    entity.set(name, value);
                }
            }
            if self.state(dependent) == EntityState::Added {
                self.rekey(dependent)?;
                self.fixup_dependents(dependent, &dependent_before)?;
            }
        }
        Ok(())
    }

    fn principal_values(&self, fk: ForeignKeyId, entity: &DynamicEntity) -> Vec<Value> {
        let Some(key) = self
            .model
            .foreign_key(fk)
            .and_then(|f| self.model.key(f.principal_key()))
        else {
            return Vec::new();
        };
        key.properties()
            .iter()
            .map(|p| entity.get_or_null(self.model.property_name(*p)))
            .collect()
    }

    pub(crate) fn foreign_key_values(&self, fk: ForeignKeyId, entity: &DynamicEntity) -> Vec<Value> {
        self.model.foreign_key(fk).map_or_else(Vec::new, |f| {
            f.properties()
                .iter()
                .map(|p| entity.get_or_null(self.model.property_name(*p)))
                .collect()
        })
    }

    /// The tracked principal `entity` references through `fk`, if any.
    pub(crate) fn principal_of(&self, fk: ForeignKeyId, entity: &DynamicEntity) -> Option<EntryId> {
        let values = self.foreign_key_values(fk, entity);
        if values.is_empty() || values.iter().any(Value::is_null) {
            return None;
        }
        let principal = self.model.foreign_key(fk)?.principal_type();
        // Only primary-key relationships resolve through the identity map.
        let key = self.model.primary_key(principal)?;
        if self.model.foreign_key(fk)?.principal_key() != key.id() {
            return None;
        }
        self.find(principal, &values)
    }

    pub(crate) fn key_values(&self, entity_type: EntityTypeId, entity: &DynamicEntity) -> Vec<Value> {
        self.model
            .primary_key_properties(entity_type)
            .into_iter()
            .map(|p| entity.get_or_null(self.model.property_name(p)))
            .collect()
    }

    // ========================================================================
    // Save support
    // ========================================================================

    /// Write values produced by the store into an entry.
    ///
    /// Replacing a temporary key re-registers the entry under the store key
    /// and fixes up the foreign keys of tracked dependents.
    pub(crate) fn set_store_values(&mut self, id: EntryId, values: &[(PropertyId, Value)]) -> Result<()> {
        let Some(before) = self.entry(id).map(|e| e.current.clone()) else {
            return Ok(());
        };
        let names: Vec<(PropertyId, String)> = values
            .iter()
            .map(|(p, _)| (*p, self.model.property_name(*p).to_string()))
            .collect();
        if let Some(entry) = self.state.entries.get_mut(&id) {
            for ((p, name), (_, value)) in names.into_iter().zip(values) {
                entry.current.set(name, value.clone());
                entry.temporary.remove(&p);
            }
        }
        self.rekey(id)?;
        self.fixup_dependents(id, &before)
    }

    /// After a successful save: added and modified entries become
    /// unchanged with their current values as originals, deleted entries
    /// stop being tracked.
    pub fn accept_all_changes(&mut self) {
        let ids: Vec<EntryId> = self.state.entries.keys().copied().collect();
        for id in ids {
            match self.state(id) {
                EntityState::Deleted => self.forget(id),
                EntityState::Added | EntityState::Modified => {
                    if let Some(e) = self.state.entries.get_mut(&id) {
                        e.original = e.current.clone();
                        e.modified.clear();
                        e.temporary.clear();
                    }
                    self.set_state(id, EntityState::Unchanged);
                }
                EntityState::Unchanged | EntityState::Detached => {}
            }
        }
    }

    pub(crate) fn snapshot(&self) -> TrackerState {
        self.state.clone()
    }

    pub(crate) fn restore(&mut self, state: TrackerState) {
        self.state = state;
    }
}

/// Integers of every width compare equal in identities.
pub(crate) fn normalize(key: &[Value]) -> Vec<Value> {
    key.iter()
        .map(|v| match v.as_i64() {
            Some(i) if v.is_integer() => Value::BigInt(i),
            _ => v.clone(),
        })
        .collect()
}

pub(crate) fn same_value(a: &Value, b: &Value) -> bool {
    a == b || a.loosely_equals(b)
}

fn values_match(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| !x.is_null() && same_value(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_model::outpost_model;
    use std::sync::{Arc, Mutex};

    fn tracker() -> ChangeTracker {
        ChangeTracker::new(outpost_model())
    }

    fn gear(nickname: &str, squad: i32) -> DynamicEntity {
        DynamicEntity::new("Gear")
            .with("Nickname", nickname)
            .with("SquadId", squad)
            .with("FullName", format!("{nickname} Fenix"))
            .with("Rank", 1)
    }

    #[test]
    fn test_distinct_identities_get_distinct_entries() {
        let mut t = tracker();
        let (a, created_a) = t.get_or_create(gear("Marcus", 1), EntityState::Unchanged).unwrap();
        let (b, created_b) = t.get_or_create(gear("Marcus", 2), EntityState::Unchanged).unwrap();
        let (c, created_c) = t
            .get_or_create(gear("Marcus", 1).with("Rank", 9), EntityState::Unchanged)
            .unwrap();
        assert!(created_a && created_b && !created_c);
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_eq!(t.entry(a).unwrap().current_value("Rank"), Value::Int(1));
    }

    #[test]
    fn test_attach_second_instance_conflicts() {
        let mut t = tracker();
        t.attach(gear("Dom", 1)).unwrap();
        let err = t.attach(gear("Dom", 1)).unwrap_err();
        assert!(matches!(err, Error::IdentityConflict(_)), "{err}");
    }

    #[test]
    fn test_derived_type_shares_identity_with_base() {
        let mut t = tracker();
        let officer = DynamicEntity::new("Officer")
            .with("Nickname", "Marcus")
            .with("SquadId", 1_i64);
        let id = t.attach(officer).unwrap();
        let gear_type = t.model().entity_type_id("Gear").unwrap();
        assert_eq!(t.find(gear_type, &[Value::from("Marcus"), Value::Int(1)]), Some(id));
        assert!(t.attach(gear("Marcus", 1)).is_err());
    }

    #[test]
    fn test_add_assigns_temporary_key() {
        let mut t = tracker();
        let a = t.add(DynamicEntity::new("Squad").with("Name", "Delta")).unwrap();
        let b = t.add(DynamicEntity::new("Squad").with("Name", "Kilo")).unwrap();
        let id = t.model().property_id("Squad", "Id").unwrap();
        let ea = t.entry(a).unwrap();
        assert!(ea.has_temporary_value(id));
        assert_ne!(ea.current_value("Id"), t.entry(b).unwrap().current_value("Id"));
        assert!(ea.current_value("Id").as_i64().unwrap() < 0);
        assert_eq!(t.state(a), EntityState::Added);
    }

    #[test]
    fn test_attach_without_generated_key_is_added() {
        let mut t = tracker();
        let id = t.attach(DynamicEntity::new("Squad").with("Name", "Delta")).unwrap();
        assert_eq!(t.state(id), EntityState::Added);
        let id = t.attach(DynamicEntity::new("Squad").with("Id", 4).with("Name", "Kilo")).unwrap();
        assert_eq!(t.state(id), EntityState::Unchanged);
    }

    #[test]
    fn test_detect_changes_is_idempotent() {
        let mut t = tracker();
        let id = t.attach(gear("Cole", 1)).unwrap();
        assert_eq!(t.detect_changes().unwrap(), 0);

        t.set_value(id, "Rank", 2).unwrap();
        assert_eq!(t.detect_changes().unwrap(), 1);
        assert_eq!(t.state(id), EntityState::Modified);
        let rank = t.model().property_id("Gear", "Rank").unwrap();
        assert!(t.entry(id).unwrap().is_modified(rank));

        assert_eq!(t.detect_changes().unwrap(), 0);
        assert_eq!(t.state(id), EntityState::Modified);

        t.set_value(id, "Rank", 1).unwrap();
        assert_eq!(t.detect_changes().unwrap(), 1);
        assert_eq!(t.state(id), EntityState::Unchanged);
    }

    #[test]
    fn test_integer_width_is_not_a_change() {
        let mut t = tracker();
        let id = t.attach(gear("Baird", 1).with("Rank", Value::BigInt(3))).unwrap();
        t.set_value(id, "Rank", 3).unwrap();
        assert_eq!(t.detect_changes().unwrap(), 0);
    }

    #[test]
    fn test_modifying_saved_key_fails() {
        let mut t = tracker();
        let id = t.attach(gear("Cole", 1)).unwrap();
        t.set_value(id, "Nickname", "Augustus").unwrap();
        assert!(t.detect_changes().is_err());
    }

    #[test]
    fn test_unknown_property_is_rejected() {
        let mut t = tracker();
        let id = t.attach(gear("Cole", 1)).unwrap();
        assert!(t.set_value(id, "Lancer", 1).is_err());
    }

    #[test]
    fn test_delete_cascades_and_nulls_optional_dependents() {
        let mut t = tracker();
        let squad = t.attach(DynamicEntity::new("Squad").with("Id", 1).with("Name", "Delta")).unwrap();
        let marcus = t.attach(gear("Marcus", 1)).unwrap();
        let lancer = t
            .attach(
                DynamicEntity::new("Weapon")
                    .with("Id", 10)
                    .with("Name", "Lancer")
                    .with("OwnerNickname", "Marcus")
                    .with("OwnerSquadId", 1)
                    .with("Version", 1),
            )
            .unwrap();

        t.delete(squad).unwrap();
        assert_eq!(t.state(squad), EntityState::Deleted);
        assert_eq!(t.state(marcus), EntityState::Deleted);
        assert_eq!(t.state(lancer), EntityState::Unchanged);
        assert_eq!(t.entry(lancer).unwrap().current_value("OwnerSquadId"), Value::Null);

        t.detect_changes().unwrap();
        assert_eq!(t.state(lancer), EntityState::Modified);
    }

    #[test]
    fn test_deleting_added_entry_forgets_it() {
        let mut t = tracker();
        let id = t.add(DynamicEntity::new("Squad").with("Name", "Delta")).unwrap();
        t.delete(id).unwrap();
        assert_eq!(t.state(id), EntityState::Detached);
        assert!(t.is_empty());
    }

    #[test]
    fn test_store_key_replaces_temporary_key_and_fixes_up_dependents() {
        let mut t = tracker();
        let squad = t.add(DynamicEntity::new("Squad").with("Name", "Delta")).unwrap();
        let temporary = t.entry(squad).unwrap().current_value("Id");
        let marcus = t.add(gear("Marcus", 0).with("SquadId", temporary.clone())).unwrap();

        let id = t.model().property_id("Squad", "Id").unwrap();
        t.set_store_values(squad, &[(id, Value::BigInt(7))]).unwrap();

        let squad_type = t.model().entity_type_id("Squad").unwrap();
        assert_eq!(t.find(squad_type, &[Value::Int(7)]), Some(squad));
        assert_eq!(t.find(squad_type, &[temporary]), None);
        assert_eq!(t.entry(marcus).unwrap().current_value("SquadId"), Value::BigInt(7));
        assert!(!t.entry(squad).unwrap().has_temporary_value(id));
    }

    #[test]
    fn test_user_assigned_key_is_picked_up_by_detect_changes() {
        let mut t = tracker();
        let squad = t.add(DynamicEntity::new("Squad").with("Name", "Delta")).unwrap();
        let temporary = t.entry(squad).unwrap().current_value("Id");
        let marcus = t.add(gear("Marcus", 0).with("SquadId", temporary)).unwrap();
        t.set_value(squad, "Id", 3).unwrap();
        t.detect_changes().unwrap();
        let squad_type = t.model().entity_type_id("Squad").unwrap();
        assert_eq!(t.find(squad_type, &[Value::Int(3)]), Some(squad));
        assert_eq!(t.entry(marcus).unwrap().current_value("SquadId"), Value::Int(3));
    }

    #[test]
    fn test_accept_all_changes() {
        let mut t = tracker();
        let added = t.add(DynamicEntity::new("Squad").with("Name", "Delta")).unwrap();
        let deleted = t.attach(gear("Dom", 1)).unwrap();
        t.delete(deleted).unwrap();
        assert!(t.has_changes());
        assert_eq!(t.pending_counts(), (1, 0, 1));

        t.accept_all_changes();
        assert_eq!(t.state(added), EntityState::Unchanged);
        assert_eq!(t.state(deleted), EntityState::Detached);
        assert!(!t.has_changes());
    }

    #[test]
    fn test_subscribers_see_transitions() {
        let mut t = tracker();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        t.subscribe(move |change| sink.lock().unwrap().push((change.old, change.new)));

        let id = t.attach(gear("Anya", 1)).unwrap();
        t.set_value(id, "Rank", 5).unwrap();
        t.detect_changes().unwrap();
        t.detect_changes().unwrap();
        t.detach(id);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (EntityState::Detached, EntityState::Unchanged),
                (EntityState::Unchanged, EntityState::Modified),
                (EntityState::Modified, EntityState::Detached),
            ]
        );
    }

    #[test]
    fn test_restore_undoes_store_values() {
        let mut t = tracker();
        let squad = t.add(DynamicEntity::new("Squad").with("Name", "Delta")).unwrap();
        let snapshot = t.snapshot();
        let id = t.model().property_id("Squad", "Id").unwrap();
        t.set_store_values(squad, &[(id, Value::Int(1))]).unwrap();
        t.restore(snapshot);
        assert!(t.entry(squad).unwrap().has_temporary_value(id));
    }
}
