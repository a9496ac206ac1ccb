//! The unit of work: pending entries to ordered, batched commands.
//!
//! Saving happens in two steps. [`UpdatePlan::build`] looks at the pending
//! entries once and fixes the order of commands:
//!
//! - an added principal is inserted before the dependents referencing it;
//! - a deleted principal is deleted after its dependents are deleted or
//!   re-parented;
//! - table-per-type entities get one command per table, base table first
//!   on insert and last on delete;
//! - a cycle through a nullable foreign key is broken by inserting with a
//!   null foreign key and setting it with a follow-up UPDATE. Any other
//!   cycle is a [`DependencyCycleError`].
//!
//! [`execute`] then builds each statement from the tracker's values at the
//! moment it runs, so keys generated by earlier commands flow into later
//! ones. Commands without store-generated values are sent together through
//! [`DataSource::execute_batch`]; commands that read values back run alone,
//! with `RETURNING` or the dialect's last-insert-id query.

use crate::tracker::{ChangeTracker, EntityEntry, EntityState, EntryId};
use relmap_core::{
    ConcurrencyError, Cx, DataSource, DataSourceError, DataSourceErrorKind, DependencyCycleError,
    Dialect, Error, Outcome, Result, Statement, Value,
};
use relmap_metadata::{
    EntityTypeId, ForeignKeyId, HierarchyMapping, Model, PropertyId, ValueGenerated,
};
use relmap_query::dml::{DeleteBuilder, InsertBuilder, UpdateBuilder};
use std::collections::{BTreeSet, HashMap};

/// What a command does to its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Insert,
    Update,
    Delete,
    /// Sets foreign keys an earlier insert left null to break a cycle.
    ForeignKeyFixup,
}

impl CommandKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            CommandKind::Insert => "INSERT",
            CommandKind::Update | CommandKind::ForeignKeyFixup => "UPDATE",
            CommandKind::Delete => "DELETE",
        }
    }
}

/// One entry written to one table.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCommand {
    pub entry: EntryId,
    pub kind: CommandKind,
    pub table: String,
    /// Properties stored in `table`.
    properties: Vec<PropertyId>,
    /// Primary-key properties; every table of a hierarchy carries them.
    key: Vec<PropertyId>,
    /// Foreign-key properties written as NULL (insert) or set (fixup).
    deferred: Vec<PropertyId>,
}

/// A command rendered against the tracker's current values.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltCommand {
    pub entry: EntryId,
    pub kind: CommandKind,
    pub statement: Statement,
    /// Properties whose values the store produces, in RETURNING order.
    pub read_back: Vec<PropertyId>,
    /// First property written, named in data-source errors.
    pub first_property: Option<PropertyId>,
}

/// Ordered commands for every pending entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdatePlan {
    commands: Vec<PlannedCommand>,
    entries: usize,
}

#[derive(Debug, Clone)]
struct Node {
    entry: EntryId,
    kind: CommandKind,
    deferred: Vec<PropertyId>,
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    from: usize,
    to: usize,
    fk: ForeignKeyId,
    /// Insert-to-insert through an optional relationship.
    breakable: bool,
    removed: bool,
}

/// Table holding some of an entity's properties.
struct TableLayout {
    table: String,
    properties: Vec<PropertyId>,
}

impl UpdatePlan {
    /// Order the pending entries of `tracker`.
    ///
    /// # Errors
    ///
    /// [`DependencyCycleError`] naming the entries of a cycle that no
    /// nullable foreign key can break.
    #[tracing::instrument(level = "debug", skip(tracker))]
    pub fn build(tracker: &ChangeTracker) -> Result<Self> {
        let model: &Model = tracker.model();
        let mut nodes: Vec<Node> = Vec::new();
        let mut node_of: HashMap<EntryId, usize> = HashMap::new();
        for entry in tracker.entries() {
            let kind = match entry.state() {
                EntityState::Added => CommandKind::Insert,
                EntityState::Modified => CommandKind::Update,
                EntityState::Deleted => CommandKind::Delete,
                EntityState::Unchanged | EntityState::Detached => continue,
            };
            node_of.insert(entry.id(), nodes.len());
            nodes.push(Node {
                entry: entry.id(),
                kind,
                deferred: Vec::new(),
            });
        }
        let entries = nodes.len();
        let mut edges = dependencies(tracker, &nodes, &node_of);
        let order = match topological_order(model, &mut nodes, &mut edges) {
            Ok(order) => order,
            Err(remaining) => {
                let mut seen = BTreeSet::new();
                let entries = remaining
                    .into_iter()
                    .map(|n| nodes[n].entry)
                    .filter(|e| seen.insert(*e))
                    .map(|e| tracker.entry_info(e))
                    .collect();
                return Err(DependencyCycleError { entries }.into());
            }
        };

        let mut commands = Vec::new();
        for n in order {
            let node = &nodes[n];
            let Some(entry) = tracker.entry(node.entry) else {
                continue;
            };
            let key = model.primary_key_properties(entry.entity_type());
            let mut layout = table_layout(model, entry.entity_type());
            if node.kind == CommandKind::Delete {
                layout.reverse();
            }
            for t in layout {
                let deferred: Vec<PropertyId> = t
                    .properties
                    .iter()
                    .copied()
                    .filter(|p| node.deferred.contains(p))
                    .collect();
                let needed = match node.kind {
                    CommandKind::Insert | CommandKind::Delete => true,
                    CommandKind::Update => t
                        .properties
                        .iter()
                        .any(|p| entry.is_modified(*p) && !key.contains(p)),
                    CommandKind::ForeignKeyFixup => !deferred.is_empty(),
                };
                if needed {
                    commands.push(PlannedCommand {
                        entry: node.entry,
                        kind: node.kind,
                        table: t.table,
                        properties: t.properties,
                        key: key.clone(),
                        deferred,
                    });
                }
            }
        }
        tracing::debug!(
            target: "relmap::update",
            entries,
            commands = commands.len(),
            "update plan built"
        );
        Ok(Self { commands, entries })
    }

    pub fn commands(&self) -> &[PlannedCommand] {
        &self.commands
    }

    /// Number of entries written by the plan.
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Edges between commands implied by foreign keys.
fn dependencies(tracker: &ChangeTracker, nodes: &[Node], node_of: &HashMap<EntryId, usize>) -> Vec<Edge> {
    let model = tracker.model();
    let mut edges = Vec::new();
    for (index, node) in nodes.iter().enumerate() {
        let Some(entry) = tracker.entry(node.entry) else {
            continue;
        };
        for fk in model.all_foreign_keys(entry.entity_type()) {
            if matches!(node.kind, CommandKind::Insert | CommandKind::Update) {
                let principal = tracker
                    .principal_of(fk, entry.entity())
                    .and_then(|p| node_of.get(&p).copied());
                if let Some(p) = principal.filter(|p| *p != index && nodes[*p].kind == CommandKind::Insert) {
                    edges.push(Edge {
                        from: p,
                        to: index,
                        fk,
                        breakable: node.kind == CommandKind::Insert && !model.is_required(fk),
                        removed: false,
                    });
                }
            }
            if matches!(node.kind, CommandKind::Update | CommandKind::Delete) {
                let principal = tracker
                    .principal_of(fk, entry.original())
                    .and_then(|p| node_of.get(&p).copied());
                if let Some(p) = principal.filter(|p| *p != index && nodes[*p].kind == CommandKind::Delete) {
                    edges.push(Edge {
                        from: index,
                        to: p,
                        fk,
                        breakable: false,
                        removed: false,
                    });
                }
            }
        }
    }
    edges
}

/// Kahn's algorithm, lowest node first among the ready ones.
///
/// On a stall, one breakable edge among the remaining nodes is removed: its
/// dependent inserts with the foreign key deferred and a fixup node sets it
/// once both rows exist. Without a breakable edge the remaining nodes are
/// returned as the error.
fn topological_order(model: &Model, nodes: &mut Vec<Node>, edges: &mut Vec<Edge>) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let mut order = Vec::with_capacity(nodes.len());
    let mut done = vec![false; nodes.len()];
    loop {
        let mut indegree = vec![0usize; nodes.len()];
        for e in edges.iter().filter(|e| !e.removed && !done[e.from]) {
            indegree[e.to] += 1;
        }
        let mut ready: BTreeSet<usize> = (0..nodes.len())
            .filter(|n| !done[*n] && indegree[*n] == 0)
            .collect();
        while let Some(n) = ready.pop_first() {
            done[n] = true;
            order.push(n);
            for e in edges.iter().filter(|e| !e.removed && e.from == n) {
                indegree[e.to] -= 1;
                if indegree[e.to] == 0 && !done[e.to] {
                    ready.insert(e.to);
                }
            }
        }
        if done.iter().all(|d| *d) {
            return Ok(order);
        }

        let Some(broken) = edges
            .iter()
            .position(|e| !e.removed && e.breakable && !done[e.from] && !done[e.to])
        else {
            return Err((0..nodes.len()).filter(|n| !done[*n]).collect());
        };
        edges[broken].removed = true;
        let Edge { from, to, fk, .. } = edges[broken];
        let properties = model
            .foreign_key(fk)
            .map(|f| f.properties().to_vec())
            .unwrap_or_default();
        tracing::debug!(
            target: "relmap::update",
            entry = %nodes[to].entry,
            foreign_key = %fk,
            "breaking insert cycle with a follow-up update"
        );
        nodes[to].deferred.extend(properties.iter().copied());
        let fixup = nodes.len();
        let entry = nodes[to].entry;
        nodes.push(Node {
            entry,
            kind: CommandKind::ForeignKeyFixup,
            deferred: properties,
        });
        done.push(false);
        for source in [from, to] {
            edges.push(Edge {
                from: source,
                to: fixup,
                fk,
                breakable: false,
                removed: false,
            });
        }
    }
}

/// Tables of `entity_type`, base first.
fn table_layout(model: &Model, entity_type: EntityTypeId) -> Vec<TableLayout> {
    if matches!(model.hierarchy_mapping(entity_type), Some(HierarchyMapping::TablePerType { .. })) {
        let root = model.root(entity_type);
        let key = model.primary_key_properties(root);
        return model
            .base_chain(entity_type)
            .into_iter()
            .filter_map(|t| {
                let declared = model.entity_type(t)?.declared_properties().to_vec();
                let properties = if t == root {
                    declared
                } else {
                    key.iter().copied().chain(declared).collect()
                };
                Some(TableLayout {
                    table: model.table_name(t),
                    properties,
                })
            })
            .collect();
    }
    vec![TableLayout {
        table: model.table_name(entity_type),
        properties: model.properties(entity_type),
    }]
}

impl PlannedCommand {
    /// Render the command from the tracker's current values.
    pub fn build(&self, tracker: &ChangeTracker, dialect: Dialect) -> Result<BuiltCommand> {
        let model = tracker.model();
        let entry = tracker
            .entry(self.entry)
            .ok_or_else(|| Error::custom(format!("{} is no longer tracked", self.entry)))?;
        let mut read_back = Vec::new();
        let mut first_property = None;
        let statement = match self.kind {
            CommandKind::Insert => {
                let discriminator = model.discriminator_property(entry.entity_type());
                let mut insert = InsertBuilder::new(&self.table);
                for &p in &self.properties {
                    let Some(prop) = model.property(p) else {
                        continue;
                    };
                    let value = if Some(p) == discriminator {
                        model
                            .discriminator_value(entry.entity_type())
                            .cloned()
                            .unwrap_or(Value::Null)
                    } else {
                        entry.current_value(prop.name())
                    };
                    if prop.value_generated() != ValueGenerated::Never
                        && (entry.has_temporary_value(p) || value.is_null())
                    {
                        read_back.push(p);
                        insert = insert.returning(model.column_name(p));
                        continue;
                    }
                    let value = if self.deferred.contains(&p) { Value::Null } else { value };
                    first_property.get_or_insert(p);
                    insert = insert.value(model.column_name(p), value);
                }
                insert.build_with_dialect(dialect)
            }
            CommandKind::Update => {
                let mut update = UpdateBuilder::new(&self.table);
                for &p in &self.properties {
                    let Some(prop) = model.property(p) else {
                        continue;
                    };
                    if prop.value_generated() == ValueGenerated::OnAddOrUpdate {
                        read_back.push(p);
                        update = update.returning(model.column_name(p));
                        continue;
                    }
                    if entry.is_modified(p) && !self.key.contains(&p) {
                        first_property.get_or_insert(p);
                        update = update.set(model.column_name(p), entry.current_value(prop.name()));
                    }
                }
                self.match_row(model, entry, update, |u, c, v| u.where_eq(c, v), true)
                    .build_with_dialect(dialect)
            }
            CommandKind::ForeignKeyFixup => {
                let mut update = UpdateBuilder::new(&self.table);
                for &p in &self.deferred {
                    first_property.get_or_insert(p);
                    update = update.set(
                        model.column_name(p),
                        entry.current_value(model.property_name(p)),
                    );
                }
                self.match_row(model, entry, update, |u, c, v| u.where_eq(c, v), false)
                    .build_with_dialect(dialect)
            }
            CommandKind::Delete => {
                let delete = DeleteBuilder::new(&self.table);
                self.match_row(model, entry, delete, |d, c, v| d.where_eq(c, v), true)
                    .build_with_dialect(dialect)
            }
        };
        Ok(BuiltCommand {
            entry: self.entry,
            kind: self.kind,
            statement,
            read_back,
            first_property,
        })
    }

    /// Match the row by key. Saved rows match on original key and
    /// concurrency-token values; rows inserted by this save match on the
    /// current key.
    fn match_row<B>(
        &self,
        model: &Model,
        entry: &EntityEntry,
        mut builder: B,
        condition: impl Fn(B, String, Value) -> B,
        saved: bool,
    ) -> B {
        for &p in &self.key {
            let name = model.property_name(p);
            let value = if saved { entry.original_value(name) } else { entry.current_value(name) };
            builder = condition(builder, model.column_name(p), value);
        }
        if saved {
            for &p in &self.properties {
                if !self.key.contains(&p) && model.property(p).is_some_and(|prop| prop.is_concurrency_token()) {
                    builder = condition(builder, model.column_name(p), entry.original_value(model.property_name(p)));
                }
            }
        }
        builder
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Settings for one save.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SaveOptions {
    pub dialect: Dialect,
    pub max_batch_size: usize,
    pub sensitive_data_logging: bool,
}

/// Run every command of `plan` against `source`.
///
/// Transactions are the caller's concern; on failure the tracker may hold
/// store values of commands that already ran.
pub(crate) async fn execute<D: DataSource>(
    cx: &Cx,
    source: &D,
    tracker: &mut ChangeTracker,
    plan: &UpdatePlan,
    options: SaveOptions,
) -> Outcome<(), Error> {
    let mut batch: Vec<BuiltCommand> = Vec::new();
    for command in plan.commands() {
        let built = match command.build(tracker, options.dialect) {
            Ok(built) => built,
            Err(e) => return Outcome::Err(e),
        };
        log_command(&built, &command.table, options);
        if built.read_back.is_empty() {
            batch.push(built);
            if batch.len() >= options.max_batch_size.max(1) {
                match flush(cx, source, tracker, &mut batch).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            continue;
        }
        match flush(cx, source, tracker, &mut batch).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match execute_with_read_back(cx, source, tracker, &built, options.dialect).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    }
    flush(cx, source, tracker, &mut batch).await
}

fn log_command(built: &BuiltCommand, table: &str, options: SaveOptions) {
    if options.sensitive_data_logging {
        tracing::debug!(
            target: "relmap::update",
            kind = built.kind.as_str(),
            table,
            sql = %built.statement.sql,
            params = ?built.statement.params,
            "command"
        );
    } else {
        tracing::debug!(
            target: "relmap::update",
            kind = built.kind.as_str(),
            table,
            sql = %built.statement.sql,
            "command"
        );
    }
}

/// Send the pending batch and check one row was affected per command.
async fn flush<D: DataSource>(
    cx: &Cx,
    source: &D,
    tracker: &ChangeTracker,
    batch: &mut Vec<BuiltCommand>,
) -> Outcome<(), Error> {
    if batch.is_empty() {
        return Outcome::Ok(());
    }
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    let commands = std::mem::take(batch);
    let statements: Vec<Statement> = commands.iter().map(|c| c.statement.clone()).collect();
    tracing::debug!(target: "relmap::update", statements = statements.len(), "executing batch");
    let counts = match source.execute_batch(cx, &statements).await {
        Outcome::Ok(counts) => counts,
        Outcome::Err(e) => return Outcome::Err(wrap_error(e, tracker, &commands)),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };
    for (i, command) in commands.iter().enumerate() {
        let actual = counts.get(i).copied().unwrap_or(0);
        if actual != 1 {
            return Outcome::Err(concurrency_error(tracker, command, actual));
        }
    }
    Outcome::Ok(())
}

async fn execute_with_read_back<D: DataSource>(
    cx: &Cx,
    source: &D,
    tracker: &mut ChangeTracker,
    command: &BuiltCommand,
    dialect: Dialect,
) -> Outcome<(), Error> {
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    let single = std::slice::from_ref(command);
    let values: Vec<Value> = if dialect.supports_returning() {
        let rows = match source.query(cx, &command.statement.sql, &command.statement.params).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(wrap_error(e, tracker, single)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match rows.as_slice() {
            [row] => row.values().to_vec(),
            _ => return Outcome::Err(concurrency_error(tracker, command, rows.len() as u64)),
        }
    } else {
        let affected = match source.execute(cx, &command.statement.sql, &command.statement.params).await {
            Outcome::Ok(n) => n,
            Outcome::Err(e) => return Outcome::Err(wrap_error(e, tracker, single)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if affected != 1 {
            return Outcome::Err(concurrency_error(tracker, command, affected));
        }
        // Only an identity key can be recovered without RETURNING.
        let identity = command.kind == CommandKind::Insert
            && command.read_back.len() == 1
            && tracker.entry(command.entry).is_some_and(|e| {
                tracker
                    .model()
                    .primary_key_properties(e.entity_type())
                    .contains(&command.read_back[0])
            });
        if !identity {
            tracing::debug!(
                target: "relmap::update",
                entry = %command.entry,
                "store-generated values cannot be read back without RETURNING"
            );
            return Outcome::Ok(());
        }
        let rows = match source.query(cx, dialect.last_insert_id_sql(), &[]).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(wrap_error(e, tracker, single)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        rows.first().and_then(|r| r.get(0)).cloned().into_iter().collect()
    };
    if values.len() < command.read_back.len() {
        return Outcome::Err(Error::from(
            DataSourceError::new(
                DataSourceErrorKind::Query,
                format!(
                    "expected {} store-generated value(s), got {}",
                    command.read_back.len(),
                    values.len()
                ),
            )
            .with_sql(command.statement.sql.clone())
            .with_entries(vec![tracker.entry_info(command.entry)]),
        ));
    }
    let pairs: Vec<(PropertyId, Value)> = command.read_back.iter().copied().zip(values).collect();
    match tracker.set_store_values(command.entry, &pairs) {
        Ok(()) => Outcome::Ok(()),
        Err(e) => Outcome::Err(e),
    }
}

fn concurrency_error(tracker: &ChangeTracker, command: &BuiltCommand, actual: u64) -> Error {
    tracing::warn!(
        target: "relmap::update",
        entry = %command.entry,
        kind = command.kind.as_str(),
        actual,
        "command affected an unexpected number of rows"
    );
    ConcurrencyError {
        entries: vec![tracker.entry_info(command.entry)],
        expected_rows: 1,
        actual_rows: actual,
    }
    .into()
}

/// Add entity context to a data-source failure.
///
/// Batches are all-or-nothing: every entry of the batch is reported.
fn wrap_error(error: Error, tracker: &ChangeTracker, commands: &[BuiltCommand]) -> Error {
    let model = tracker.model();
    let entries = commands.iter().map(|c| tracker.entry_info(c.entry)).collect();
    let first = commands.first();
    let entity_type = first
        .and_then(|c| tracker.entry(c.entry))
        .map(|e| model.entity_type_name(e.entity_type()).to_string());
    let property = first
        .and_then(|c| c.first_property)
        .map(|p| model.property_name(p).to_string());
    let sql = first.map(|c| c.statement.sql.clone());
    let mut wrapped = match error {
        Error::DataSource(e) => e,
        Error::Concurrency(c) => return Error::Concurrency(c),
        other => DataSourceError::new(DataSourceErrorKind::Other, other.to_string()).with_source(Box::new(other)),
    };
    if wrapped.entity_type.is_none() {
        wrapped.entity_type = entity_type;
    }
    if wrapped.property.is_none() {
        wrapped.property = property;
    }
    if wrapped.sql.is_none() {
        wrapped.sql = sql;
    }
    if wrapped.entries.is_empty() {
        wrapped.entries = entries;
    }
    Error::DataSource(wrapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_model::outpost_model;
    use relmap_core::DynamicEntity;

    fn tracker() -> ChangeTracker {
        ChangeTracker::new(outpost_model())
    }

    fn summary(tracker: &ChangeTracker, plan: &UpdatePlan) -> Vec<String> {
        plan.commands()
            .iter()
            .map(|c| {
                let info = tracker.entry_info(c.entry);
                format!("{} {} {}", c.kind.as_str(), c.table, info.entity_type)
            })
            .collect()
    }

    fn squad(id: i32) -> DynamicEntity {
        DynamicEntity::new("Squad").with("Id", id).with("Name", "Delta")
    }

    fn gear(nickname: &str, squad: impl Into<Value>) -> DynamicEntity {
        DynamicEntity::new("Gear")
            .with("Nickname", nickname)
            .with("SquadId", squad)
            .with("Rank", 1)
    }

    #[test]
    fn test_principal_inserted_before_dependent() {
        let mut t = tracker();
        let marcus = t.add(gear("Marcus", 0)).unwrap();
        let delta = t.add(DynamicEntity::new("Squad").with("Name", "Delta")).unwrap();
        let temporary = t.entry(delta).unwrap().current_value("Id");
        t.set_value(marcus, "SquadId", temporary).unwrap();

        let plan = UpdatePlan::build(&t).unwrap();
        assert_eq!(summary(&t, &plan), vec!["INSERT Squad Squad", "INSERT Gear Gear"]);
        assert_eq!(plan.entry_count(), 2);
    }

    #[test]
    fn test_dependent_deleted_before_principal() {
        let mut t = tracker();
        let delta = t.attach(squad(1)).unwrap();
        let marcus = t.attach(gear("Marcus", 1)).unwrap();
        t.delete(delta).unwrap();
        assert_eq!(t.state(marcus), EntityState::Deleted);

        let plan = UpdatePlan::build(&t).unwrap();
        assert_eq!(summary(&t, &plan), vec!["DELETE Gear Gear", "DELETE Squad Squad"]);
    }

    #[test]
    fn test_reparented_dependent_updated_before_principal_delete() {
        let mut t = tracker();
        let marcus = t.attach(gear("Marcus", 1)).unwrap();
        let lancer = t
            .attach(
                DynamicEntity::new("Weapon")
                    .with("Id", 10)
                    .with("OwnerNickname", "Marcus")
                    .with("OwnerSquadId", 1)
                    .with("Version", 1),
            )
            .unwrap();
        t.delete(marcus).unwrap();
        t.detect_changes().unwrap();
        assert_eq!(t.state(lancer), EntityState::Modified);

        let plan = UpdatePlan::build(&t).unwrap();
        assert_eq!(summary(&t, &plan), vec!["UPDATE Weapon Weapon", "DELETE Gear Gear"]);
    }

    #[test]
    fn test_table_per_type_commands_per_table() {
        let mut t = tracker();
        let tank = t
            .add(DynamicEntity::new("Tank").with("Name", "Centaur").with("Armor", 9))
            .unwrap();
        let plan = UpdatePlan::build(&t).unwrap();
        assert_eq!(summary(&t, &plan), vec!["INSERT Vehicle Tank", "INSERT Tank Tank"]);

        let base = plan.commands()[0].build(&t, Dialect::Postgres).unwrap();
        assert_eq!(
            base.statement.sql,
            r#"INSERT INTO "Vehicle" ("Name") VALUES ($1) RETURNING "Id""#
        );
        let id = t.model().property_id("Vehicle", "Id").unwrap();
        assert_eq!(base.read_back, vec![id]);

        t.set_store_values(tank, &[(id, Value::Int(5))]).unwrap();
        let derived = plan.commands()[1].build(&t, Dialect::Postgres).unwrap();
        assert_eq!(derived.statement.sql, r#"INSERT INTO "Tank" ("Id", "Armor") VALUES ($1, $2)"#);
        assert_eq!(derived.statement.params, vec![Value::Int(5), Value::Int(9)]);

        t.accept_all_changes();
        t.delete(tank).unwrap();
        let plan = UpdatePlan::build(&t).unwrap();
        assert_eq!(summary(&t, &plan), vec!["DELETE Tank Tank", "DELETE Vehicle Tank"]);
    }

    #[test]
    fn test_discriminator_written_on_insert() {
        let mut t = tracker();
        t.add(DynamicEntity::new("Officer").with("Nickname", "Marcus").with("SquadId", 1).with("Rank", 4))
            .unwrap();
        let plan = UpdatePlan::build(&t).unwrap();
        let built = plan.commands()[0].build(&t, Dialect::Sqlite).unwrap();
        assert!(built.statement.sql.starts_with(r#"INSERT INTO "Gear" ("#), "{}", built.statement.sql);
        assert!(built.statement.params.contains(&Value::from("Officer")));
        assert!(built.read_back.is_empty());
    }

    #[test]
    fn test_update_checks_concurrency_token() {
        let mut t = tracker();
        let lancer = t
            .attach(
                DynamicEntity::new("Weapon")
                    .with("Id", 10)
                    .with("Name", "Lancer")
                    .with("Version", 1),
            )
            .unwrap();
        t.set_value(lancer, "Name", "Retro Lancer").unwrap();
        t.set_value(lancer, "Version", 2).unwrap();
        t.detect_changes().unwrap();

        let plan = UpdatePlan::build(&t).unwrap();
        let built = plan.commands()[0].build(&t, Dialect::Postgres).unwrap();
        assert_eq!(
            built.statement.sql,
            r#"UPDATE "Weapon" SET "Name" = $1, "Version" = $2 WHERE "Id" = $3 AND "Version" = $4"#
        );
        assert_eq!(
            built.statement.params,
            vec![Value::from("Retro Lancer"), Value::Int(2), Value::Int(10), Value::Int(1)]
        );
        let name = t.model().property_id("Weapon", "Name").unwrap();
        assert_eq!(built.first_property, Some(name));
    }

    #[test]
    fn test_nullable_cycle_broken_with_follow_up_update() {
        let mut t = tracker();
        let faction = t.add(DynamicEntity::new("Faction")).unwrap();
        let leader = t.add(DynamicEntity::new("Leader")).unwrap();
        let faction_id = t.entry(faction).unwrap().current_value("Id");
        let leader_id = t.entry(leader).unwrap().current_value("Id");
        t.set_value(faction, "LeaderId", leader_id).unwrap();
        t.set_value(leader, "FactionId", faction_id).unwrap();

        let plan = UpdatePlan::build(&t).unwrap();
        assert_eq!(
            summary(&t, &plan),
            vec!["INSERT Faction Faction", "INSERT Leader Leader", "UPDATE Faction Faction"]
        );
        let insert = plan.commands()[0].build(&t, Dialect::Postgres).unwrap();
        assert_eq!(
            insert.statement.sql,
            r#"INSERT INTO "Faction" ("LeaderId") VALUES ($1) RETURNING "Id""#
        );
        assert_eq!(insert.statement.params, vec![Value::Null]);

        let id = t.model().property_id("Leader", "Id").unwrap();
        t.set_store_values(leader, &[(id, Value::Int(3))]).unwrap();
        let fixup = plan.commands()[2].build(&t, Dialect::Postgres).unwrap();
        assert_eq!(fixup.kind, CommandKind::ForeignKeyFixup);
        assert!(fixup.statement.sql.starts_with(r#"UPDATE "Faction" SET "LeaderId" = $1 WHERE "Id" = $2"#));
        assert_eq!(fixup.statement.params[0], Value::Int(3));
    }

    #[test]
    fn test_required_cycle_is_reported() {
        let mut t = tracker();
        let hive = t.add(DynamicEntity::new("Hive")).unwrap();
        let queen = t.add(DynamicEntity::new("Queen")).unwrap();
        let hive_id = t.entry(hive).unwrap().current_value("Id");
        let queen_id = t.entry(queen).unwrap().current_value("Id");
        t.set_value(hive, "QueenId", queen_id).unwrap();
        t.set_value(queen, "HiveId", hive_id).unwrap();

        let err = UpdatePlan::build(&t).unwrap_err();
        let Error::DependencyCycle(cycle) = err else {
            panic!("expected a dependency cycle, got {err}");
        };
        let names: Vec<&str> = cycle.entries.iter().map(|e| e.entity_type.as_str()).collect();
        assert_eq!(names, vec!["Hive", "Queen"]);
    }

    #[test]
    fn test_nothing_pending_gives_empty_plan() {
        let mut t = tracker();
        t.attach(squad(1)).unwrap();
        let plan = UpdatePlan::build(&t).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.entry_count(), 0);
    }

    #[test]
    fn test_wrap_error_adds_entity_context() {
        let mut t = tracker();
        t.add(gear("Dom", 1).with("FullName", "Dominic Santiago")).unwrap();
        let plan = UpdatePlan::build(&t).unwrap();
        let built = plan.commands()[0].build(&t, Dialect::Postgres).unwrap();
        let err = wrap_error(
            DataSourceError::new(DataSourceErrorKind::Constraint, "duplicate key").into(),
            &t,
            &[built],
        );
        let Error::DataSource(e) = err else {
            panic!("expected a data source error");
        };
        assert_eq!(e.entity_type.as_deref(), Some("Gear"));
        assert_eq!(e.property.as_deref(), Some("Nickname"));
        assert_eq!(e.entries.len(), 1);
        assert!(e.sql.unwrap().starts_with("INSERT INTO"));
    }
}
