//! The session: queries, change tracking and saving against one data source.

use crate::materializer::{Materializer, QueryTrackingBehavior, ResultValue};
use crate::tracker::{ChangeTracker, EntityEntry, EntityState, EntryId, StateChange};
use crate::update::{self, SaveOptions, UpdatePlan};
use relmap_core::{Cx, DataSource, Dialect, DynamicEntity, Entity, Error, Outcome, Result, Value};
use relmap_metadata::FinalizedModel;
use relmap_query::{ClientFunctions, CompiledQuery, Expr, Query, QueryCompiler};
use serde::{Deserialize, Serialize};

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Tracking of entities returned by queries.
    pub tracking: QueryTrackingBehavior,
    /// Whether `save_changes` runs change detection first.
    pub auto_detect_changes: bool,
    /// Most commands sent in one batch.
    pub max_batch_size: usize,
    /// Whether logs and errors may contain key and parameter values.
    pub sensitive_data_logging: bool,
    /// Dialect used instead of the data source's own.
    pub dialect_override: Option<Dialect>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tracking: QueryTrackingBehavior::TrackAll,
            auto_detect_changes: true,
            max_batch_size: 42,
            sensitive_data_logging: false,
            dialect_override: None,
        }
    }
}

/// A unit of work over one data source.
///
/// Entities are added, attached or queried into the session's change
/// tracker; [`save_changes`](Self::save_changes) writes every pending change
/// in one transaction and accepts it once the store has confirmed.
///
/// # Example
///
/// ```ignore
/// let mut session = Session::new(source, model);
/// let delta = session.add(DynamicEntity::new("Squad").with("Name", "Delta"))?;
/// session.save_changes(&cx).await;
/// let squads = session.query(&cx, Query::from("Squad")).await;
/// ```
pub struct Session<D: DataSource> {
    source: D,
    model: FinalizedModel,
    tracker: ChangeTracker,
    config: SessionConfig,
    functions: ClientFunctions,
    in_transaction: bool,
}

impl<D: DataSource> Session<D> {
    /// Create a session with the default configuration.
    pub fn new(source: D, model: FinalizedModel) -> Self {
        Self::with_config(source, model, SessionConfig::default())
    }

    pub fn with_config(source: D, model: FinalizedModel, config: SessionConfig) -> Self {
        let mut tracker = ChangeTracker::new(model.clone());
        tracker.set_sensitive_data_logging(config.sensitive_data_logging);
        Self {
            source,
            model,
            tracker,
            config,
            functions: ClientFunctions::with_builtins(),
            in_transaction: false,
        }
    }

    /// Replace the functions available to client-evaluated projections.
    #[must_use]
    pub fn with_client_functions(mut self, functions: ClientFunctions) -> Self {
        self.functions = functions;
        self
    }

    pub fn source(&self) -> &D {
        &self.source
    }

    pub fn model(&self) -> &FinalizedModel {
        &self.model
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The dialect statements are rendered for.
    pub fn dialect(&self) -> Dialect {
        self.config.dialect_override.unwrap_or_else(|| self.source.dialect())
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ChangeTracker {
        &mut self.tracker
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Track `entity` as new; it is inserted by the next save.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity_type = entity.entity_type()))]
    pub fn add(&mut self, entity: DynamicEntity) -> Result<EntryId> {
        self.tracker.add(entity)
    }

    /// Track a typed entity as new.
    pub fn add_entity<E: Entity>(&mut self, entity: &E) -> Result<EntryId> {
        self.add(entity.to_dynamic())
    }

    /// Track `entity` as existing in the store.
    pub fn attach(&mut self, entity: DynamicEntity) -> Result<EntryId> {
        self.tracker.attach(entity)
    }

    /// Mark an entry for deletion, cascading to tracked dependents.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn delete(&mut self, id: EntryId) -> Result<()> {
        self.tracker.delete(id)
    }

    /// Stop tracking an entry.
    pub fn detach(&mut self, id: EntryId) {
        self.tracker.detach(id);
    }

    pub fn entry(&self, id: EntryId) -> Option<&EntityEntry> {
        self.tracker.entry(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &EntityEntry> {
        self.tracker.entries()
    }

    /// Set a property of a tracked entity.
    pub fn set_value(&mut self, id: EntryId, property: &str, value: impl Into<Value>) -> Result<()> {
        self.tracker.set_value(id, property, value)
    }

    /// Compare current with original values; returns how many entries
    /// changed state.
    pub fn detect_changes(&mut self) -> Result<usize> {
        self.tracker.detect_changes()
    }

    /// Observe state changes of tracked entries.
    pub fn subscribe(&mut self, observer: impl FnMut(&StateChange) + Send + 'static) {
        self.tracker.subscribe(observer);
    }

    /// Forget every tracked entity.
    pub fn clear(&mut self) {
        self.tracker.clear();
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Translate `query` without running it.
    pub fn compile(&self, query: Query) -> Result<CompiledQuery> {
        QueryCompiler::with_client_functions(&self.model, self.functions.clone())
            .compile(query)
            .map_err(Error::from)
    }

    /// Run `query` with the session's tracking behavior.
    pub async fn query(&mut self, cx: &Cx, query: Query) -> Outcome<Vec<ResultValue>, Error> {
        let tracking = self.config.tracking;
        self.query_with(cx, query, tracking).await
    }

    /// Run `query` with an explicit tracking behavior.
    #[tracing::instrument(level = "debug", skip(self, cx, query))]
    pub async fn query_with(
        &mut self,
        cx: &Cx,
        query: Query,
        tracking: QueryTrackingBehavior,
    ) -> Outcome<Vec<ResultValue>, Error> {
        let compiled = match self.compile(query) {
            Ok(compiled) => compiled,
            Err(e) => return Outcome::Err(e),
        };
        let dialect = self.dialect();
        let outcome = Materializer::new(&mut self.tracker, &self.functions, tracking)
            .load(cx, &self.source, dialect, &compiled)
            .await;
        if let Outcome::Ok(values) = &outcome {
            tracing::debug!(results = values.len(), "query materialized");
        }
        outcome
    }

    /// Run a query ending in an aggregate or single-element operator and
    /// return its value.
    pub async fn query_scalar(&mut self, cx: &Cx, query: Query) -> Outcome<Value, Error> {
        let values = match self.query(cx, query).await {
            Outcome::Ok(values) => values,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match values.into_iter().next() {
            None => Outcome::Ok(Value::Null),
            Some(ResultValue::Value(v)) => Outcome::Ok(v),
            Some(other) => Outcome::Err(Error::custom(format!(
                "query returned a composite value, not a scalar: {}",
                other.to_json()
            ))),
        }
    }

    /// Run an entity query and convert the results to `E`.
    pub async fn query_as<E: Entity>(&mut self, cx: &Cx, query: Query) -> Outcome<Vec<E>, Error> {
        let values = match self.query(cx, query).await {
            Outcome::Ok(values) => values,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut typed = Vec::with_capacity(values.len());
        for value in values {
            if value.is_null() {
                continue;
            }
            let Some(entity) = value.into_entity() else {
                return Outcome::Err(Error::custom("query does not return entities"));
            };
            match E::from_dynamic(&entity) {
                Ok(e) => typed.push(e),
                Err(e) => return Outcome::Err(e),
            }
        }
        Outcome::Ok(typed)
    }

    /// Find an entity by primary key.
    ///
    /// A tracked entity is returned without a round trip; otherwise the
    /// store is queried and the result tracked. Returns null when no entity
    /// has the key.
    #[tracing::instrument(level = "debug", skip(self, cx, key))]
    pub async fn find(&mut self, cx: &Cx, entity_type: &str, key: &[Value]) -> Outcome<ResultValue, Error> {
        let Some(type_id) = self.model.entity_type_id(entity_type) else {
            return Outcome::Err(Error::custom(format!(
                "entity type '{entity_type}' is not part of the model"
            )));
        };
        let names = self.model.key_names(type_id);
        if names.len() != key.len() {
            return Outcome::Err(Error::custom(format!(
                "'{entity_type}' has a key of {} value(s), {} given",
                names.len(),
                key.len()
            )));
        }

        if let Some(entry) = self.tracker.find(type_id, key).and_then(|id| self.tracker.entry(id)) {
            tracing::debug!("found in identity map");
            if entry.state() == EntityState::Deleted
                || !self.model.is_assignable_from(type_id, entry.entity_type())
            {
                return Outcome::Ok(ResultValue::NULL);
            }
            return Outcome::Ok(ResultValue::Entity {
                entry: Some(entry.id()),
                entity: entry.entity().clone(),
            });
        }

        let predicate = names
            .iter()
            .zip(key)
            .enumerate()
            .map(|(i, (name, value))| {
                Expr::param("e")
                    .property(name.as_str())
                    .eq(Expr::captured(format!("key_{i}"), value.clone()))
            })
            .reduce(Expr::and);
        let mut query = Query::from(entity_type);
        if let Some(predicate) = predicate {
            query = query.filter("e", predicate);
        }
        match self.query(cx, query.first_or_default()).await {
            Outcome::Ok(values) => Outcome::Ok(values.into_iter().next().unwrap_or(ResultValue::NULL)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    // ========================================================================
    // Saving
    // ========================================================================

    /// Write every pending change to the store.
    ///
    /// Runs in its own transaction unless one was begun with
    /// [`begin_transaction`](Self::begin_transaction). On success all
    /// changes are accepted and the number of entries written is returned;
    /// on failure the tracker is restored to its state before the save.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn save_changes(&mut self, cx: &Cx) -> Outcome<usize, Error> {
        if self.config.auto_detect_changes {
            if let Err(e) = self.tracker.detect_changes() {
                return Outcome::Err(e);
            }
        }
        let plan = match UpdatePlan::build(&self.tracker) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        if plan.is_empty() {
            tracing::debug!("nothing to save");
            return Outcome::Ok(0);
        }
        tracing::info!(
            entries = plan.entry_count(),
            commands = plan.commands().len(),
            "Saving changes"
        );

        let snapshot = self.tracker.snapshot();
        let own_transaction = !self.in_transaction;
        if own_transaction {
            match self.source.begin(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let options = SaveOptions {
            dialect: self.dialect(),
            max_batch_size: self.config.max_batch_size,
            sensitive_data_logging: self.config.sensitive_data_logging,
        };
        let outcome = update::execute(cx, &self.source, &mut self.tracker, &plan, options).await;
        let outcome = match outcome {
            Outcome::Ok(()) if own_transaction => self.source.commit(cx).await,
            other => other,
        };
        match outcome {
            Outcome::Ok(()) => {
                self.tracker.accept_all_changes();
                Outcome::Ok(plan.entry_count())
            }
            failed => {
                tracing::warn!("save failed, restoring tracked state");
                self.tracker.restore(snapshot);
                if own_transaction {
                    if let Outcome::Err(e) = self.source.rollback(cx).await {
                        tracing::warn!(error = %e, "rollback after failed save also failed");
                    }
                }
                match failed {
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                    Outcome::Ok(()) => Outcome::Ok(0),
                }
            }
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a transaction spanning several saves.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn begin_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            return Outcome::Err(Error::custom("a transaction is already active"));
        }
        tracing::info!("Beginning transaction");
        match self.source.begin(cx).await {
            Outcome::Ok(()) => {
                self.in_transaction = true;
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.in_transaction {
            return Outcome::Err(Error::custom("no active transaction"));
        }
        tracing::info!("Committing transaction");
        match self.source.commit(cx).await {
            Outcome::Ok(()) => {
                self.in_transaction = false;
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Roll back the active transaction. Tracked state is left as is.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn rollback_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.in_transaction {
            return Outcome::Err(Error::custom("no active transaction"));
        }
        tracing::info!("Rolling back transaction");
        self.in_transaction = false;
        self.source.rollback(cx).await
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    // ========================================================================
    // Debug
    // ========================================================================

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let (pending_new, pending_dirty, pending_delete) = self.tracker.pending_counts();
        SessionDebugInfo {
            tracked: self.tracker.len(),
            pending_new,
            pending_delete,
            pending_dirty,
            in_transaction: self.in_transaction,
        }
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDebugInfo {
    /// Total tracked entities.
    pub tracked: usize,
    /// Entities pending INSERT.
    pub pending_new: usize,
    /// Entities pending DELETE.
    pub pending_delete: usize,
    /// Entities pending UPDATE.
    pub pending_dirty: usize,
    /// Whether in a transaction.
    pub in_transaction: bool,
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_model::{Reply, ScriptedSource, outpost_model, unwrap_outcome};
    use asupersync::runtime::RuntimeBuilder;
    use asupersync::types::CancelKind;
    use relmap_core::{ConcurrencyError, DataSourceError, DataSourceErrorKind, Row};

    fn session(dialect: Dialect) -> Session<ScriptedSource> {
        Session::new(ScriptedSource::new(dialect), outpost_model())
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(future)
    }

    fn squad_rows() -> Vec<Row> {
        vec![
            Row::from_values(vec![Value::Int(1), Value::from("Delta")]),
            Row::from_values(vec![Value::Int(2), Value::from("Raven")]),
        ]
    }

    fn weapon() -> DynamicEntity {
        DynamicEntity::new("Weapon")
            .with("Id", 10)
            .with("Name", "Lancer")
            .with("Version", 1)
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.tracking, QueryTrackingBehavior::TrackAll);
        assert!(config.auto_detect_changes);
        assert_eq!(config.max_batch_size, 42);
        assert!(!config.sensitive_data_logging);

        let parsed: SessionConfig = serde_json::from_str(r#"{"max_batch_size": 1}"#).unwrap();
        assert_eq!(parsed.max_batch_size, 1);
        assert!(parsed.auto_detect_changes);
    }

    #[test]
    fn test_save_reads_back_generated_key() {
        let cx = Cx::for_testing();
        let mut s = session(Dialect::Postgres);
        s.source().push(Reply::Rows(vec![Row::from_values(vec![Value::Int(7)])]));
        let delta = s.add(DynamicEntity::new("Squad").with("Name", "Delta")).unwrap();

        let saved = block_on(s.save_changes(&cx));
        assert_eq!(unwrap_outcome(saved), 1);
        let entry = s.entry(delta).unwrap();
        assert_eq!(entry.state(), EntityState::Unchanged);
        assert_eq!(entry.current_value("Id"), Value::Int(7));
        assert_eq!(
            s.source().sql(),
            vec![
                "BEGIN".to_string(),
                r#"INSERT INTO "Squad" ("Name") VALUES ($1) RETURNING "Id""#.to_string(),
                "COMMIT".to_string(),
            ]
        );
        assert_eq!(s.debug_state().pending_new, 0);
    }

    #[test]
    fn test_save_without_returning_uses_last_insert_id() {
        let cx = Cx::for_testing();
        let mut s = session(Dialect::Mysql);
        s.source().push(Reply::Affected(1));
        s.source().push(Reply::Rows(vec![Row::from_values(vec![Value::BigInt(9)])]));
        let delta = s.add(DynamicEntity::new("Squad").with("Name", "Delta")).unwrap();

        unwrap_outcome(block_on(s.save_changes(&cx)));
        assert_eq!(s.entry(delta).unwrap().current_value("Id"), Value::BigInt(9));
        let sql = s.source().sql();
        assert_eq!(sql[1], "INSERT INTO `Squad` (`Name`) VALUES (?)");
        assert_eq!(sql[2], Dialect::Mysql.last_insert_id_sql());
    }

    #[test]
    fn test_concurrency_failure_restores_state_and_rolls_back() {
        let cx = Cx::for_testing();
        let mut s = session(Dialect::Postgres);
        s.source().push(Reply::Affected(0));
        let lancer = s.attach(weapon()).unwrap();
        s.set_value(lancer, "Name", "Retro Lancer").unwrap();

        let outcome = block_on(s.save_changes(&cx));
        let Outcome::Err(Error::Concurrency(ConcurrencyError { entries, actual_rows, .. })) = outcome else {
            panic!("expected a concurrency error");
        };
        assert_eq!(actual_rows, 0);
        assert_eq!(entries[0].entity_type, "Weapon");
        assert_eq!(s.entry(lancer).unwrap().state(), EntityState::Modified);
        assert_eq!(s.source().sql().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[test]
    fn test_find_prefers_identity_map() {
        let cx = Cx::for_testing();
        let mut s = session(Dialect::Sqlite);
        let delta = s
            .attach(DynamicEntity::new("Squad").with("Id", 1).with("Name", "Delta"))
            .unwrap();
        let found = unwrap_outcome(block_on(s.find(&cx, "Squad", &[Value::BigInt(1)])));
        assert_eq!(found.entry(), Some(delta));
        assert!(s.source().statements().is_empty());
    }

    #[test]
    fn test_find_queries_and_tracks() {
        let cx = Cx::for_testing();
        let mut s = session(Dialect::Sqlite);
        s.source().push(Reply::Rows(vec![Row::from_values(vec![
            Value::Int(2),
            Value::from("Raven"),
        ])]));
        let found = unwrap_outcome(block_on(s.find(&cx, "Squad", &[Value::Int(2)])));
        let entry = found.entry().unwrap();
        assert_eq!(found.as_entity().unwrap().get("Name"), Some(&Value::from("Raven")));
        let statements = s.source().statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].params[0], Value::Int(2));

        let again = unwrap_outcome(block_on(s.find(&cx, "Squad", &[Value::Int(2)])));
        assert_eq!(again.entry(), Some(entry));
        assert_eq!(s.source().statements().len(), 1);

        let missing = unwrap_outcome(block_on(s.find(&cx, "Squad", &[Value::Int(3)])));
        assert!(missing.is_null());
    }

    #[test]
    fn test_no_tracking_query_leaves_tracker_empty() {
        let cx = Cx::for_testing();
        let mut s = session(Dialect::Sqlite);
        s.source().push(Reply::Rows(vec![
            Row::from_values(vec![Value::Int(1), Value::from("Delta")]),
            Row::from_values(vec![Value::Int(2), Value::from("Raven")]),
        ]));
        let squads = unwrap_outcome(block_on(s.query_with(
            &cx,
            Query::from("Squad"),
            QueryTrackingBehavior::NoTracking,
        )));
        assert_eq!(squads.len(), 2);
        assert!(squads.iter().all(|v| v.entry().is_none()));
        assert!(s.tracker().is_empty());
    }

    #[test]
    fn test_user_transaction_spans_saves() {
        let cx = Cx::for_testing();
        let mut s = session(Dialect::Postgres);
        unwrap_outcome(block_on(s.begin_transaction(&cx)));
        assert!(s.in_transaction());
        let lancer = s.attach(weapon()).unwrap();
        s.set_value(lancer, "Name", "Retro Lancer").unwrap();
        assert_eq!(unwrap_outcome(block_on(s.save_changes(&cx))), 1);
        unwrap_outcome(block_on(s.commit_transaction(&cx)));

        let sql = s.source().sql();
        assert_eq!(sql.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(sql.iter().filter(|s| *s == "BEGIN").count(), 1);
        assert_eq!(sql.last().map(String::as_str), Some("COMMIT"));
        assert!(!s.in_transaction());
    }

    #[test]
    fn test_unbreakable_cycle_fails_before_touching_store() {
        let cx = Cx::for_testing();
        let mut s = session(Dialect::Postgres);
        let hive = s.add(DynamicEntity::new("Hive")).unwrap();
        let queen = s.add(DynamicEntity::new("Queen")).unwrap();
        let hive_id = s.entry(hive).unwrap().current_value("Id");
        let queen_id = s.entry(queen).unwrap().current_value("Id");
        s.set_value(hive, "QueenId", queen_id).unwrap();
        s.set_value(queen, "HiveId", hive_id).unwrap();

        let outcome = block_on(s.save_changes(&cx));
        assert!(matches!(outcome, Outcome::Err(Error::DependencyCycle(_))));
        assert!(s.source().statements().is_empty());
        assert_eq!(s.debug_state().pending_new, 2);
    }

    #[test]
    fn test_nothing_to_save() {
        let cx = Cx::for_testing();
        let mut s = session(Dialect::Postgres);
        s.attach(weapon()).unwrap();
        assert_eq!(unwrap_outcome(block_on(s.save_changes(&cx))), 0);
        assert!(s.source().statements().is_empty());
    }

    #[test]
    fn test_query_cancelled_by_source_yields_cancelled() {
        let cx = Cx::for_testing();
        let mut s = session(Dialect::Sqlite);
        s.source().push(Reply::Cancel(Box::new(Reply::Rows(squad_rows()))));

        let outcome = block_on(s.query(&cx, Query::from("Squad")));
        assert!(matches!(outcome, Outcome::Cancelled(_)));
        assert!(s.tracker().is_empty());
    }

    #[test]
    fn test_rows_materialized_before_cancel_stay_tracked() {
        let cx = Cx::for_testing();
        let mut s = session(Dialect::Sqlite);
        s.source().push(Reply::Rows(squad_rows()));
        let watcher = cx.clone();
        s.subscribe(move |_| watcher.cancel_with(CancelKind::User, Some("enough rows")));

        let outcome = block_on(s.query(&cx, Query::from("Squad")));
        assert!(matches!(outcome, Outcome::Cancelled(_)));
        assert_eq!(s.tracker().len(), 1);
        let delta = s.entries().next().unwrap();
        assert_eq!(delta.state(), EntityState::Unchanged);
        assert_eq!(delta.current_value("Name"), Value::from("Delta"));
    }

    #[test]
    fn test_save_cancelled_between_batches_rolls_back() {
        let cx = Cx::for_testing();
        let config = SessionConfig {
            max_batch_size: 1,
            ..SessionConfig::default()
        };
        let mut s = Session::with_config(ScriptedSource::new(Dialect::Postgres), outpost_model(), config);
        s.source().push(Reply::Cancel(Box::new(Reply::Affected(1))));
        let lancer = s.attach(weapon()).unwrap();
        let hammer = s
            .attach(DynamicEntity::new("Weapon").with("Id", 11).with("Name", "Hammer").with("Version", 1))
            .unwrap();
        s.set_value(lancer, "Name", "Retro Lancer").unwrap();
        s.set_value(hammer, "Name", "Hammerburst").unwrap();

        let outcome = block_on(s.save_changes(&cx));
        assert!(matches!(outcome, Outcome::Cancelled(_)));
        let sql = s.source().sql();
        assert_eq!(sql.len(), 3);
        assert_eq!(sql[0], "BEGIN");
        assert!(sql[1].starts_with(r#"UPDATE "Weapon""#));
        assert_eq!(sql[2], "ROLLBACK");
        for id in [lancer, hammer] {
            assert_eq!(s.entry(id).unwrap().state(), EntityState::Modified);
        }
        assert_eq!(s.entry(lancer).unwrap().current_value("Name"), Value::from("Retro Lancer"));
        assert_eq!(s.debug_state().pending_dirty, 2);
    }

    #[test]
    fn test_source_failure_is_wrapped_and_state_restored() {
        let cx = Cx::for_testing();
        let source = ScriptedSource::new(Dialect::Postgres).reply(Reply::Fail(
            DataSourceError::new(DataSourceErrorKind::Constraint, "duplicate key value").into(),
        ));
        let mut s = Session::new(source, outpost_model());
        let delta = s.add(DynamicEntity::new("Squad").with("Name", "Delta")).unwrap();
        let temporary = s.entry(delta).unwrap().current_value("Id");

        let outcome = block_on(s.save_changes(&cx));
        let Outcome::Err(Error::DataSource(e)) = outcome else {
            panic!("expected a data source error");
        };
        assert_eq!(e.kind, DataSourceErrorKind::Constraint);
        assert_eq!(e.entity_type.as_deref(), Some("Squad"));
        assert_eq!(e.entries.len(), 1);
        assert!(e.sql.as_deref().is_some_and(|sql| sql.starts_with(r#"INSERT INTO "Squad""#)));
        let entry = s.entry(delta).unwrap();
        assert_eq!(entry.state(), EntityState::Added);
        assert_eq!(entry.current_value("Id"), temporary);
        assert_eq!(s.source().sql().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[test]
    fn test_short_row_is_a_materialization_error() {
        let cx = Cx::for_testing();
        let mut s = session(Dialect::Sqlite);
        s.source().push(Reply::Rows(vec![Row::from_values(vec![Value::Int(1)])]));

        let outcome = block_on(s.query(&cx, Query::from("Squad")));
        let Outcome::Err(Error::Materialization(e)) = outcome else {
            panic!("expected a materialization error");
        };
        assert!(e.to_string().contains("projects 2"));
        assert!(s.tracker().is_empty());
    }
}
