#![allow(dead_code)]

use asupersync::{Cx, Outcome};
use relmap::prelude::*;
use relmap::{CompiledQuery, Model};
use relmap_query::ResultShape;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// Squads and their gears (officers share the gear table), weapons with a
/// concurrency token, and missions with an interval duration.
pub fn outpost_model() -> FinalizedModel {
    let mut mb = ModelBuilder::new();

    let squad = mb.entity("Squad").unwrap();
    mb.property(squad, "Id", SqlType::Integer).unwrap();
    mb.property(squad, "Name", SqlType::Text).unwrap();

    let gear = mb.entity("Gear").unwrap();
    mb.property(gear, "Nickname", SqlType::Text).unwrap();
    mb.property(gear, "SquadId", SqlType::Integer).unwrap();
    mb.property(gear, "FullName", SqlType::Text).unwrap();
    mb.property(gear, "Rank", SqlType::Integer).unwrap();
    mb.has_key(gear, &["Nickname", "SquadId"]).unwrap();
    mb.navigation(gear, "Squad", squad, Cardinality::One).unwrap();
    mb.navigation(squad, "Members", gear, Cardinality::Many).unwrap();

    let officer = mb.entity("Officer").unwrap();
    mb.set_base_type(officer, Some(gear), ConfigurationSource::Explicit).unwrap();

    let weapon = mb.entity("Weapon").unwrap();
    mb.property(weapon, "Id", SqlType::Integer).unwrap();
    mb.property(weapon, "Name", SqlType::Text).unwrap();
    let version = mb.property(weapon, "Version", SqlType::Integer).unwrap();
    mb.set_concurrency_token(version, true, ConfigurationSource::Explicit).unwrap();
    mb.property(weapon, "OwnerNickname", SqlType::Text).unwrap();
    let owner_squad = mb.property(weapon, "OwnerSquadId", SqlType::Integer).unwrap();
    mb.set_nullable(owner_squad, true, ConfigurationSource::Explicit).unwrap();
    let owner = mb.navigation(weapon, "Owner", gear, Cardinality::One).unwrap();
    mb.has_foreign_key(owner, &["OwnerNickname", "OwnerSquadId"]).unwrap();

    let mission = mb.entity("Mission").unwrap();
    mb.property(mission, "Id", SqlType::Integer).unwrap();
    mb.property(mission, "CodeName", SqlType::Text).unwrap();
    mb.property(mission, "Duration", SqlType::Interval).unwrap();

    mb.finalize().unwrap()
}

/// What the scripted source answers to the next statement.
#[derive(Debug)]
pub enum Reply {
    Rows(Vec<Row>),
    Affected(u64),
    Fail(Error),
}

#[derive(Debug, Default)]
struct Script {
    replies: Mutex<VecDeque<Reply>>,
    log: Mutex<Vec<Statement>>,
    batches: Mutex<Vec<usize>>,
}

/// A scripted data source; clones share one script, so several sessions
/// can talk to "the same database".
///
/// Without a scripted reply queries return no rows and statements affect
/// one row.
#[derive(Debug, Clone)]
pub struct ScriptedSource {
    dialect: Dialect,
    script: Arc<Script>,
}

impl ScriptedSource {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            script: Arc::new(Script::default()),
        }
    }

    pub fn push(&self, reply: Reply) {
        self.script.replies.lock().unwrap().push_back(reply);
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.script.log.lock().unwrap().clone()
    }

    pub fn sql(&self) -> Vec<String> {
        self.statements().into_iter().map(|s| s.sql).collect()
    }

    /// Sizes of the batches sent through `execute_batch`.
    pub fn batches(&self) -> Vec<usize> {
        self.script.batches.lock().unwrap().clone()
    }

    fn next(&self, sql: &str, params: &[Value]) -> Option<Reply> {
        self.script.log.lock().unwrap().push(Statement::new(sql, params.to_vec()));
        self.script.replies.lock().unwrap().pop_front()
    }

    fn affected(&self, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        match self.next(sql, params) {
            Some(Reply::Affected(n)) => Outcome::Ok(n),
            Some(Reply::Fail(e)) => Outcome::Err(e),
            Some(Reply::Rows(_)) | None => Outcome::Ok(1),
        }
    }
}

impl DataSource for ScriptedSource {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(&self, _cx: &Cx, sql: &str, params: &[Value]) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let outcome = match self.next(sql, params) {
            Some(Reply::Rows(rows)) => Outcome::Ok(rows),
            Some(Reply::Fail(e)) => Outcome::Err(e),
            Some(Reply::Affected(_)) | None => Outcome::Ok(Vec::new()),
        };
        std::future::ready(outcome)
    }

    fn execute(&self, _cx: &Cx, sql: &str, params: &[Value]) -> impl Future<Output = Outcome<u64, Error>> + Send {
        std::future::ready(self.affected(sql, params))
    }

    fn execute_batch(
        &self,
        _cx: &Cx,
        statements: &[Statement],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        self.script.batches.lock().unwrap().push(statements.len());
        let mut counts = Vec::with_capacity(statements.len());
        let mut failure = None;
        for stmt in statements {
            match self.affected(&stmt.sql, &stmt.params) {
                Outcome::Ok(n) => counts.push(n),
                Outcome::Err(e) => {
                    failure = Some(e);
                    break;
                }
                Outcome::Cancelled(_) | Outcome::Panicked(_) => break,
            }
        }
        std::future::ready(match failure {
            Some(e) => Outcome::Err(e),
            None => Outcome::Ok(counts),
        })
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.script.log.lock().unwrap().push(Statement::new("BEGIN", Vec::new()));
        std::future::ready(Outcome::Ok(()))
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.script.log.lock().unwrap().push(Statement::new("COMMIT", Vec::new()));
        std::future::ready(Outcome::Ok(()))
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.script.log.lock().unwrap().push(Statement::new("ROLLBACK", Vec::new()));
        std::future::ready(Outcome::Ok(()))
    }
}

/// A result row for `compiled` with the given property values for the
/// entity at `field` ("" for an entity query, else an object field).
pub fn entity_row(model: &Model, compiled: &CompiledQuery, entities: &[(&str, &[(&str, Value)])]) -> Row {
    let mut values = vec![Value::Null; compiled.select.projection.len()];
    for (field, properties) in entities {
        let shape = match (&compiled.shape, *field) {
            (ResultShape::Entity(e), "") => e,
            (ResultShape::Object(fields), name) => match fields.iter().find(|(n, _)| n == name) {
                Some((_, ResultShape::Entity(e))) => e,
                _ => panic!("no entity at '{name}'"),
            },
            _ => panic!("no entity at '{field}'"),
        };
        for (p, index) in &shape.properties {
            let name = model.property_name(*p);
            if let Some((_, v)) = properties.iter().find(|(n, _)| *n == name) {
                values[*index] = v.clone();
            }
        }
    }
    Row::from_values(values)
}
