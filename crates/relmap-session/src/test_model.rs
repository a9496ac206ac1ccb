use relmap_core::{Cx, DataSource, Dialect, Error, Outcome, Row, SqlType, Statement, Value};
use relmap_metadata::{
    Cardinality, ConfigurationSource, FinalizedModel, MappingStrategy, ModelBuilder,
};
use asupersync::types::CancelKind;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;

/// Squads with gears (`Officer` shares the `Gear` table), weapons carrying a
/// concurrency token, vehicles stored one table per type, and two pairs of
/// mutually dependent types: factions and leaders (one side optional) and
/// hives and queens (both sides required).
pub(crate) fn outpost_model() -> FinalizedModel {
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
    mb.property(weapon, "OwnerNickname", SqlType::Text).unwrap();
    let owner_squad = mb.property(weapon, "OwnerSquadId", SqlType::Integer).unwrap();
    mb.set_nullable(owner_squad, true, ConfigurationSource::Explicit).unwrap();
    let version = mb.property(weapon, "Version", SqlType::Integer).unwrap();
    mb.set_concurrency_token(version, true, ConfigurationSource::Explicit).unwrap();
    let owner = mb.navigation(weapon, "Owner", gear, Cardinality::One).unwrap();
    mb.has_foreign_key(owner, &["OwnerNickname", "OwnerSquadId"]).unwrap();

    let vehicle = mb.entity("Vehicle").unwrap();
    mb.property(vehicle, "Id", SqlType::Integer).unwrap();
    mb.property(vehicle, "Name", SqlType::Text).unwrap();
    let tank = mb.entity("Tank").unwrap();
    mb.set_base_type(tank, Some(vehicle), ConfigurationSource::Explicit).unwrap();
    mb.property(tank, "Armor", SqlType::Integer).unwrap();
    mb.use_mapping_strategy(vehicle, MappingStrategy::TablePerType).unwrap();

    let faction = mb.entity("Faction").unwrap();
    mb.property(faction, "Id", SqlType::Integer).unwrap();
    let leader_id = mb.property(faction, "LeaderId", SqlType::Integer).unwrap();
    mb.set_nullable(leader_id, true, ConfigurationSource::Explicit).unwrap();
    let leader = mb.entity("Leader").unwrap();
    mb.property(leader, "Id", SqlType::Integer).unwrap();
    let faction_id = mb.property(leader, "FactionId", SqlType::Integer).unwrap();
    mb.add_foreign_key(faction, &[leader_id], leader, None, ConfigurationSource::Explicit)
        .unwrap();
    mb.add_foreign_key(leader, &[faction_id], faction, None, ConfigurationSource::Explicit)
        .unwrap();

    let hive = mb.entity("Hive").unwrap();
    mb.property(hive, "Id", SqlType::Integer).unwrap();
    let queen_id = mb.property(hive, "QueenId", SqlType::Integer).unwrap();
    let queen = mb.entity("Queen").unwrap();
    mb.property(queen, "Id", SqlType::Integer).unwrap();
    let hive_id = mb.property(queen, "HiveId", SqlType::Integer).unwrap();
    mb.add_foreign_key(hive, &[queen_id], queen, None, ConfigurationSource::Explicit)
        .unwrap();
    mb.add_foreign_key(queen, &[hive_id], hive, None, ConfigurationSource::Explicit)
        .unwrap();

    mb.finalize().unwrap()
}

/// What the scripted source answers to the next statement.
#[derive(Debug)]
pub(crate) enum Reply {
    Rows(Vec<Row>),
    Affected(u64),
    Fail(Error),
    /// Cancel the caller's context, then answer with the inner reply.
    Cancel(Box<Reply>),
}

/// A data source answering from a script and logging every statement.
///
/// Without a scripted reply queries return no rows and statements affect
/// one row.
#[derive(Debug)]
pub(crate) struct ScriptedSource {
    dialect: Dialect,
    replies: Mutex<VecDeque<Reply>>,
    log: Mutex<Vec<Statement>>,
}

impl ScriptedSource {
    pub(crate) fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            replies: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn reply(self, reply: Reply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub(crate) fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub(crate) fn statements(&self) -> Vec<Statement> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn sql(&self) -> Vec<String> {
        self.statements().into_iter().map(|s| s.sql).collect()
    }

    fn next(&self, cx: &Cx, sql: &str, params: &[Value]) -> Option<Reply> {
        self.log.lock().unwrap().push(Statement::new(sql, params.to_vec()));
        match self.replies.lock().unwrap().pop_front() {
            Some(Reply::Cancel(inner)) => {
                cx.cancel_with(CancelKind::User, Some("scripted cancel"));
                Some(*inner)
            }
            other => other,
        }
    }
}

impl DataSource for ScriptedSource {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(&self, cx: &Cx, sql: &str, params: &[Value]) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let outcome = match self.next(cx, sql, params) {
            Some(Reply::Rows(rows)) => Outcome::Ok(rows),
            Some(Reply::Fail(e)) => Outcome::Err(e),
            Some(Reply::Affected(_) | Reply::Cancel(_)) | None => Outcome::Ok(Vec::new()),
        };
        std::future::ready(outcome)
    }

    fn execute(&self, cx: &Cx, sql: &str, params: &[Value]) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = match self.next(cx, sql, params) {
            Some(Reply::Affected(n)) => Outcome::Ok(n),
            Some(Reply::Fail(e)) => Outcome::Err(e),
            Some(Reply::Rows(_) | Reply::Cancel(_)) | None => Outcome::Ok(1),
        };
        std::future::ready(outcome)
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.log.lock().unwrap().push(Statement::new("BEGIN", Vec::new()));
        std::future::ready(Outcome::Ok(()))
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.log.lock().unwrap().push(Statement::new("COMMIT", Vec::new()));
        std::future::ready(Outcome::Ok(()))
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.log.lock().unwrap().push(Statement::new("ROLLBACK", Vec::new()));
        std::future::ready(Outcome::Ok(()))
    }
}

pub(crate) fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}
