mod common;

use asupersync::runtime::RuntimeBuilder;
use asupersync::Cx;
use common::{Reply, ScriptedSource, entity_row, outpost_model, unwrap_outcome};
use relmap::prelude::*;

fn session(dialect: Dialect) -> Session<ScriptedSource> {
    Session::new(ScriptedSource::new(dialect), outpost_model())
}

#[derive(Debug, PartialEq)]
struct Squad {
    id: i64,
    name: String,
}

impl Entity for Squad {
    const TYPE_NAME: &'static str = "Squad";

    fn to_dynamic(&self) -> DynamicEntity {
        DynamicEntity::new(Self::TYPE_NAME)
            .with("Id", self.id)
            .with("Name", self.name.as_str())
    }

    fn from_dynamic(entity: &DynamicEntity) -> Result<Self> {
        let id = entity
            .get("Id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::custom("Squad without Id"))?;
        let name = entity.get("Name").and_then(Value::as_str).unwrap_or_default().to_string();
        Ok(Self { id, name })
    }
}

#[test]
fn generated_key_round_trips_through_save_and_query() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut s = session(Dialect::Postgres);
        let delta = s.add(DynamicEntity::new("Squad").with("Name", "Delta")).unwrap();
        assert_eq!(s.entry(delta).unwrap().state(), EntityState::Added);

        s.source().push(Reply::Rows(vec![Row::from_values(vec![Value::Int(7)])]));
        assert_eq!(unwrap_outcome(s.save_changes(&cx).await), 1);
        assert_eq!(s.entry(delta).unwrap().current_value("Id"), Value::Int(7));

        // The same row read back resolves to the tracked instance.
        let compiled = s.compile(Query::from("Squad")).unwrap();
        let row = entity_row(
            s.model(),
            &compiled,
            &[("", &[("Id", Value::Int(7)), ("Name", Value::from("Delta"))])],
        );
        s.source().push(Reply::Rows(vec![row]));
        let squads = unwrap_outcome(s.query(&cx, Query::from("Squad")).await);
        assert_eq!(squads.len(), 1);
        assert_eq!(squads[0].entry(), Some(delta));
        assert_eq!(s.tracker().len(), 1);

        s.set_value(delta, "Name", "Delta Squad").unwrap();
        assert_eq!(unwrap_outcome(s.save_changes(&cx).await), 1);
        let statements = s.source().statements();
        let update = &statements[statements.len() - 2];
        assert_eq!(update.sql, r#"UPDATE "Squad" SET "Name" = $1 WHERE "Id" = $2"#);
        assert_eq!(update.params, vec![Value::from("Delta Squad"), Value::Int(7)]);
        assert_eq!(s.entry(delta).unwrap().state(), EntityState::Unchanged);
    });
}

#[test]
fn detect_changes_is_idempotent() {
    let mut s = session(Dialect::Sqlite);
    let lancer = s
        .attach(
            DynamicEntity::new("Weapon")
                .with("Id", 1)
                .with("Name", "Lancer")
                .with("Version", 1),
        )
        .unwrap();

    assert_eq!(s.detect_changes().unwrap(), 0);
    s.set_value(lancer, "Name", "Retro Lancer").unwrap();
    assert_eq!(s.detect_changes().unwrap(), 1);
    assert_eq!(s.detect_changes().unwrap(), 0);
    assert_eq!(s.entry(lancer).unwrap().state(), EntityState::Modified);

    s.set_value(lancer, "Name", "Lancer").unwrap();
    assert_eq!(s.detect_changes().unwrap(), 1);
    assert_eq!(s.detect_changes().unwrap(), 0);
    assert_eq!(s.entry(lancer).unwrap().state(), EntityState::Unchanged);
}

#[test]
fn joined_principal_is_materialized_once() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut s = session(Dialect::Postgres);
        let query = || {
            Query::from("Weapon").select(
                "w",
                Expr::new_object([
                    ("weapon", Expr::param("w")),
                    ("owner", Expr::param("w").member("Owner")),
                ]),
            )
        };
        let compiled = s.compile(query()).unwrap();
        let marcus: &[(&str, Value)] = &[
            ("Nickname", Value::from("Marcus")),
            ("SquadId", Value::Int(1)),
            ("Rank", Value::Int(4)),
            ("Discriminator", Value::from("Officer")),
        ];
        let rows: Vec<Row> = [(1, "Lancer"), (2, "Gnasher")]
            .into_iter()
            .map(|(id, name)| {
                let weapon: &[(&str, Value)] = &[
                    ("Id", Value::Int(id)),
                    ("Name", Value::from(name)),
                    ("Version", Value::Int(1)),
                    ("OwnerNickname", Value::from("Marcus")),
                    ("OwnerSquadId", Value::Int(1)),
                ];
                entity_row(s.model(), &compiled, &[("weapon", weapon), ("owner", marcus)])
            })
            .collect();

        s.source().push(Reply::Rows(rows.clone()));
        let tracked = unwrap_outcome(s.query(&cx, query()).await);
        let owners: Vec<_> = tracked.iter().map(|r| r.field("owner").unwrap().entry()).collect();
        assert!(owners[0].is_some());
        assert_eq!(owners[0], owners[1]);
        assert_eq!(
            tracked[0].field("owner").unwrap().as_entity().unwrap().entity_type(),
            "Officer"
        );
        assert_eq!(s.tracker().len(), 3);

        let mut untracked = session(Dialect::Postgres);
        untracked.source().push(Reply::Rows(rows));
        let resolved = unwrap_outcome(
            untracked
                .query_with(&cx, query(), QueryTrackingBehavior::NoTrackingWithIdentityResolution)
                .await,
        );
        assert_eq!(resolved[0].field("owner"), resolved[1].field("owner"));
        assert!(untracked.tracker().is_empty());
    });
}

#[test]
fn typed_entities_convert_from_results() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut s = session(Dialect::Sqlite);
        let compiled = s.compile(Query::from("Squad")).unwrap();
        let rows = vec![
            entity_row(s.model(), &compiled, &[("", &[("Id", Value::Int(1)), ("Name", Value::from("Delta"))])]),
            entity_row(s.model(), &compiled, &[("", &[("Id", Value::Int(2)), ("Name", Value::from("Raven"))])]),
        ];
        s.source().push(Reply::Rows(rows));
        let squads: Vec<Squad> = unwrap_outcome(s.query_as(&cx, Query::from("Squad")).await);
        assert_eq!(
            squads,
            vec![
                Squad { id: 1, name: "Delta".to_string() },
                Squad { id: 2, name: "Raven".to_string() },
            ]
        );

        let id = s
            .add_entity(&Squad {
                id: 3,
                name: "Kilo".to_string(),
            })
            .unwrap();
        assert_eq!(s.entry(id).unwrap().state(), EntityState::Added);
        assert_eq!(s.debug_state().pending_new, 1);
    });
}
