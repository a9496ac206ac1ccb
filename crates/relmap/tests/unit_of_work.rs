mod common;

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use common::{Reply, ScriptedSource, entity_row, outpost_model, unwrap_outcome};
use relmap::prelude::*;
use relmap::{DataSourceError, DataSourceErrorKind};

fn weapon_row(s: &Session<ScriptedSource>, id: i32, name: &str, version: i32) -> Row {
    let compiled = s.compile(Query::from("Weapon")).unwrap();
    entity_row(
        s.model(),
        &compiled,
        &[(
            "",
            &[
                ("Id", Value::Int(id)),
                ("Name", Value::from(name)),
                ("Version", Value::Int(version)),
            ],
        )],
    )
}

#[test]
fn second_writer_gets_concurrency_error() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let source = ScriptedSource::new(Dialect::Postgres);
        let mut first = Session::new(source.clone(), outpost_model());
        let mut second = Session::new(source.clone(), outpost_model());

        source.push(Reply::Rows(vec![weapon_row(&first, 10, "Lancer", 1)]));
        let a = unwrap_outcome(first.find(&cx, "Weapon", &[Value::Int(10)]).await).entry().unwrap();
        source.push(Reply::Rows(vec![weapon_row(&second, 10, "Lancer", 1)]));
        let b = unwrap_outcome(second.find(&cx, "Weapon", &[Value::Int(10)]).await).entry().unwrap();

        first.set_value(a, "Name", "Retro Lancer").unwrap();
        first.set_value(a, "Version", 2).unwrap();
        source.push(Reply::Affected(1));
        assert_eq!(unwrap_outcome(first.save_changes(&cx).await), 1);

        // The row no longer carries version 1.
        second.set_value(b, "Name", "Longshot").unwrap();
        source.push(Reply::Affected(0));
        let outcome = second.save_changes(&cx).await;
        let Outcome::Err(Error::Concurrency(e)) = outcome else {
            panic!("expected a concurrency error, got {outcome:?}");
        };
        assert_eq!(e.expected_rows, 1);
        assert_eq!(e.actual_rows, 0);
        assert_eq!(e.entries[0].entity_type, "Weapon");
        assert_eq!(second.entry(b).unwrap().state(), EntityState::Modified);

        let sql = source.sql();
        let updates: Vec<_> = sql.iter().filter(|s| s.starts_with("UPDATE")).collect();
        assert_eq!(updates.len(), 2);
        assert!(updates[1].ends_with(r#"WHERE "Id" = $2 AND "Version" = $3"#), "{}", updates[1]);
        assert_eq!(sql.last().map(String::as_str), Some("ROLLBACK"));
    });
}

#[test]
fn commands_are_batched_up_to_the_limit() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let config = SessionConfig {
            max_batch_size: 2,
            ..SessionConfig::default()
        };
        let mut s = Session::with_config(ScriptedSource::new(Dialect::Sqlite), outpost_model(), config);
        for id in 1..=3 {
            let e = s
                .attach(
                    DynamicEntity::new("Weapon")
                        .with("Id", id)
                        .with("Name", "Lancer")
                        .with("Version", 1),
                )
                .unwrap();
            s.set_value(e, "Name", format!("Lancer Mk {id}")).unwrap();
        }
        assert_eq!(unwrap_outcome(s.save_changes(&cx).await), 3);
        assert_eq!(s.source().batches(), vec![2, 1]);
        assert_eq!(s.debug_state().pending_dirty, 0);
    });
}

#[test]
fn store_failure_names_the_entity_and_restores_state() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut s = session_with_gear();
        s.source().push(Reply::Fail(
            DataSourceError::new(DataSourceErrorKind::Constraint, "duplicate key value").into(),
        ));
        let outcome = s.save_changes(&cx).await;
        let Outcome::Err(Error::DataSource(e)) = outcome else {
            panic!("expected a data source error, got {outcome:?}");
        };
        assert_eq!(e.kind, DataSourceErrorKind::Constraint);
        assert_eq!(e.entity_type.as_deref(), Some("Gear"));
        assert_eq!(e.property.as_deref(), Some("Nickname"));
        assert_eq!(e.entries.len(), 1);
        assert_eq!(s.debug_state().pending_new, 1);
        assert!(!s.in_transaction());
    });
}

#[test]
fn deleting_a_principal_cascades_and_orders_deletes() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut s = Session::new(ScriptedSource::new(Dialect::Postgres), outpost_model());
        let delta = s
            .attach(DynamicEntity::new("Squad").with("Id", 1).with("Name", "Delta"))
            .unwrap();
        let marcus = s
            .attach(
                DynamicEntity::new("Gear")
                    .with("Nickname", "Marcus")
                    .with("SquadId", 1)
                    .with("Rank", 4),
            )
            .unwrap();
        s.delete(delta).unwrap();
        assert_eq!(s.entry(marcus).unwrap().state(), EntityState::Deleted);

        assert_eq!(unwrap_outcome(s.save_changes(&cx).await), 2);
        let sql = s.source().sql();
        assert_eq!(
            sql,
            vec![
                "BEGIN".to_string(),
                r#"DELETE FROM "Gear" WHERE "Nickname" = $1 AND "SquadId" = $2"#.to_string(),
                r#"DELETE FROM "Squad" WHERE "Id" = $1"#.to_string(),
                "COMMIT".to_string(),
            ]
        );
        assert!(s.tracker().is_empty());
    });
}

fn session_with_gear() -> Session<ScriptedSource> {
    let mut s = Session::new(ScriptedSource::new(Dialect::Postgres), outpost_model());
    s.add(
        DynamicEntity::new("Gear")
            .with("Nickname", "Dom")
            .with("SquadId", 1)
            .with("FullName", "Dominic Santiago")
            .with("Rank", 2),
    )
    .unwrap();
    s
}
