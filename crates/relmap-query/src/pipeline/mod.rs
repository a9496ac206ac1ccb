//! The translation pipeline.
//!
//! A [`Query`] goes through six stages, each consuming the output of the one
//! before:
//!
//! 1. navigation expansion ([`navigation`]): lambda parameters become table
//!    sources, member chains over navigations become joins or correlated
//!    subqueries;
//! 2. shape binding: the selector is split into entities, scalars, objects
//!    and collections;
//! 3. lowering: predicates and projections become relational expressions,
//!    with client evaluation where the store has no equivalent;
//! 4. the identifying-column check for Distinct/GroupBy collections;
//! 5. discriminator injection for single-table hierarchies;
//! 6. the client-evaluation check.

mod client_eval;
mod discriminator;
mod identifying;
mod lowering;
mod methods;
pub mod navigation;
mod shape;

#[cfg(test)]
pub(crate) mod test_model;

use crate::client::ClientFunctions;
use crate::query::Query;
use crate::result::CompiledQuery;
use navigation::NavigationExpander;
use relmap_core::TranslationError;
use relmap_metadata::Model;

/// Translates queries against one finalized model.
#[derive(Debug, Clone)]
pub struct QueryCompiler<'m> {
    model: &'m Model,
    functions: ClientFunctions,
}

impl<'m> QueryCompiler<'m> {
    /// A compiler with the built-in client functions.
    pub fn new(model: &'m Model) -> Self {
        Self::with_client_functions(model, ClientFunctions::with_builtins())
    }

    pub fn with_client_functions(model: &'m Model, functions: ClientFunctions) -> Self {
        Self { model, functions }
    }

    /// Functions available to client-evaluated projections.
    pub fn client_functions(&self) -> &ClientFunctions {
        &self.functions
    }

    /// Translate `query`.
    ///
    /// # Errors
    ///
    /// A [`TranslationError`] when some construct can be evaluated neither
    /// by the store nor on the client, when a Distinct/GroupBy collection
    /// drops an identifying column, or when a store aggregate is applied to
    /// a client-evaluated value.
    #[tracing::instrument(level = "debug", skip(self, query), fields(query = %query))]
    pub fn compile(&self, query: Query) -> Result<CompiledQuery, TranslationError> {
        let mut expander = NavigationExpander::new(self.model);
        let expanded = expander.expand(query)?;
        let mut lowered = lowering::Lowerer::new(self.model, &self.functions, expander.into_aliases()).lower(&expanded)?;
        identifying::check(&lowered.identifying)?;
        discriminator::apply(self.model, &mut lowered);
        let compiled = client_eval::finish(lowered)?;
        tracing::debug!(
            target: "relmap::query",
            splits = compiled.splits.len(),
            columns = compiled.select.projection.len(),
            "query compiled"
        );
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::result::{ConcreteType, ResultShape};
    use crate::sql::SqlRenderer;
    use relmap_core::{Dialect, TranslationErrorKind, Value};

    fn compile(query: Query) -> Result<CompiledQuery, TranslationError> {
        let model = test_model::gears_model();
        QueryCompiler::new(&model).compile(query)
    }

    fn pg(compiled: &CompiledQuery) -> String {
        compiled.statement(&SqlRenderer::new(Dialect::Postgres)).sql
    }

    #[test]
    fn test_distinct_collection_without_key_fails() {
        let weapons = Query::over(Expr::param("g").member("Weapons"))
            .select("w", Expr::param("w").member("Name"))
            .distinct();
        let err = compile(Query::from("Gear").select("g", Expr::subquery(weapons))).unwrap_err();
        assert_eq!(
            err.kind,
            TranslationErrorKind::IdentifyingColumnMissing {
                column: "w.Id".to_string()
            }
        );
    }

    #[test]
    fn test_distinct_collection_with_partial_composite_key_fails() {
        let squads = Query::over(Expr::param("m").member("ParticipatingSquads"))
            .select("s", Expr::param("s").member("SquadId"))
            .distinct();
        let err = compile(Query::from("Mission").select("m", Expr::subquery(squads))).unwrap_err();
        assert_eq!(
            err.kind,
            TranslationErrorKind::IdentifyingColumnMissing {
                column: "s.MissionId".to_string()
            }
        );
    }

    #[test]
    fn test_grouped_collection_with_partial_composite_key_fails() {
        let squads = Query::over(Expr::param("m").member("ParticipatingSquads"))
            .select("s", Expr::param("s").member("SquadId"))
            .group_by("x", Expr::param("x"))
            .select(
                "grp",
                Expr::new_object([
                    ("Key", Expr::param("grp").member("Key")),
                    ("Count", Expr::param("grp").call("Count", vec![])),
                ]),
            );
        let err = compile(Query::from("Mission").select("m", Expr::subquery(squads))).unwrap_err();
        assert_eq!(
            err.kind,
            TranslationErrorKind::IdentifyingColumnMissing {
                column: "s.MissionId".to_string()
            }
        );
    }

    #[test]
    fn test_grouped_members_need_the_full_gear_key() {
        let members = Query::over(Expr::param("s").member("Members"))
            .group_by("g", Expr::param("g").member("Rank"))
            .select("grp", Expr::param("grp").member("Key"));
        let err = compile(Query::from("Squad").select("s", Expr::subquery(members))).unwrap_err();
        assert_eq!(
            err.kind,
            TranslationErrorKind::IdentifyingColumnMissing {
                column: "g.Nickname".to_string()
            }
        );
    }

    #[test]
    fn test_distinct_collection_of_entities_is_fine() {
        let weapons = Query::over(Expr::param("g").member("Weapons")).distinct();
        let compiled = compile(Query::from("Gear").select("g", Expr::subquery(weapons))).unwrap();
        assert_eq!(compiled.splits.len(), 1);
        assert_eq!(compiled.shape, ResultShape::Collection(0));
    }

    #[test]
    fn test_sum_over_client_value_fails() {
        let q = Query::from("Mission").sum("m", Expr::param("m").member("Duration").member("Ticks"));
        let err = compile(q).unwrap_err();
        assert_eq!(
            err.kind,
            TranslationErrorKind::AggregateOverClientEvaluation {
                aggregate: "Sum".to_string()
            }
        );
    }

    #[test]
    fn test_client_projection_compiles() {
        let q = Query::from("Mission").select("m", Expr::param("m").member("Duration").member("Ticks"));
        let compiled = compile(q).unwrap();
        assert!(compiled.shape.has_client_evaluation());
        assert_eq!(pg(&compiled), r#"SELECT "m"."Duration" FROM "Mission" AS "m""#);
    }

    #[test]
    fn test_every_failure_is_reported() {
        let q = Query::from("Gear")
            .filter("g", Expr::param("g").member("IsMarcus"))
            .order_by("g", Expr::param("g").member("FullName").call("PadLeft", vec![Expr::constant(3)]));
        let err = compile(q).unwrap_err();
        assert_eq!(
            err.kind,
            TranslationErrorKind::Unsupported {
                construct: "Gear.IsMarcus".to_string()
            }
        );
        assert_eq!(err.details.len(), 1);
        assert!(err.details[0].starts_with("'PadLeft'"), "{:?}", err.details);
    }

    #[test]
    fn test_unknown_client_function_in_projection_fails() {
        let q = Query::from("Gear").select("g", Expr::param("g").member("FullName").call("Frobnicate", vec![]));
        let err = compile(q).unwrap_err();
        assert_eq!(
            err.kind,
            TranslationErrorKind::Unsupported {
                construct: "Frobnicate".to_string()
            }
        );
    }

    #[test]
    fn test_reference_navigation_joins_once() {
        let q = Query::from("Weapon").select(
            "w",
            Expr::new_object([
                ("Owner", Expr::param("w").member("Owner").member("FullName")),
                ("Rank", Expr::param("w").member("Owner").member("Rank")),
            ]),
        );
        let sql = pg(&compile(q).unwrap());
        assert_eq!(sql.matches("JOIN").count(), 1, "{sql}");
        assert!(sql.contains(r#"LEFT JOIN "Gear" AS "g" ON "g"."Nickname" = "w"."OwnerNickname" AND "g"."SquadId" = "w"."OwnerSquadId""#), "{sql}");
    }

    #[test]
    fn test_derived_type_is_filtered_by_discriminator() {
        let compiled = compile(Query::from("Officer")).unwrap();
        let sql = pg(&compiled);
        assert!(sql.ends_with(r#"WHERE "g"."Discriminator" IN ('Officer')"#), "{sql}");
    }

    #[test]
    fn test_root_entity_reads_concrete_type_from_discriminator() {
        let compiled = compile(Query::from("Gear")).unwrap();
        let ResultShape::Entity(entity) = &compiled.shape else {
            panic!("expected entity");
        };
        let ConcreteType::Discriminator { index } = entity.concrete else {
            panic!("expected discriminator");
        };
        assert_eq!(
            compiled.select.projection[index].expr.column_display().as_deref(),
            Some("g.Discriminator")
        );
        assert!(pg(&compiled).ends_with(r#"WHERE "g"."Discriminator" IN ('Gear', 'Officer')"#));
    }

    #[test]
    fn test_filter_order_and_count_subquery() {
        let q = Query::from("Squad")
            .filter("s", Expr::param("s").member("Name").eq(Expr::captured("name", "Delta")))
            .order_by("s", Expr::param("s").member("Id"))
            .select(
                "s",
                Expr::new_object([
                    ("Name", Expr::param("s").member("Name")),
                    ("Size", Expr::param("s").member("Members").call("Count", vec![])),
                ]),
            );
        let compiled = compile(q).unwrap();
        let stmt = compiled.statement(&SqlRenderer::new(Dialect::Postgres));
        assert_eq!(
            stmt.sql,
            r#"SELECT "s"."Name", (SELECT COUNT(*) FROM "Gear" AS "g" WHERE "g"."SquadId" = "s"."Id" AND "g"."Discriminator" IN ('Gear', 'Officer')) FROM "Squad" AS "s" WHERE "s"."Name" = $1 ORDER BY "s"."Id""#
        );
        assert_eq!(stmt.params, vec![Value::from("Delta")]);
    }
}
