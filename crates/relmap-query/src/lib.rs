//! Query translation for relmap.
//!
//! `relmap-query` turns a language-level [`Query`] over a finalized model
//! into a relational command tree and renders it for a [`Dialect`].
//!
//! - [`expr`] and [`query`]: the expression tree and the operator chain
//! - [`visitor`]: walking and rewriting expression trees
//! - [`pipeline`]: the [`QueryCompiler`] and its six stages
//! - [`sql`]: the relational command tree and the [`SqlRenderer`]
//! - [`client`]: functions for projections evaluated in memory
//! - [`result`]: the compiled query and the shapes the materializer follows
//! - [`dml`]: INSERT/UPDATE/DELETE builders for the unit of work
//!
//! # Example
//!
//! ```
//! use relmap_core::{Dialect, SqlType};
//! use relmap_metadata::ModelBuilder;
//! use relmap_query::{Expr, Query, QueryCompiler, QuerySqlGenerator, SqlRenderer};
//!
//! let mut mb = ModelBuilder::new();
//! let squad = mb.entity("Squad").unwrap();
//! mb.property(squad, "Id", SqlType::Integer).unwrap();
//! mb.property(squad, "Name", SqlType::Text).unwrap();
//! let model = mb.finalize().unwrap();
//!
//! let query = Query::from("Squad")
//!     .filter("s", Expr::param("s").member("Name").eq(Expr::captured("name", "Delta")))
//!     .select("s", Expr::param("s").member("Id"));
//! let compiled = QueryCompiler::new(&model).compile(query).unwrap();
//! let stmt = compiled.statement(&SqlRenderer::new(Dialect::Sqlite));
//! assert_eq!(stmt.sql, r#"SELECT "s"."Id" FROM "Squad" AS "s" WHERE "s"."Name" = ?1"#);
//! ```
//!
//! [`Dialect`]: relmap_core::Dialect

pub mod client;
pub mod dml;
pub mod expr;
pub mod pipeline;
pub mod query;
pub mod result;
pub mod sql;
pub mod visitor;

pub use client::{ClientExpr, ClientFunction, ClientFunctions};
pub use dml::{ColumnValue, DeleteBuilder, DmlCommand, InsertBuilder, UpdateBuilder};
pub use expr::{AggregateFunction, BinaryOp, Expr, Lambda, UnaryOp};
pub use pipeline::QueryCompiler;
pub use pipeline::navigation::{ExpandedQuery, SourceRef};
pub use query::{Operator, Query, QuerySource, SetOperationKind, TerminalKind};
pub use result::{CompiledQuery, ConcreteType, EntityShape, ResultCardinality, ResultShape, SplitQuery};
pub use sql::{QuerySqlGenerator, SelectExpression, SqlExpr, SqlRenderer};
