//! relmap: an object-relational mapping core.
//!
//! Build a model with [`ModelBuilder`], whose conventions fill in keys,
//! relationships and inheritance mapping as you go. Finalize it, then open a
//! [`Session`] over any [`DataSource`] to query entities and save changes.
//!
//! This crate re-exports the public surface of the member crates:
//!
//! - `relmap-core`: values, rows, dialects, errors and the data-source contract
//! - `relmap-metadata`: the model, its builder and conventions
//! - `relmap-query`: the query tree, its translation and SQL rendering
//! - `relmap-session`: change tracking, the unit of work and materialization
//!
//! # Example
//!
//! ```ignore
//! use relmap::prelude::*;
//!
//! let mut mb = ModelBuilder::new();
//! let squad = mb.entity("Squad")?;
//! mb.property(squad, "Id", SqlType::Integer)?;
//! mb.property(squad, "Name", SqlType::Text)?;
//! let model = mb.finalize()?;
//!
//! let mut session = Session::new(source, model);
//! session.add(DynamicEntity::new("Squad").with("Name", "Delta"))?;
//! session.save_changes(&cx).await;
//!
//! let named = Query::from("Squad")
//!     .filter("s", Expr::param("s").member("Name").eq(Expr::captured("name", "Delta")));
//! let squads = session.query(&cx, named).await;
//! ```

pub use relmap_core::{
    ConcurrencyError, Cx, DataSource, DataSourceError, DataSourceErrorKind, DependencyCycleError,
    Dialect, DynamicEntity, Entity, EntryInfo, Error, IdentityConflictError, MaterializationError,
    ModelBuildingError, Outcome, Result, Row, SqlType, Statement, TranslationError,
    TranslationErrorKind, Value,
};
pub use relmap_metadata::{
    Cardinality, ConfigurationSource, DeleteBehavior, EntityTypeId, FinalizedModel,
    HierarchyMapping, MappingStrategy, Model, ModelBuilder, ModelBuilderOptions, PropertyId,
    Rejection, ValueGenerated,
};
pub use relmap_query::{
    ClientFunctions, CompiledQuery, Expr, Query, QueryCompiler, QuerySqlGenerator, SqlRenderer,
};
pub use relmap_session::{
    ChangeTracker, EntityEntry, EntityState, EntryId, QueryTrackingBehavior, ResultValue, Session,
    SessionConfig, SessionDebugInfo, StateChange, UpdatePlan,
};

/// The types most programs need.
pub mod prelude {
    pub use relmap_core::{
        Cx, DataSource, Dialect, DynamicEntity, Entity, Error, Outcome, Result, Row, SqlType,
        Statement, Value,
    };
    pub use relmap_metadata::{
        Cardinality, ConfigurationSource, DeleteBehavior, FinalizedModel, MappingStrategy,
        ModelBuilder, ValueGenerated,
    };
    pub use relmap_query::{Expr, Query};
    pub use relmap_session::{
        EntityState, EntryId, QueryTrackingBehavior, ResultValue, Session, SessionConfig,
    };
}
