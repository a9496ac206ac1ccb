//! Core types and traits for relmap.
//!
//! `relmap-core` is the **foundation layer** for the workspace. It defines the
//! values, rows, errors and provider contracts that every other crate builds on.
//!
//! # Role In The Architecture
//!
//! - **Contract layer**: `DataSource` is the narrow provider interface the session
//!   dispatches rendered queries and modification batches to. `Entity` is the
//!   optional bridge between Rust structs and dynamically-shaped entity values.
//! - **Data model**: `Row`, `Value`, and `SqlType` represent query inputs/outputs and
//!   are shared across the metadata, query, and session crates.
//! - **Error taxonomy**: a single `Error` enum with structured context for model
//!   building, translation, identity, concurrency, ordering and data-source failures.
//! - **Structured concurrency**: re-exports `Cx` and `Outcome` from asupersync so every
//!   data-source operation is cancel-correct.
//!
//! # Who Uses This Crate
//!
//! - `relmap-metadata` uses `SqlType`, `Value` and identifier validation.
//! - `relmap-query` renders command trees with `Dialect` and emits `Value` parameters.
//! - `relmap-session` drives a `DataSource`, materializes `Row`s and reports errors.

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod datasource;
pub mod dialect;
pub mod dynamic;
pub mod entity;
pub mod error;
pub mod identifiers;
pub mod row;
pub mod types;
pub mod value;

pub use datasource::{DataSource, Statement};
pub use dialect::Dialect;
pub use dynamic::DynamicEntity;
pub use entity::Entity;
pub use error::{
    ConcurrencyError, DataSourceError, DataSourceErrorKind, DependencyCycleError, EntryInfo,
    Error, IdentityConflictError, MaterializationError, ModelBuildingError, Result,
    TranslationError, TranslationErrorKind,
};
pub use identifiers::{is_valid_identifier, quote_ident, quote_ident_mysql};
pub use row::Row;
pub use types::SqlType;
pub use value::Value;
