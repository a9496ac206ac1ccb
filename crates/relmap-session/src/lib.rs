//! Sessions, change tracking and the unit of work for relmap.
//!
//! A [`Session`] owns a data source and a [`ChangeTracker`]. Queries are
//! translated by `relmap-query` and materialized into tracked entities;
//! edits are found by change detection and written back by
//! [`Session::save_changes`] as ordered, batched commands.
//!
//! - [`tracker`]: the identity map, entity states and change detection
//! - [`update`]: planning and running the commands of one save
//! - [`materializer`]: rows to entities, projections and collections
//! - [`session`]: the [`Session`] tying them together
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(source, model);
//! let delta = session.add(DynamicEntity::new("Squad").with("Name", "Delta"))?;
//! session.save_changes(&cx).await;
//!
//! let squad = session.find(&cx, "Squad", &[Value::Int(1)]).await;
//! ```

pub mod materializer;
pub mod session;
pub mod tracker;
pub mod update;

#[cfg(test)]
mod test_model;

pub use materializer::{Materializer, QueryTrackingBehavior, ResultValue};
pub use session::{Session, SessionConfig, SessionDebugInfo};
pub use tracker::{ChangeTracker, EntityEntry, EntityState, EntryId, StateChange};
pub use update::{BuiltCommand, CommandKind, PlannedCommand, UpdatePlan};
