//! Stable handles into the metadata arena.
//!
//! Elements reference each other through these ids rather than owning
//! pointers, so the entity type / property / navigation graph can be cyclic.
//! Ids are never reused within one model, even after removal.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub(crate) u32);

        impl $name {
            /// Position in the arena.
            #[must_use]
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            pub(crate) const fn from_index(index: usize) -> Self {
                Self(index as u32)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

arena_id!(
    /// Handle to an entity type.
    EntityTypeId,
    "entity"
);
arena_id!(
    /// Handle to a property.
    PropertyId,
    "property"
);
arena_id!(
    /// Handle to a key (primary or alternate).
    KeyId,
    "key"
);
arena_id!(
    /// Handle to a foreign key.
    ForeignKeyId,
    "fk"
);
arena_id!(
    /// Handle to a navigation.
    NavigationId,
    "nav"
);
arena_id!(
    /// Handle to an index.
    IndexId,
    "index"
);
