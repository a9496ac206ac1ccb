//! SQL dialect differences the renderer and update pipeline care about.

use serde::{Deserialize, Serialize};

/// Target SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Dialect {
    /// PostgreSQL (`$1` placeholders, `"ident"` quoting).
    #[default]
    Postgres,
    /// SQLite (`?1` placeholders, `"ident"` quoting).
    Sqlite,
    /// MySQL (`?` placeholders, `` `ident` `` quoting).
    Mysql,
}

impl Dialect {
    /// Placeholder for the 1-based parameter position `index`.
    #[must_use]
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    #[must_use]
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => crate::identifiers::quote_ident(name),
            Dialect::Mysql => crate::identifiers::quote_ident_mysql(name),
        }
    }

    /// Whether `INSERT ... RETURNING` is available.
    #[must_use]
    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }

    /// Query returning the last generated identity when RETURNING is unavailable.
    #[must_use]
    pub const fn last_insert_id_sql(self) -> &'static str {
        match self {
            Dialect::Postgres => "SELECT lastval()",
            Dialect::Sqlite => "SELECT last_insert_rowid()",
            Dialect::Mysql => "SELECT LAST_INSERT_ID()",
        }
    }

    /// Name of the string-length function.
    #[must_use]
    pub const fn length_function(self) -> &'static str {
        match self {
            Dialect::Postgres | Dialect::Mysql => "CHAR_LENGTH",
            Dialect::Sqlite => "LENGTH",
        }
    }
}
