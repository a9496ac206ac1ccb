//! DML command builders for INSERT, UPDATE and DELETE.
//!
//! Each builder targets one table by name and produces a [`Statement`] for a
//! [`Dialect`]. The unit of work fills them from tracked entries, so they
//! deal in column names and values only.
//!
//! - RETURNING clause where the dialect has one
//! - `IS NULL` conditions for null key or concurrency-token values
//! - `DEFAULT VALUES` inserts for rows with every column generated

use relmap_core::{Dialect, Statement, Value};

/// A column and the value written to or compared with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnValue {
    pub column: String,
    pub value: Value,
}

impl ColumnValue {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// INSERT builder.
///
/// # Example
///
/// ```
/// use relmap_query::dml::InsertBuilder;
/// use relmap_core::Dialect;
///
/// let stmt = InsertBuilder::new("Squad")
///     .value("Name", "Delta")
///     .returning("Id")
///     .build_with_dialect(Dialect::Postgres);
/// assert_eq!(stmt.sql, r#"INSERT INTO "Squad" ("Name") VALUES ($1) RETURNING "Id""#);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct InsertBuilder {
    table: String,
    values: Vec<ColumnValue>,
    returning: Vec<String>,
}

impl InsertBuilder {
    /// Create a new INSERT builder for `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: Vec::new(),
            returning: Vec::new(),
        }
    }

    /// Write `value` to `column`.
    #[must_use]
    pub fn value(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.push(ColumnValue::new(column, value));
        self
    }

    /// Read `column` back from the inserted row.
    ///
    /// Ignored by dialects without RETURNING; the caller falls back to
    /// [`Dialect::last_insert_id_sql`].
    #[must_use]
    pub fn returning(mut self, column: impl Into<String>) -> Self {
        self.returning.push(column.into());
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Columns read back from the inserted row.
    pub fn returning_columns(&self) -> &[String] {
        &self.returning
    }

    /// Build the INSERT with the default dialect (Postgres).
    pub fn build(&self) -> Statement {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the INSERT for `dialect`.
    pub fn build_with_dialect(&self, dialect: Dialect) -> Statement {
        let table = dialect.quote_identifier(&self.table);
        let mut sql = if self.values.is_empty() {
            match dialect {
                Dialect::Mysql => format!("INSERT INTO {table} () VALUES ()"),
                Dialect::Postgres | Dialect::Sqlite => format!("INSERT INTO {table} DEFAULT VALUES"),
            }
        } else {
            let columns: Vec<_> = self.values.iter().map(|v| dialect.quote_identifier(&v.column)).collect();
            let placeholders: Vec<_> = (1..=self.values.len()).map(|i| dialect.placeholder(i)).collect();
            format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            )
        };
        push_returning(&mut sql, dialect, &self.returning);
        Statement::new(sql, self.values.iter().map(|v| v.value.clone()).collect())
    }
}

/// UPDATE builder.
///
/// Rows are matched by equality on every `where_eq` column; a null value
/// matches with `IS NULL`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateBuilder {
    table: String,
    sets: Vec<ColumnValue>,
    conditions: Vec<ColumnValue>,
    returning: Vec<String>,
}

impl UpdateBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            sets: Vec::new(),
            conditions: Vec::new(),
            returning: Vec::new(),
        }
    }

    /// Set a column to a specific value.
    #[must_use]
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sets.push(ColumnValue::new(column, value));
        self
    }

    /// Match rows whose `column` equals `value`.
    #[must_use]
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(ColumnValue::new(column, value));
        self
    }

    /// Read `column` back from the updated row (store-computed columns).
    #[must_use]
    pub fn returning(mut self, column: impl Into<String>) -> Self {
        self.returning.push(column.into());
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn returning_columns(&self) -> &[String] {
        &self.returning
    }

    /// True when there is nothing to set.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn build(&self) -> Statement {
        self.build_with_dialect(Dialect::default())
    }

    /// Build the UPDATE for `dialect`. An update with nothing to set builds
    /// an empty statement.
    pub fn build_with_dialect(&self, dialect: Dialect) -> Statement {
        if self.sets.is_empty() {
            return Statement::new(String::new(), Vec::new());
        }
        let mut params = Vec::with_capacity(self.sets.len() + self.conditions.len());
        let assignments: Vec<String> = self
            .sets
            .iter()
            .map(|s| {
                params.push(s.value.clone());
                format!("{} = {}", dialect.quote_identifier(&s.column), dialect.placeholder(params.len()))
            })
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            dialect.quote_identifier(&self.table),
            assignments.join(", ")
        );
        push_where(&mut sql, &mut params, dialect, &self.conditions);
        push_returning(&mut sql, dialect, &self.returning);
        Statement::new(sql, params)
    }
}

/// DELETE builder.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteBuilder {
    table: String,
    conditions: Vec<ColumnValue>,
}

impl DeleteBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            conditions: Vec::new(),
        }
    }

    /// Match rows whose `column` equals `value`.
    #[must_use]
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(ColumnValue::new(column, value));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn build(&self) -> Statement {
        self.build_with_dialect(Dialect::default())
    }

    pub fn build_with_dialect(&self, dialect: Dialect) -> Statement {
        let mut params = Vec::with_capacity(self.conditions.len());
        let mut sql = format!("DELETE FROM {}", dialect.quote_identifier(&self.table));
        push_where(&mut sql, &mut params, dialect, &self.conditions);
        Statement::new(sql, params)
    }
}

/// One modification command, as ordered by the unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum DmlCommand {
    Insert(InsertBuilder),
    Update(UpdateBuilder),
    Delete(DeleteBuilder),
}

impl DmlCommand {
    pub fn table(&self) -> &str {
        match self {
            DmlCommand::Insert(b) => b.table(),
            DmlCommand::Update(b) => b.table(),
            DmlCommand::Delete(b) => b.table(),
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            DmlCommand::Insert(_) => "INSERT",
            DmlCommand::Update(_) => "UPDATE",
            DmlCommand::Delete(_) => "DELETE",
        }
    }

    /// Columns the command reads back from the store.
    pub fn returning_columns(&self) -> &[String] {
        match self {
            DmlCommand::Insert(b) => b.returning_columns(),
            DmlCommand::Update(b) => b.returning_columns(),
            DmlCommand::Delete(_) => &[],
        }
    }

    pub fn build_with_dialect(&self, dialect: Dialect) -> Statement {
        match self {
            DmlCommand::Insert(b) => b.build_with_dialect(dialect),
            DmlCommand::Update(b) => b.build_with_dialect(dialect),
            DmlCommand::Delete(b) => b.build_with_dialect(dialect),
        }
    }
}

fn push_where(sql: &mut String, params: &mut Vec<Value>, dialect: Dialect, conditions: &[ColumnValue]) {
    if conditions.is_empty() {
        return;
    }
    let terms: Vec<String> = conditions
        .iter()
        .map(|c| {
            let column = dialect.quote_identifier(&c.column);
            if c.value.is_null() {
                format!("{column} IS NULL")
            } else {
                params.push(c.value.clone());
                format!("{column} = {}", dialect.placeholder(params.len()))
            }
        })
        .collect();
    sql.push_str(" WHERE ");
    sql.push_str(&terms.join(" AND "));
}

fn push_returning(sql: &mut String, dialect: Dialect, columns: &[String]) {
    if columns.is_empty() || !dialect.supports_returning() {
        return;
    }
    let columns: Vec<_> = columns.iter().map(|c| dialect.quote_identifier(c)).collect();
    sql.push_str(" RETURNING ");
    sql.push_str(&columns.join(", "));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_with_returning() {
        let stmt = InsertBuilder::new("Gear")
            .value("Nickname", "Marcus")
            .value("SquadId", 1)
            .returning("Version")
            .build_with_dialect(Dialect::Sqlite);
        assert_eq!(
            stmt.sql,
            r#"INSERT INTO "Gear" ("Nickname", "SquadId") VALUES (?1, ?2) RETURNING "Version""#
        );
        assert_eq!(stmt.params, vec![Value::from("Marcus"), Value::Int(1)]);
    }

    #[test]
    fn test_insert_mysql_has_no_returning() {
        let stmt = InsertBuilder::new("Squad")
            .value("Name", "Delta")
            .returning("Id")
            .build_with_dialect(Dialect::Mysql);
        assert_eq!(stmt.sql, "INSERT INTO `Squad` (`Name`) VALUES (?)");
    }

    #[test]
    fn test_insert_all_generated() {
        let insert = InsertBuilder::new("Squad").returning("Id");
        assert_eq!(
            insert.build().sql,
            r#"INSERT INTO "Squad" DEFAULT VALUES RETURNING "Id""#
        );
        assert_eq!(
            insert.build_with_dialect(Dialect::Mysql).sql,
            "INSERT INTO `Squad` () VALUES ()"
        );
    }

    #[test]
    fn test_update_with_null_concurrency_token() {
        let stmt = UpdateBuilder::new("Gear")
            .set("Rank", 3)
            .set("FullName", Value::Null)
            .where_eq("Nickname", "Marcus")
            .where_eq("SquadId", 1)
            .where_eq("Version", Value::Null)
            .build();
        assert_eq!(
            stmt.sql,
            r#"UPDATE "Gear" SET "Rank" = $1, "FullName" = $2 WHERE "Nickname" = $3 AND "SquadId" = $4 AND "Version" IS NULL"#
        );
        assert_eq!(
            stmt.params,
            vec![Value::Int(3), Value::Null, Value::from("Marcus"), Value::Int(1)]
        );
        assert!(UpdateBuilder::new("Gear").build().sql.is_empty());
    }

    #[test]
    fn test_delete_by_key() {
        let command = DmlCommand::Delete(DeleteBuilder::new("Weapon").where_eq("Id", 10));
        assert_eq!(command.kind(), "DELETE");
        assert_eq!(command.table(), "Weapon");
        let stmt = command.build_with_dialect(Dialect::Postgres);
        assert_eq!(stmt.sql, r#"DELETE FROM "Weapon" WHERE "Id" = $1"#);
        assert_eq!(stmt.params, vec![Value::Int(10)]);
    }
}
