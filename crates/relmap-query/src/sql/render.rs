//! Rendering command trees to dialect SQL.

use super::expr::{SqlBinaryOp, SqlExpr, SqlUnaryOp};
use super::select::{CommandNode, FromItem, OrderingClause, ProjectionColumn, SelectExpression, TableSource};
use relmap_core::{Dialect, Statement, Value};
use std::fmt::Write as _;

/// Turns a command tree into SQL text plus positional parameters.
///
/// Parameters are numbered in the order they appear in the text.
pub trait QuerySqlGenerator {
    fn dialect(&self) -> Dialect;

    fn generate(&self, command: &CommandNode) -> Statement;

    fn generate_select(&self, select: &SelectExpression) -> Statement {
        self.generate(&select.to_command())
    }
}

/// Default ANSI-style generator, parameterised by [`Dialect`].
///
/// ```
/// use relmap_core::{Dialect, SqlType, Value};
/// use relmap_query::sql::{QuerySqlGenerator, SelectExpression, SqlExpr, SqlRenderer, TableSource};
///
/// let mut select = SelectExpression::new(TableSource::table("Gears", "g"));
/// select.add_projection(SqlExpr::column("g", "Nickname", SqlType::Text, false));
/// select.apply_predicate(
///     SqlExpr::column("g", "Rank", SqlType::Integer, false)
///         .equal(SqlExpr::Parameter { name: "rank".into(), value: Value::Int(2) }),
/// );
/// let stmt = SqlRenderer::new(Dialect::Postgres).generate_select(&select);
/// assert_eq!(stmt.sql, r#"SELECT "g"."Nickname" FROM "Gears" AS "g" WHERE "g"."Rank" = $1"#);
/// assert_eq!(stmt.params, vec![Value::Int(2)]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlRenderer {
    dialect: Dialect,
}

impl SqlRenderer {
    pub const fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }
}

impl QuerySqlGenerator for SqlRenderer {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn generate(&self, command: &CommandNode) -> Statement {
        let mut w = Writer {
            dialect: self.dialect,
            sql: String::new(),
            params: Vec::new(),
        };
        w.query(command);
        Statement::new(w.sql, w.params)
    }
}

// ============================================================================
// Writer
// ============================================================================

const ATOM: u8 = 9;

struct Writer {
    dialect: Dialect,
    sql: String,
    params: Vec<Value>,
}

impl Writer {
    fn ident(&mut self, name: &str) {
        self.sql.push_str(&self.dialect.quote_identifier(name));
    }

    fn param(&mut self, value: Value) {
        self.params.push(value);
        self.sql.push_str(&self.dialect.placeholder(self.params.len()));
    }

    /// A full query: set operations, ordering and paging around select cores.
    fn query(&mut self, node: &CommandNode) {
        let (node, limit, offset) = match node {
            CommandNode::Limit { input, limit, offset } => (input.as_ref(), limit.as_ref(), offset.as_ref()),
            other => (other, None, None),
        };
        let (node, orderings) = match node {
            CommandNode::Ordering { input, orderings } => (input.as_ref(), orderings.as_slice()),
            other => (other, &[][..]),
        };
        self.compound(node);
        if !orderings.is_empty() {
            self.sql.push_str(" ORDER BY ");
            self.orderings(orderings);
        }
        self.paging(limit, offset);
    }

    fn compound(&mut self, node: &CommandNode) {
        match node {
            CommandNode::SetOperation { kind, left, right } => {
                self.compound_operand(left);
                let _ = write!(self.sql, " {} ", kind.keyword());
                self.compound_operand(right);
            }
            other => self.select_core(other),
        }
    }

    fn compound_operand(&mut self, node: &CommandNode) {
        if matches!(node, CommandNode::Ordering { .. } | CommandNode::Limit { .. }) {
            self.sql.push('(');
            self.query(node);
            self.sql.push(')');
        } else {
            self.compound(node);
        }
    }

    fn select_core(&mut self, node: &CommandNode) {
        let (input, columns, distinct) = match node {
            CommandNode::Projection { input, columns, distinct } => (input.as_deref(), Some(columns.as_slice()), *distinct),
            other => (Some(other), None, false),
        };
        let (input, grouping) = match input {
            Some(CommandNode::Grouping { input, keys, having }) => (Some(input.as_ref()), Some((keys, having))),
            other => (other, None),
        };
        let (input, predicate) = match input {
            Some(CommandNode::Filter { input, predicate }) => (Some(input.as_ref()), Some(predicate)),
            other => (other, None),
        };

        self.sql.push_str("SELECT ");
        if distinct {
            self.sql.push_str("DISTINCT ");
        }
        match columns {
            Some(columns) if !columns.is_empty() => self.projection(columns),
            Some(_) => self.sql.push('1'),
            None => self.sql.push('*'),
        }
        if let Some(input) = input {
            self.sql.push_str(" FROM ");
            self.from(input);
        }
        if let Some(predicate) = predicate {
            self.sql.push_str(" WHERE ");
            self.expr(predicate, 0);
        }
        if let Some((keys, having)) = grouping {
            if !keys.is_empty() {
                self.sql.push_str(" GROUP BY ");
                self.list(keys);
            }
            if let Some(having) = having {
                self.sql.push_str(" HAVING ");
                self.expr(having, 0);
            }
        }
    }

    fn projection(&mut self, columns: &[ProjectionColumn]) {
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.expr(&column.expr, 0);
            if let Some(alias) = &column.alias {
                self.sql.push_str(" AS ");
                self.ident(alias);
            }
        }
    }

    fn orderings(&mut self, orderings: &[OrderingClause]) {
        for (i, o) in orderings.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.expr(&o.expr, 0);
            if o.descending {
                self.sql.push_str(" DESC");
            }
        }
    }

    fn paging(&mut self, limit: Option<&SqlExpr>, offset: Option<&SqlExpr>) {
        match (limit, offset) {
            (Some(limit), _) => {
                self.sql.push_str(" LIMIT ");
                self.expr(limit, ATOM);
            }
            (None, Some(_)) => match self.dialect {
                Dialect::Sqlite => self.sql.push_str(" LIMIT -1"),
                Dialect::Mysql => self.sql.push_str(" LIMIT 18446744073709551615"),
                Dialect::Postgres => {}
            },
            (None, None) => {}
        }
        if let Some(offset) = offset {
            self.sql.push_str(" OFFSET ");
            self.expr(offset, ATOM);
        }
    }

    fn from(&mut self, node: &CommandNode) {
        match node {
            CommandNode::Table { source, .. } => self.table(source),
            CommandNode::Join { kind, left, right, on } => {
                self.from(left);
                let _ = write!(self.sql, " {} ", kind.keyword());
                if matches!(right.as_ref(), CommandNode::Join { .. }) {
                    self.sql.push('(');
                    self.from(right);
                    self.sql.push(')');
                } else {
                    self.from(right);
                }
                self.sql.push_str(" ON ");
                self.expr(on, 0);
            }
            derived => {
                self.sql.push('(');
                self.query(derived);
                self.sql.push_str(") AS ");
                self.ident("t");
            }
        }
    }

    fn table(&mut self, source: &TableSource) {
        match &source.item {
            FromItem::Table(name) => self.ident(name),
            FromItem::Subquery(select) => {
                self.sql.push('(');
                self.query(&select.to_command());
                self.sql.push(')');
            }
        }
        self.sql.push_str(" AS ");
        self.ident(&source.alias);
    }

    fn list(&mut self, exprs: &[SqlExpr]) {
        for (i, e) in exprs.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.expr(e, 0);
        }
    }

    fn precedence(&self, e: &SqlExpr) -> u8 {
        match e {
            SqlExpr::Binary { op, .. } => op.precedence(),
            SqlExpr::Unary { op: SqlUnaryOp::Not, .. } => 2,
            SqlExpr::IsNull { .. } | SqlExpr::Like { .. } | SqlExpr::In { .. } => 3,
            // `||` is an operator everywhere but MySQL.
            SqlExpr::Concat(_) if self.dialect != Dialect::Mysql => 4,
            _ => ATOM,
        }
    }

    /// Write `e`, parenthesised when it binds looser than `min`.
    fn expr(&mut self, e: &SqlExpr, min: u8) {
        let wrap = self.precedence(e) < min;
        if wrap {
            self.sql.push('(');
        }
        self.expr_inner(e);
        if wrap {
            self.sql.push(')');
        }
    }

    fn expr_inner(&mut self, e: &SqlExpr) {
        match e {
            SqlExpr::Column { table, column, .. } => {
                self.ident(table);
                self.sql.push('.');
                self.ident(column);
            }
            SqlExpr::Constant(v) => self.literal(v),
            SqlExpr::Parameter { value, .. } => self.param(value.clone()),
            SqlExpr::Binary { op, left, right } => {
                let prec = op.precedence();
                let associative = matches!(op, SqlBinaryOp::And | SqlBinaryOp::Or);
                self.expr(left, if op.is_comparison() { prec + 1 } else { prec });
                let _ = write!(self.sql, " {} ", op.as_str());
                self.expr(right, if associative { prec } else { prec + 1 });
            }
            SqlExpr::Unary { op: SqlUnaryOp::Not, operand } => {
                self.sql.push_str("NOT ");
                self.expr(operand, ATOM);
            }
            SqlExpr::Unary {
                op: SqlUnaryOp::Negate,
                operand,
            } => {
                self.sql.push('-');
                self.expr(operand, ATOM);
            }
            SqlExpr::IsNull { operand, negated } => {
                self.expr(operand, 4);
                self.sql.push_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            SqlExpr::Function { name, args, .. } => {
                let name = self.function_name(name);
                self.sql.push_str(name);
                self.sql.push('(');
                self.list(args);
                self.sql.push(')');
            }
            SqlExpr::Aggregate {
                function,
                argument,
                distinct,
            } => {
                let name = match function {
                    crate::expr::AggregateFunction::Count => "COUNT",
                    crate::expr::AggregateFunction::Sum => "SUM",
                    crate::expr::AggregateFunction::Average => "AVG",
                    crate::expr::AggregateFunction::Min => "MIN",
                    crate::expr::AggregateFunction::Max => "MAX",
                };
                self.sql.push_str(name);
                self.sql.push('(');
                match argument {
                    Some(a) => {
                        if *distinct {
                            self.sql.push_str("DISTINCT ");
                        }
                        self.expr(a, 0);
                    }
                    None => self.sql.push('*'),
                }
                self.sql.push(')');
            }
            SqlExpr::Case { whens, else_result } => {
                self.sql.push_str("CASE");
                for (when, then) in whens {
                    self.sql.push_str(" WHEN ");
                    self.expr(when, 0);
                    self.sql.push_str(" THEN ");
                    self.expr(then, 0);
                }
                if let Some(e) = else_result {
                    self.sql.push_str(" ELSE ");
                    self.expr(e, 0);
                }
                self.sql.push_str(" END");
            }
            SqlExpr::Like { operand, pattern, escape } => {
                self.expr(operand, 4);
                self.sql.push_str(" LIKE ");
                self.expr(pattern, 4);
                if let Some(c) = escape {
                    let _ = write!(self.sql, " ESCAPE '{c}'");
                }
            }
            SqlExpr::In { operand, values, negated } => {
                if values.is_empty() {
                    self.sql.push_str(if *negated { "TRUE" } else { "FALSE" });
                    return;
                }
                self.expr(operand, 4);
                self.sql.push_str(if *negated { " NOT IN (" } else { " IN (" });
                self.list(values);
                self.sql.push(')');
            }
            SqlExpr::Concat(parts) => {
                if self.dialect == Dialect::Mysql {
                    self.sql.push_str("CONCAT(");
                    self.list(parts);
                    self.sql.push(')');
                } else {
                    for (i, p) in parts.iter().enumerate() {
                        if i > 0 {
                            self.sql.push_str(" || ");
                        }
                        self.expr(p, 5);
                    }
                }
            }
            SqlExpr::DatePart { part, operand } => match self.dialect {
                Dialect::Postgres => {
                    let _ = write!(self.sql, "CAST(EXTRACT({} FROM ", part.keyword());
                    self.expr(operand, 0);
                    self.sql.push_str(") AS INTEGER)");
                }
                Dialect::Mysql => {
                    let _ = write!(self.sql, "EXTRACT({} FROM ", part.keyword());
                    self.expr(operand, 0);
                    self.sql.push(')');
                }
                Dialect::Sqlite => {
                    let _ = write!(self.sql, "CAST(strftime('{}', ", part.strftime_format());
                    self.expr(operand, 0);
                    self.sql.push_str(") AS INTEGER)");
                }
            },
            SqlExpr::Exists { subquery, negated } => {
                if *negated {
                    self.sql.push_str("NOT ");
                }
                self.sql.push_str("EXISTS (");
                self.query(&subquery.to_command());
                self.sql.push(')');
            }
            SqlExpr::Scalar(subquery) => {
                self.sql.push('(');
                self.query(&subquery.to_command());
                self.sql.push(')');
            }
        }
    }

    fn function_name<'a>(&self, name: &'a str) -> &'a str {
        match (name, self.dialect) {
            ("LENGTH", d) => d.length_function(),
            ("GREATEST", Dialect::Sqlite) => "MAX",
            ("LEAST", Dialect::Sqlite) => "MIN",
            _ => name,
        }
    }

    fn literal(&mut self, value: &Value) {
        match value {
            Value::Null => self.sql.push_str("NULL"),
            Value::Bool(b) => self.sql.push_str(if *b { "TRUE" } else { "FALSE" }),
            Value::TinyInt(v) => {
                let _ = write!(self.sql, "{v}");
            }
            Value::SmallInt(v) => {
                let _ = write!(self.sql, "{v}");
            }
            Value::Int(v) => {
                let _ = write!(self.sql, "{v}");
            }
            Value::BigInt(v) => {
                let _ = write!(self.sql, "{v}");
            }
            Value::Double(v) if v.is_finite() => {
                let _ = write!(self.sql, "{v:?}");
            }
            Value::Float(v) if v.is_finite() => {
                let _ = write!(self.sql, "{v:?}");
            }
            Value::Decimal(d) if !d.is_empty() && d.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-') => {
                self.sql.push_str(d);
            }
            Value::Text(s) => {
                let _ = write!(self.sql, "'{}'", s.replace('\'', "''"));
            }
            other => self.param(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::AggregateFunction;
    use crate::query::SetOperationKind;
    use crate::sql::expr::DatePart;
    use crate::sql::select::JoinKind;
    use relmap_core::SqlType;

    fn col(table: &str, name: &str) -> SqlExpr {
        SqlExpr::column(table, name, SqlType::Integer, false)
    }

    fn param(value: impl Into<Value>) -> SqlExpr {
        SqlExpr::Parameter {
            name: "p".to_string(),
            value: value.into(),
        }
    }

    fn pg(select: &SelectExpression) -> Statement {
        SqlRenderer::new(Dialect::Postgres).generate_select(select)
    }

    #[test]
    fn test_join_filter_order_limit() {
        let mut select = SelectExpression::new(TableSource::table("Gear", "g"));
        select.add_join(JoinKind::LeftOuter, TableSource::table("Squad", "s"), col("s", "Id").equal(col("g", "SquadId")));
        select.add_projection(col("g", "Nickname"));
        select.add_projection(col("s", "Name"));
        select.apply_predicate(SqlExpr::binary(SqlBinaryOp::GreaterThan, col("g", "Rank"), param(2)));
        select.add_ordering(col("g", "Rank"), true);
        select.limit = Some(SqlExpr::Constant(Value::Int(5)));
        let stmt = pg(&select);
        assert_eq!(
            stmt.sql,
            r#"SELECT "g"."Nickname", "s"."Name" FROM "Gear" AS "g" LEFT JOIN "Squad" AS "s" ON "s"."Id" = "g"."SquadId" WHERE "g"."Rank" > $1 ORDER BY "g"."Rank" DESC LIMIT 5"#
        );
        assert_eq!(stmt.params, vec![Value::Int(2)]);
    }

    #[test]
    fn test_parameters_numbered_in_text_order() {
        let mut select = SelectExpression::new(TableSource::table("Gear", "g"));
        select.add_projection(SqlExpr::Case {
            whens: vec![(col("g", "Rank").equal(param(1)), param("one"))],
            else_result: Some(Box::new(SqlExpr::Constant(Value::Null))),
        });
        select.apply_predicate(col("g", "SquadId").equal(param(7)));
        let stmt = SqlRenderer::new(Dialect::Sqlite).generate_select(&select);
        assert_eq!(
            stmt.sql,
            r#"SELECT CASE WHEN "g"."Rank" = ?1 THEN ?2 ELSE NULL END FROM "Gear" AS "g" WHERE "g"."SquadId" = ?3"#
        );
        assert_eq!(stmt.params, vec![Value::Int(1), Value::from("one"), Value::Int(7)]);
    }

    #[test]
    fn test_precedence_parentheses() {
        let mut select = SelectExpression::new(TableSource::table("Gear", "g"));
        let a = col("g", "A").equal(param(1));
        let b = col("g", "B").equal(param(2));
        let c = col("g", "C").is_null();
        select.apply_predicate(a.or(b).and(c.not()));
        select.add_projection(SqlExpr::binary(
            SqlBinaryOp::Multiply,
            SqlExpr::binary(SqlBinaryOp::Add, col("g", "A"), col("g", "B")),
            col("g", "C"),
        ));
        let stmt = pg(&select);
        assert_eq!(
            stmt.sql,
            r#"SELECT ("g"."A" + "g"."B") * "g"."C" FROM "Gear" AS "g" WHERE ("g"."A" = $1 OR "g"."B" = $2) AND NOT ("g"."C" IS NULL)"#
        );
    }

    #[test]
    fn test_dialect_functions_and_paging() {
        let mut select = SelectExpression::new(TableSource::table("Mission", "m"));
        select.add_projection(SqlExpr::function("LENGTH", vec![col("m", "CodeName")], None));
        select.add_projection(SqlExpr::function("GREATEST", vec![col("m", "A"), col("m", "B")], None));
        select.add_projection(SqlExpr::DatePart {
            part: DatePart::Year,
            operand: Box::new(col("m", "Timeline")),
        });
        select.offset = Some(SqlExpr::Constant(Value::Int(10)));

        let sqlite = SqlRenderer::new(Dialect::Sqlite).generate_select(&select).sql;
        assert_eq!(
            sqlite,
            r#"SELECT LENGTH("m"."CodeName"), MAX("m"."A", "m"."B"), CAST(strftime('%Y', "m"."Timeline") AS INTEGER) FROM "Mission" AS "m" LIMIT -1 OFFSET 10"#
        );
        let postgres = pg(&select).sql;
        assert!(postgres.starts_with(r#"SELECT CHAR_LENGTH("m"."CodeName"), GREATEST("m"."A", "m"."B"), CAST(EXTRACT(YEAR FROM "m"."Timeline") AS INTEGER)"#));
        assert!(postgres.ends_with(" OFFSET 10"));
        let mysql = SqlRenderer::new(Dialect::Mysql).generate_select(&select).sql;
        assert!(mysql.contains("EXTRACT(YEAR FROM `m`.`Timeline`)"));
    }

    #[test]
    fn test_like_in_exists_and_aggregates() {
        let mut inner = SelectExpression::new(TableSource::table("Weapon", "w"));
        inner.add_projection(SqlExpr::Constant(Value::Int(1)));
        inner.apply_predicate(col("w", "OwnerSquadId").equal(col("g", "SquadId")));

        let mut select = SelectExpression::new(TableSource::table("Gear", "g"));
        select.add_projection(SqlExpr::Aggregate {
            function: AggregateFunction::Count,
            argument: None,
            distinct: false,
        });
        select.apply_predicate(SqlExpr::Like {
            operand: Box::new(SqlExpr::column("g", "FullName", SqlType::Text, false)),
            pattern: Box::new(SqlExpr::Constant(Value::from("%\\_%"))),
            escape: Some('\\'),
        });
        select.apply_predicate(SqlExpr::In {
            operand: Box::new(SqlExpr::column("g", "Discriminator", SqlType::Text, false)),
            values: vec![SqlExpr::Constant(Value::from("Gear")), SqlExpr::Constant(Value::from("Officer"))],
            negated: false,
        });
        select.apply_predicate(SqlExpr::Exists {
            subquery: Box::new(inner),
            negated: true,
        });
        let stmt = pg(&select);
        assert_eq!(
            stmt.sql,
            r#"SELECT COUNT(*) FROM "Gear" AS "g" WHERE "g"."FullName" LIKE '%\_%' ESCAPE '\' AND "g"."Discriminator" IN ('Gear', 'Officer') AND NOT EXISTS (SELECT 1 FROM "Weapon" AS "w" WHERE "w"."OwnerSquadId" = "g"."SquadId")"#
        );
    }

    #[test]
    fn test_set_operation_and_derived_table() {
        let mut left = SelectExpression::new(TableSource::table("Gear", "g"));
        left.add_projection(col("g", "Rank"));
        let mut right = SelectExpression::new(TableSource::table("Gear", "g0"));
        right.add_projection(col("g0", "Rank"));
        left.set_operations.push((SetOperationKind::Union, right));
        let stmt = pg(&left);
        assert_eq!(
            stmt.sql,
            r#"SELECT "g"."Rank" FROM "Gear" AS "g" UNION SELECT "g0"."Rank" FROM "Gear" AS "g0""#
        );

        let mut distinct = SelectExpression::new(TableSource::table("Gear", "g"));
        distinct.add_projection(col("g", "Rank"));
        distinct.distinct = true;
        let mut outer = distinct.push_down("t");
        outer.projection = vec![ProjectionColumn {
            expr: SqlExpr::Aggregate {
                function: AggregateFunction::Count,
                argument: None,
                distinct: false,
            },
            alias: None,
        }];
        assert_eq!(
            pg(&outer).sql,
            r#"SELECT COUNT(*) FROM (SELECT DISTINCT "g"."Rank" AS "c0" FROM "Gear" AS "g") AS "t""#
        );
    }

    #[test]
    fn test_literals_and_fallback_parameters() {
        let mut select = SelectExpression::default();
        select.add_projection(SqlExpr::Constant(Value::from("O'Neil")));
        select.add_projection(SqlExpr::Constant(Value::Bool(true)));
        select.add_projection(SqlExpr::Constant(Value::Bytes(vec![1, 2])));
        let stmt = pg(&select);
        assert_eq!(stmt.sql, "SELECT 'O''Neil', TRUE, $1");
        assert_eq!(stmt.params, vec![Value::Bytes(vec![1, 2])]);
    }
}
