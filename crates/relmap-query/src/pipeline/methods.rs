//! Method and member translation table.
//!
//! Maps string, math and date operations onto relational functions. The
//! table is dialect-agnostic: it emits canonical function names (`LENGTH`,
//! `GREATEST`) and the renderer spells them per dialect.

use crate::sql::{DatePart, SqlBinaryOp, SqlExpr};
use relmap_core::{SqlType, Value};

/// Translate `target.method(args)` (instance) or `method(args)` (static,
/// e.g. `Math.Abs`). `None` means the call has no server equivalent.
pub(crate) fn translate_call(target: Option<SqlExpr>, method: &str, mut args: Vec<SqlExpr>) -> Option<SqlExpr> {
    match (target, method, args.len()) {
        (Some(t), "Contains", 1) => like(t, args.pop()?, "%", "%"),
        (Some(t), "StartsWith", 1) => like(t, args.pop()?, "", "%"),
        (Some(t), "EndsWith", 1) => like(t, args.pop()?, "%", ""),
        (Some(t), "ToUpper", 0) => Some(SqlExpr::function("UPPER", vec![t], Some(SqlType::Text))),
        (Some(t), "ToLower", 0) => Some(SqlExpr::function("LOWER", vec![t], Some(SqlType::Text))),
        (Some(t), "Trim", 0) => Some(SqlExpr::function("TRIM", vec![t], Some(SqlType::Text))),
        (Some(t), "Substring", 1 | 2) => {
            let mut sql_args = vec![t];
            let mut rest = args.into_iter();
            sql_args.push(one_based(rest.next()?));
            sql_args.extend(rest);
            Some(SqlExpr::function("SUBSTR", sql_args, Some(SqlType::Text)))
        }
        (Some(t), "Equals", 1) => Some(t.equal(args.pop()?)),
        // With a StringComparison argument the comparison rules are not
        // expressible in SQL.
        (None, "string.Equals", 2) => {
            let right = args.pop()?;
            let left = args.pop()?;
            Some(left.equal(right))
        }
        (None, "string.IsNullOrEmpty", 1) => {
            let operand = args.pop()?;
            Some(
                operand
                    .clone()
                    .is_null()
                    .or(operand.equal(SqlExpr::Constant(Value::from("")))),
            )
        }
        (None, "Math.Abs", 1) => Some(SqlExpr::function("ABS", args, None)),
        (None, "Math.Floor", 1) => Some(SqlExpr::function("FLOOR", args, None)),
        (None, "Math.Ceiling", 1) => Some(SqlExpr::function("CEILING", args, None)),
        (None, "Math.Round", 1 | 2) => Some(SqlExpr::function("ROUND", args, None)),
        (None, "Math.Max", 2) => Some(SqlExpr::function("GREATEST", args, None)),
        (None, "Math.Min", 2) => Some(SqlExpr::function("LEAST", args, None)),
        (None, "Math.Pow", 2) => Some(SqlExpr::function("POWER", args, Some(SqlType::Double))),
        _ => None,
    }
}

/// Translate `target.member` on a scalar (`Length`, date parts).
pub(crate) fn translate_member(target: SqlExpr, member: &str) -> Option<SqlExpr> {
    if member == "Length" {
        return Some(SqlExpr::function("LENGTH", vec![target], Some(SqlType::Integer)));
    }
    let part = DatePart::from_member(member)?;
    Some(SqlExpr::DatePart {
        part,
        operand: Box::new(target),
    })
}

/// SQL positions are one-based.
fn one_based(start: SqlExpr) -> SqlExpr {
    match &start {
        SqlExpr::Constant(v) => v
            .as_i64()
            .map_or(start.clone(), |i| SqlExpr::Constant(Value::BigInt(i + 1))),
        _ => SqlExpr::binary(SqlBinaryOp::Add, start, SqlExpr::Constant(Value::Int(1))),
    }
}

/// `operand LIKE prefix || pattern || suffix`.
///
/// A literal or parameter pattern is escaped and folded in place; any other
/// pattern is concatenated at run time and not escaped.
fn like(operand: SqlExpr, pattern: SqlExpr, prefix: &str, suffix: &str) -> Option<SqlExpr> {
    let (pattern, escape) = match pattern {
        SqlExpr::Constant(Value::Text(s)) => (SqlExpr::Constant(Value::Text(format!("{prefix}{}{suffix}", escape_like(&s)))), Some('\\')),
        SqlExpr::Parameter {
            name,
            value: Value::Text(s),
        } => (
            SqlExpr::Parameter {
                name,
                value: Value::Text(format!("{prefix}{}{suffix}", escape_like(&s))),
            },
            Some('\\'),
        ),
        // A null pattern never matches.
        p if p.is_null_literal() => return Some(SqlExpr::Constant(Value::Bool(false))),
        SqlExpr::Constant(_) | SqlExpr::Parameter { .. } => return None,
        other => {
            let mut parts = Vec::with_capacity(3);
            if !prefix.is_empty() {
                parts.push(SqlExpr::Constant(Value::from(prefix)));
            }
            parts.push(other);
            if !suffix.is_empty() {
                parts.push(SqlExpr::Constant(Value::from(suffix)));
            }
            (SqlExpr::Concat(parts), None)
        }
    };
    Some(SqlExpr::Like {
        operand: Box::new(operand),
        pattern: Box::new(pattern),
        escape,
    })
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name() -> SqlExpr {
        SqlExpr::column("g", "FullName", SqlType::Text, true)
    }

    #[test]
    fn test_starts_with_literal_is_escaped() {
        let e = translate_call(Some(name()), "StartsWith", vec![SqlExpr::Constant(Value::from("50%_"))]).unwrap();
        let SqlExpr::Like { pattern, escape, .. } = e else {
            panic!("expected LIKE");
        };
        assert_eq!(*pattern, SqlExpr::Constant(Value::from("50\\%\\_%")));
        assert_eq!(escape, Some('\\'));
    }

    #[test]
    fn test_contains_column_pattern_concatenates() {
        let other = SqlExpr::column("s", "Name", SqlType::Text, true);
        let e = translate_call(Some(name()), "Contains", vec![other.clone()]).unwrap();
        let SqlExpr::Like { pattern, escape, .. } = e else {
            panic!("expected LIKE");
        };
        assert_eq!(
            *pattern,
            SqlExpr::Concat(vec![
                SqlExpr::Constant(Value::from("%")),
                other,
                SqlExpr::Constant(Value::from("%"))
            ])
        );
        assert_eq!(escape, None);
    }

    #[test]
    fn test_substring_is_one_based() {
        let e = translate_call(
            Some(name()),
            "Substring",
            vec![SqlExpr::Constant(Value::Int(0)), SqlExpr::Constant(Value::Int(3))],
        )
        .unwrap();
        let SqlExpr::Function { name, args, .. } = e else {
            panic!("expected function");
        };
        assert_eq!(name, "SUBSTR");
        assert_eq!(args[1], SqlExpr::Constant(Value::BigInt(1)));
    }

    #[test]
    fn test_untranslatable_calls() {
        assert!(translate_call(None, "string.Equals", vec![name(), name(), SqlExpr::Constant(Value::Int(5))]).is_none());
        assert!(translate_call(Some(name()), "PadLeft", vec![SqlExpr::Constant(Value::Int(3))]).is_none());
        assert!(translate_member(name(), "Ticks").is_none());
        assert!(matches!(
            translate_member(SqlExpr::column("m", "Timeline", SqlType::Timestamp, false), "Month"),
            Some(SqlExpr::DatePart { part: DatePart::Month, .. })
        ));
    }
}
