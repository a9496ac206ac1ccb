//! Identifier validation and quoting.

use regex::Regex;
use std::sync::OnceLock;

fn identifier_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$") {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(error = %e, "identifier pattern failed to compile, rejecting all names");
            None
        }
    })
    .as_ref()
}

/// Whether `name` is a plain identifier usable for entities, properties,
/// tables and columns without quoting surprises.
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}

/// Quote an identifier with double quotes (ANSI / PostgreSQL / SQLite).
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an identifier with backticks (MySQL).
pub fn quote_ident_mysql(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(is_valid_identifier("Gear"));
        assert!(is_valid_identifier("_squad_id"));
        assert!(is_valid_identifier("Id2"));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("drop table"));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_ident_mysql("a`b"), "`a``b`");
    }
}
