//! SQL identifier handling.
//!
//! All identifiers this engine emits are double-quoted (`"user"."id"`), so
//! table and column names survive mixed case and reserved words. Names are
//! validated on the way in: NUL bytes are rejected, embedded quotes are
//! escaped as `""` on the way out.

use crate::error::{ChainError, ChainResult};

/// Append a double-quoted identifier to `out`, escaping embedded quotes.
pub(crate) fn push_quoted(out: &mut String, name: &str) {
    out.push('"');
    for ch in name.chars() {
        if ch == '"' {
            out.push('"');
            out.push('"');
        } else {
            out.push(ch);
        }
    }
    out.push('"');
}

/// Render a double-quoted identifier.
pub fn quote(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    push_quoted(&mut out, name);
    out
}

/// Validate a name used as a CTE name or table alias.
///
/// Unquoted-identifier rules: `[A-Za-z_][A-Za-z0-9_$]*`. The engine quotes
/// everything on output regardless, but alias and CTE names also appear in
/// generated references, so garbage in means garbage SQL out.
pub fn check_name(name: &str) -> ChainResult<()> {
    if name.is_empty() {
        return Err(ChainError::internal("Identifier cannot be empty"));
    }
    if name.contains('\0') {
        return Err(ChainError::internal(
            "Identifier cannot contain NUL character",
        ));
    }
    let mut chars = name.chars();
    let first = chars.next().expect("non-empty");
    if first != '_' && !first.is_ascii_alphabetic() {
        return Err(ChainError::internal(format!(
            "Invalid identifier start character: '{first}'"
        )));
    }
    for c in chars {
        if c != '_' && c != '$' && !c.is_ascii_alphanumeric() {
            return Err(ChainError::internal(format!(
                "Invalid character in identifier: '{c}'"
            )));
        }
    }
    Ok(())
}

/// A column reference, optionally qualified by a table or join alias.
///
/// `ColumnRef::parse("profile.userId")` splits the qualifier off; a bare
/// `"name"` is qualified with the host table's alias at composition time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

impl ColumnRef {
    /// A bare column name, qualified later by the host table.
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            table: None,
            column: column.into(),
        }
    }

    /// A column qualified by an explicit table or join alias.
    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            column: column.into(),
        }
    }

    /// Parse `"col"` or `"alias.col"` notation.
    pub fn parse(s: &str) -> Self {
        match s.split_once('.') {
            Some((table, column)) => Self::qualified(table, column),
            None => Self::new(s),
        }
    }

    /// The unqualified column name, used as the output field key.
    pub fn field_name(&self) -> &str {
        &self.column
    }

    /// Render as quoted SQL, defaulting the qualifier to `default_table`.
    pub(crate) fn write_sql(&self, out: &mut String, default_table: &str) {
        let table = self.table.as_deref().unwrap_or(default_table);
        push_quoted(out, table);
        out.push('.');
        push_quoted(out, &self.column);
    }

    /// Render without any qualifier (SET clauses, RETURNING lists).
    pub(crate) fn write_bare(&self, out: &mut String) {
        push_quoted(out, &self.column);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_plain_name() {
        assert_eq!(quote("user"), "\"user\"");
    }

    #[test]
    fn escapes_embedded_quote() {
        assert_eq!(quote("has\"quote"), "\"has\"\"quote\"");
    }

    #[test]
    fn parses_qualified_column() {
        let c = ColumnRef::parse("profile.userId");
        assert_eq!(c.table.as_deref(), Some("profile"));
        assert_eq!(c.column, "userId");
    }

    #[test]
    fn parses_bare_column() {
        let c = ColumnRef::parse("name");
        assert_eq!(c.table, None);
        assert_eq!(c.field_name(), "name");
    }

    #[test]
    fn writes_with_default_qualifier() {
        let c = ColumnRef::new("id");
        let mut out = String::new();
        c.write_sql(&mut out, "user");
        assert_eq!(out, "\"user\".\"id\"");
    }

    #[test]
    fn check_name_rules() {
        assert!(check_name("users").is_ok());
        assert!(check_name("_tmp$1").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("1bad").is_err());
        assert!(check_name("no spaces").is_err());
        assert!(check_name("nul\0byte").is_err());
    }
}
