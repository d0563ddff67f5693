//! SQL quoting helpers for composing replication commands.
//!
//! START_REPLICATION is parsed by the walsender grammar, not the SQL parser,
//! but the same quoting rules apply: identifiers are double-quoted with `"`
//! doubled, string literals single-quoted with `'` doubled.

/// Quote a string as an SQL identifier.
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string as an SQL literal, including the surrounding quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", escape_string(value))
}

/// Escape a string for embedding inside single quotes (quotes are doubled,
/// no surrounding quotes added).
pub fn escape_string(value: &str) -> String {
    value.replace('\'', "''")
}
