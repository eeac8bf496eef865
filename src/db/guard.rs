//! Restricted SQL grammar for guest queries.
//!
//! Contracts run under the `smartcontract` role, so table-level privilege
//! is enforced by the engine; this guard only has to keep statements
//! single, comment-free, time-free and within the DDL/DML whitelist.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GuardError {
    #[error("Invalid query: multiple queries, comments or time request.")]
    Unsafe,
    #[error("Invalid query: unsupported statement.")]
    UnsupportedStatement,
    #[error("Invalid query: unknown action {0}.")]
    UnknownAction(String),
    #[error("Invalid query: invalid table name.")]
    BadTable,
}

/// Statement kinds a contract may issue.
const ALLOWED_PREFIXES: &[&str] = &[
    "ALTER INDEX",
    "ALTER TABLE",
    "ALTER TYPE",
    "CREATE INDEX",
    "CREATE TABLE",
    "CREATE TYPE",
    "CREATE UNIQUE INDEX",
    "DELETE",
    "DROP INDEX",
    "DROP TABLE",
    "DROP TYPE",
    "INSERT",
    "SELECT",
    "UPDATE",
    "WITH",
];

/// Session statements the reserved create/delete contract handlers may
/// additionally issue.
const SPECIAL_STATEMENTS: &[&str] = &[
    "SET LOCAL ROLE SMARTCONTRACT",
    "SET LOCAL ROLE SMARTCONTRACTMANAGER",
    "SHOW STATEMENT_TIMEOUT",
];

fn has_keyword_prefix(normalized: &str, prefix: &str) -> bool {
    if !normalized.starts_with(prefix) {
        return false;
    }
    match normalized[prefix.len()..].chars().next() {
        None => true,
        Some(c) => !c.is_ascii_alphanumeric() && c != '_',
    }
}

/// Validate a guest query and return its normalized form (trimmed, with a
/// single terminating `;`). `special_contract` widens the whitelist for
/// the built-in create/delete handlers only.
pub fn check_query(sql: &str, special_contract: bool) -> Result<String, GuardError> {
    let mut query = sql.trim().to_string();
    if !query.ends_with(';') {
        query.push(';');
    }
    let body = &query[..query.len() - 1];
    if body.contains(';') || query.contains("--") {
        return Err(GuardError::Unsafe);
    }
    let lower = query.to_lowercase();
    for needle in ["localtime", "current_date", "current_time"] {
        if lower.contains(needle) {
            return Err(GuardError::Unsafe);
        }
    }

    let normalized = body
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    if ALLOWED_PREFIXES
        .iter()
        .any(|prefix| has_keyword_prefix(&normalized, prefix))
    {
        return Ok(query);
    }
    if special_contract
        && (SPECIAL_STATEMENTS.contains(&normalized.as_str())
            || normalized.starts_with("SET LOCAL STATEMENT_TIMEOUT = "))
    {
        return Ok(query);
    }
    Err(GuardError::UnsupportedStatement)
}
