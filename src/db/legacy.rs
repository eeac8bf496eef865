//! Version-1 positional query surface.
//!
//! v1 contracts call `query(action, table, info, params[, usePrivate])`;
//! the tuple is rendered into one canonical statement and then pushed
//! through the same grammar guard as everything else. `usePrivate`
//! namespaces the table per contract by suffixing the first 16 bytes of
//! the contract hash.

use super::guard::{check_query, GuardError};

/// Hex characters of the contract hash used for the private-table suffix.
const PRIVATE_SUFFIX_HEX: usize = 32;

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The per-contract table name suffix.
pub fn private_suffix(contract_hash: &[u8; 32]) -> String {
    hex::encode(contract_hash)[..PRIVATE_SUFFIX_HEX].to_string()
}

/// Render a legacy call into canonical SQL and validate it.
pub fn translate(
    action: &str,
    table: &str,
    info: &str,
    use_private: bool,
    contract_hash: &[u8; 32],
) -> Result<String, GuardError> {
    if !is_plain_identifier(table) {
        return Err(GuardError::BadTable);
    }
    let table = if use_private {
        format!("{table}_{}", private_suffix(contract_hash))
    } else {
        table.to_string()
    };

    let head = match action.trim().to_uppercase().as_str() {
        "INSERT" => format!("INSERT INTO \"{table}\""),
        "SELECT" => format!("SELECT * FROM \"{table}\""),
        "UPDATE" => format!("UPDATE \"{table}\""),
        "DELETE" => format!("DELETE FROM \"{table}\""),
        "CREATE TABLE" => format!("CREATE TABLE \"{table}\""),
        "CREATE INDEX" => format!("CREATE INDEX ON \"{table}\""),
        "DROP TABLE" => format!("DROP TABLE \"{table}\""),
        "ALTER TABLE" => format!("ALTER TABLE \"{table}\""),
        other => return Err(GuardError::UnknownAction(other.to_string())),
    };

    let info = info.trim();
    let sql = if info.is_empty() { format!("{head};") } else { format!("{head} {info};") };
    // The tuple pieces could still smuggle comments or extra statements.
    check_query(&sql, false)
}
