//! SQL adapter: one persistent Postgres connection per processor.
//!
//! The engine is strictly serial, so the client is the blocking `postgres`
//! driver; the only suspension points a contract sees are its own queries.
//! Everything above this module talks to the [`SqlBackend`] trait — the
//! production impl wraps a live connection, tests script their own.

pub mod guard;
pub mod legacy;
pub mod types;

use crate::config::DatabaseSection;
use crate::vm::Value;
use postgres::{Client, NoTls, Statement};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Exit code when another processor holds the advisory lock (SQLSTATE 53300).
pub const EXIT_LOCK_CONFLICT: i32 = 50;
/// Exit code on database/index corruption (SQLSTATE XX001/XX002).
pub const EXIT_CORRUPTION: i32 = 51;

#[derive(Debug, Error)]
pub enum DbError {
    /// Connection-level failure (class 08 except 08P01, or no connection at
    /// all). Retryable.
    #[error("database connection failure: {0}")]
    Connectivity(String),
    /// SQLSTATE XX001/XX002. Fatal; shut down with [`EXIT_CORRUPTION`].
    #[error("database corruption ({0})")]
    Corruption(String),
    /// SQLSTATE 53300: another instance owns the connection slot/lock.
    #[error("another instance holds the lock")]
    LockConflict,
    /// Class 23: deterministic constraint violation, surfaced to the guest
    /// with the code preserved and host detail stripped.
    #[error("constraint violation ({code})")]
    Constraint { code: String },
    /// A value that cannot be represented deterministically for the guest.
    #[error("cannot decode row: {0}")]
    Decode(String),
    /// A parameter the guest passed that cannot be bound.
    #[error("cannot bind parameter: {0}")]
    BadParam(String),
    /// Everything else: invalidates the transaction.
    #[error("query failed: {0}")]
    Other(String),
}

/// Result rows are name → guest value maps with deterministic key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<BTreeMap<String, Value>>,
    pub row_count: u64,
}

/// Typed query parameter, the bridge between guest values and the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytea(Vec<u8>),
    Json(serde_json::Value),
}

pub trait SqlBackend {
    fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<QueryResult, DbError>;
}

// ── Production backend ───────────────────────────────────────────────────

/// Contracts re-issue the same statements constantly; prepared statements
/// are cached per connection up to this many entries.
const STATEMENT_CACHE_LIMIT: usize = 512;

pub struct PgBackend {
    client: Client,
    statements: HashMap<String, Statement>,
}

impl PgBackend {
    /// Single connection attempt, applying the configured session
    /// statement timeout.
    pub fn connect(cfg: &DatabaseSection) -> Result<Self, DbError> {
        let params = format!(
            "host={} port={} user={} password={} dbname={}",
            cfg.host, cfg.port, cfg.user, cfg.password, cfg.database
        );
        let mut client = Client::connect(&params, NoTls).map_err(classify)?;
        client
            .batch_execute(&format!("SET statement_timeout = {};", cfg.statement_timeout_ms))
            .map_err(classify)?;
        tracing::info!(host = %cfg.host, db = %cfg.database, "database connected");
        Ok(Self { client, statements: HashMap::new() })
    }

    fn prepared(&mut self, sql: &str) -> Result<Statement, postgres::Error> {
        if let Some(statement) = self.statements.get(sql) {
            return Ok(statement.clone());
        }
        let statement = self.client.prepare(sql)?;
        if self.statements.len() >= STATEMENT_CACHE_LIMIT {
            self.statements.clear();
        }
        self.statements.insert(sql.to_string(), statement.clone());
        Ok(statement)
    }

    /// Connect, retrying connectivity failures at the configured interval.
    /// Non-retryable failures are returned immediately.
    pub fn connect_with_retry(cfg: &DatabaseSection) -> Result<Self, DbError> {
        loop {
            match Self::connect(cfg) {
                Ok(backend) => return Ok(backend),
                Err(DbError::Connectivity(reason)) => {
                    tracing::warn!(
                        %reason,
                        retry_in_s = cfg.retry_interval_s,
                        "database unreachable, retrying"
                    );
                    std::thread::sleep(std::time::Duration::from_secs(cfg.retry_interval_s));
                }
                Err(other) => return Err(other),
            }
        }
    }
}

impl SqlBackend for PgBackend {
    fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<QueryResult, DbError> {
        let args: Vec<&(dyn postgres::types::ToSql + Sync)> =
            params.iter().map(types::param_as_dyn).collect();
        // Only parameterized statements go through the prepared cache;
        // session statements and contract DDL are one-shot.
        let cached = if params.is_empty() { None } else { Some(self.prepared(sql)) };
        if returns_rows(sql) {
            let rows = match cached {
                Some(statement) => {
                    let statement = statement.map_err(classify)?;
                    self.client.query(&statement, &args)
                }
                None => self.client.query(sql, &args),
            }
            .map_err(classify)?;
            let row_count = rows.len() as u64;
            let rows = rows
                .iter()
                .map(types::row_to_values)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(QueryResult { rows, row_count })
        } else {
            let row_count = match cached {
                Some(statement) => {
                    let statement = statement.map_err(classify)?;
                    self.client.execute(&statement, &args)
                }
                None => self.client.execute(sql, &args),
            }
            .map_err(classify)?;
            Ok(QueryResult { rows: Vec::new(), row_count })
        }
    }
}

/// Whether the statement produces rows (and so must go through `query`
/// rather than `execute`).
fn returns_rows(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    upper.starts_with("SELECT")
        || upper.starts_with("WITH")
        || upper.starts_with("SHOW")
        || upper.contains(" RETURNING ")
}

/// Map a driver error onto the engine's taxonomy (§ error handling).
pub fn classify(error: postgres::Error) -> DbError {
    let Some(state) = error.code() else {
        // No SQLSTATE: socket-level failure, timeout, closed connection.
        return DbError::Connectivity(error.to_string());
    };
    let code = state.code();
    match code {
        "XX001" | "XX002" => DbError::Corruption(code.to_string()),
        "53300" => DbError::LockConflict,
        c if c.starts_with("08") && c != "08P01" => DbError::Connectivity(error.to_string()),
        c if c.starts_with("23") => DbError::Constraint { code: code.to_string() },
        _ => DbError::Other(error.to_string()),
    }
}

impl DbError {
    /// Fatal errors carry the exit code the hosting program must use.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            DbError::Corruption(_) => Some(EXIT_CORRUPTION),
            DbError::LockConflict => Some(EXIT_LOCK_CONFLICT),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_rows_dispatch() {
        assert!(returns_rows("SELECT 1;"));
        assert!(returns_rows("  with x as (select 1) select * from x;"));
        assert!(returns_rows("SHOW statement_timeout;"));
        assert!(returns_rows("INSERT INTO t (a) VALUES (1) RETURNING a;"));
        assert!(!returns_rows("INSERT INTO t (a) VALUES (1);"));
        assert!(!returns_rows("DELETE FROM t;"));
        assert!(!returns_rows("SET LOCAL ROLE smartcontract;"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(DbError::Corruption("XX001".into()).exit_code(), Some(51));
        assert_eq!(DbError::LockConflict.exit_code(), Some(50));
        assert_eq!(DbError::Connectivity("x".into()).exit_code(), None);
        assert_eq!(
            DbError::Constraint { code: "23505".into() }.exit_code(),
            None
        );
    }
}
