//! Transaction processor: validate → template-match → execute → conclude.
//!
//! One processor owns one database connection, the contract registry and
//! the sandbox. `process_tx` is strictly serial; the caller opens the
//! surrounding SQL transaction, sets the `smartcontract` role, and commits
//! or rolls back based on the returned status (§ outcome table below).
//!
//! | status     | caller action                         |
//! |------------|---------------------------------------|
//! | Accepted   | commit, include in block              |
//! | V1Rejected | commit, include in block              |
//! | Rejected   | may include in block                  |
//! | Invalid    | roll back, do not include             |
//! | Retry      | leave unprocessed, try later          |

mod create;
mod delete;

use thiserror::Error;

use crate::config::ProcessorConfig;
use crate::crypto::keys::Address;
use crate::crypto::CryptoError;
use crate::db::{
    guard, legacy, types as db_types, DbError, PgBackend, QueryResult, SqlBackend, SqlParam,
};
use crate::registry::{self, ContractEntry, Registry, RegistryError};
use crate::sandbox::Sandbox;
use crate::template::check_payload;
use crate::types::Transaction;
use crate::vm::{HostEnv, HostError, Interrupt, QueryCall, Script, Value};

pub use crate::db::{EXIT_CORRUPTION, EXIT_LOCK_CONFLICT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Accepted,
    V1Rejected,
    Rejected,
    Invalid,
    Retry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxResult {
    pub status: TxStatus,
    /// Accept message, rejection reason or invalidity reason.
    pub message: Option<String>,
}

/// Block-level inputs for one transaction.
#[derive(Debug, Clone, Copy)]
pub struct TxContext {
    pub block_id: u64,
    pub current_block_ts: u64,
    pub previous_block_ts: u64,
    pub previous_block_hash: [u8; 32],
}

pub enum TxSource {
    Bytes(Vec<u8>),
    Typed(Transaction),
}

/// The engine hit an unrecoverable fault; the hosting program must exit
/// with this code (§ exit codes: 50 lock conflict, 51 corruption).
#[derive(Debug, Error)]
#[error("shutdown requested with exit code {code}")]
pub struct Shutdown {
    pub code: i32,
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReservedContract {
    Create,
    Delete,
}

/// Per-call mutable outcome state, reset at the top of every `process_tx`.
#[derive(Default)]
struct TxOutcome {
    invalid: Option<String>,
    rejected: Option<String>,
    retry: bool,
    exit_code: Option<i32>,
    /// First failure among fire-and-forget queries; observed in Finishing.
    fast_failure: Option<String>,
    special: Option<ReservedContract>,
    current_contract: [u8; 32],
    pending_install: Option<([u8; 32], ContractEntry)>,
    pending_remove: Option<[u8; 32]>,
}

impl TxOutcome {
    fn reject(&mut self, reason: String) {
        if self.rejected.is_none() {
            self.rejected = Some(reason);
        }
    }

    fn invalidate(&mut self, reason: String) {
        if self.invalid.is_none() {
            self.invalid = Some(reason);
        }
    }
}

pub struct Processor<B: SqlBackend> {
    backend: B,
    registry: Registry,
    sandbox: Sandbox,
    sign_prefix: Option<Vec<u8>>,
    address: Address,
    is_processing: bool,
    outcome: TxOutcome,
}

impl Processor<PgBackend> {
    /// Connect to the configured database (retrying while unreachable) and
    /// load the registry.
    pub fn connect(config: &ProcessorConfig) -> Result<Self, ProcessorError> {
        let backend = PgBackend::connect_with_retry(&config.database)?;
        let address = Address::from_text(&config.processor.address)?;
        let sign_prefix = (!config.processor.sign_prefix.is_empty())
            .then(|| config.processor.sign_prefix.clone().into_bytes());
        Ok(Self::new(backend, address, sign_prefix)?)
    }
}

impl<B: SqlBackend> Processor<B> {
    pub fn new(
        mut backend: B,
        address: Address,
        sign_prefix: Option<Vec<u8>>,
    ) -> Result<Self, RegistryError> {
        let registry = Registry::load(&mut backend)?;
        Ok(Self {
            backend,
            registry,
            sandbox: Sandbox::new(),
            sign_prefix,
            address,
            is_processing: false,
            outcome: TxOutcome::default(),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    /// The underlying connection. The caller drives the surrounding SQL
    /// transaction (BEGIN/COMMIT/ROLLBACK, initial role) through this.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Re-read `basics.contracts`. Required after the caller rolls back a
    /// block whose transactions had already mutated the in-memory map.
    pub fn reload_registry(&mut self) -> Result<(), RegistryError> {
        self.registry.reload(&mut self.backend)
    }

    /// Process one transaction inside the caller's open DB transaction.
    ///
    /// Re-entry is a programming error: a call that was torn down
    /// mid-flight leaves the processor poisoned and the next call panics.
    pub fn process_tx(
        &mut self,
        source: TxSource,
        context: &TxContext,
        verify_signature: bool,
    ) -> Result<TxResult, Shutdown> {
        if self.is_processing {
            panic!("process_tx re-entered while a transaction is in flight");
        }
        self.is_processing = true;
        self.outcome = TxOutcome::default();

        let executed = self.run_tx(source, context, verify_signature);
        self.sandbox.leave();
        let result = self.conclude(executed);
        self.is_processing = false;
        result
    }

    /// Validation, template match and execution. Returns the contract's
    /// compatibility version and raw result once execution was reached.
    fn run_tx(
        &mut self,
        source: TxSource,
        context: &TxContext,
        verify_signature: bool,
    ) -> Option<(u8, Result<Value, Interrupt>)> {
        // Validating.
        let tx = match source {
            TxSource::Bytes(bytes) => match Transaction::from_bytes(bytes) {
                Ok(tx) => tx,
                Err(e) => {
                    self.outcome.invalidate(e.to_string());
                    return None;
                }
            },
            TxSource::Typed(tx) => tx,
        };
        if verify_signature {
            let Some(prefix) = self.sign_prefix.clone() else {
                tracing::error!("sign prefix not configured, cannot verify signatures");
                self.outcome.retry = true;
                return None;
            };
            if !tx.verify_signature(&prefix) {
                self.outcome.invalidate("Invalid signature.".to_string());
                return None;
            }
        }
        if tx.valid_till() != 0 && context.previous_block_ts >= tx.valid_till() {
            self.outcome.invalidate("Transaction valid till expired.".to_string());
            return None;
        }

        // TemplateMatching.
        let hash = tx.contract_hash();
        self.outcome.current_contract = hash;
        let (template, version) = if hash == registry::CREATE_CONTRACT_HASH {
            self.outcome.special = Some(ReservedContract::Create);
            (registry::create_contract_template(), 2)
        } else if hash == registry::DELETE_CONTRACT_HASH {
            self.outcome.special = Some(ReservedContract::Delete);
            (registry::delete_contract_template(), 2)
        } else {
            match self.registry.get(&hash) {
                None => {
                    self.outcome.reject("Contract does not exist.".to_string());
                    return None;
                }
                Some(entry) => (entry.template.clone(), entry.validana_version),
            }
        };
        let payload = tx.payload_json().unwrap_or(serde_json::Value::Null);
        if let Some(reason) = check_payload(&payload, &template, version) {
            self.outcome.invalidate(reason);
            return None;
        }

        // Executing.
        self.sandbox.enter();
        let from = tx.public_key().address();
        let result = match self.outcome.special {
            Some(ReservedContract::Create) => {
                create::execute(self, &payload, &from, &tx, context)
            }
            Some(ReservedContract::Delete) => delete::execute(self, &payload, &from),
            None => {
                let globals = user_arguments(&payload, &from, &self.address, &tx, context);
                let entry = self.registry.get(&hash).expect("looked up above");
                let script = entry.code.clone();
                self.run_script(&script, globals)
            }
        };
        Some((version, result))
    }

    /// Finishing: fold the execution result and accumulated outcome state
    /// into the caller-facing status.
    fn conclude(
        &mut self,
        executed: Option<(u8, Result<Value, Interrupt>)>,
    ) -> Result<TxResult, Shutdown> {
        let mut accepted: Option<String> = None;
        let mut v1_rejected: Option<String> = None;

        if let Some((version, result)) = executed {
            match result {
                Ok(value) => {
                    if version == 1 {
                        match value {
                            Value::Str(s) if s == "OK" => accepted = Some(s),
                            Value::Str(s) => v1_rejected = Some(s),
                            _ => v1_rejected = Some("Unknown result type".to_string()),
                        }
                    } else if let Value::Str(s) = value {
                        accepted = Some(s);
                    }
                }
                Err(Interrupt::Reject) => {} // reason recorded by the host
                Err(Interrupt::Error(e)) => self.outcome.invalidate(e.to_string()),
                Err(Interrupt::Host(HostError::Abort(reason))) => {
                    self.outcome.invalidate(reason)
                }
                Err(Interrupt::Host(HostError::Retry)) => self.outcome.retry = true,
                Err(Interrupt::Host(HostError::Fatal(code))) => {
                    self.outcome.exit_code = Some(code)
                }
            }
        }

        // Drained fast queries may invalidate a transaction that otherwise
        // looked fine.
        if !self.outcome.retry && self.outcome.exit_code.is_none() {
            if let Some(reason) = self.outcome.fast_failure.take() {
                self.outcome.invalidate(format!("Fast query failed: {reason}"));
            }
        }

        if let Some(code) = self.outcome.exit_code {
            tracing::error!(code, "unrecoverable database failure, requesting shutdown");
            return Err(Shutdown { code });
        }

        // A failed create/delete must never end up in a block.
        if self.outcome.special.is_some() {
            if let Some(reason) = self.outcome.rejected.take() {
                self.outcome.invalidate(reason);
            }
        }

        if self.outcome.retry {
            return Ok(TxResult { status: TxStatus::Retry, message: None });
        }
        if let Some(reason) = self.outcome.invalid.take() {
            return Ok(TxResult { status: TxStatus::Invalid, message: Some(reason) });
        }
        if let Some(reason) = self.outcome.rejected.take() {
            return Ok(TxResult { status: TxStatus::Rejected, message: Some(reason) });
        }
        if let Some(reason) = v1_rejected {
            return Ok(TxResult { status: TxStatus::V1Rejected, message: Some(reason) });
        }

        // Success: apply deferred registry mutations.
        if let Some((hash, entry)) = self.outcome.pending_install.take() {
            self.registry.install(hash, entry);
        }
        if let Some(hash) = self.outcome.pending_remove.take() {
            self.registry.remove(&hash);
        }
        Ok(TxResult { status: TxStatus::Accepted, message: accepted })
    }

    /// Run a compiled script against this processor's guest context.
    pub(crate) fn run_script(
        &mut self,
        script: &Script,
        globals: Vec<(String, Value)>,
    ) -> Result<Value, Interrupt> {
        let Self { backend, outcome, sandbox, .. } = self;
        let mut ctx = GuestCtx { backend, outcome, sandbox };
        script.run(globals, &mut ctx)
    }

    /// Guarded query path for the reserved handlers: same grammar guard as
    /// guest queries (with the special-contract exception), but errors map
    /// straight onto interrupts.
    pub(crate) fn special_query(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<QueryResult, Interrupt> {
        let checked = guard::check_query(sql, true)
            .map_err(|e| HostError::Abort(e.to_string()))?;
        self.backend.execute(&checked, params).map_err(|e| host_error(e).into())
    }
}

/// The eight positional arguments every user contract receives.
fn user_arguments(
    payload: &serde_json::Value,
    from: &Address,
    processor: &Address,
    tx: &Transaction,
    context: &TxContext,
) -> Vec<(String, Value)> {
    let mut args = init_arguments(from, processor, tx, context);
    args.insert(0, ("payload".to_string(), Value::from_json(payload)));
    args
}

/// Init bodies get the same arguments minus the payload.
fn init_arguments(
    from: &Address,
    processor: &Address,
    tx: &Transaction,
    context: &TxContext,
) -> Vec<(String, Value)> {
    vec![
        ("from".to_string(), Value::Str(from.to_text())),
        ("block".to_string(), Value::Number(context.block_id as f64)),
        ("processor".to_string(), Value::Str(processor.to_text())),
        (
            "previousBlockTimestamp".to_string(),
            Value::Number(context.previous_block_ts as f64),
        ),
        (
            "previousBlockHash".to_string(),
            Value::Str(hex::encode(context.previous_block_hash)),
        ),
        ("transactionId".to_string(), Value::Str(tx.id_hex())),
        (
            "currentBlockTimestamp".to_string(),
            Value::Number(context.current_block_ts as f64),
        ),
    ]
}

/// Map a database error onto the host-error taxonomy for non-catchable
/// paths (reserved handlers, fast queries).
fn host_error(error: DbError) -> HostError {
    match error {
        DbError::Connectivity(_) => HostError::Retry,
        DbError::Corruption(_) => HostError::Fatal(EXIT_CORRUPTION),
        DbError::LockConflict => HostError::Fatal(EXIT_LOCK_CONFLICT),
        other => HostError::Abort(other.to_string()),
    }
}

// ── Guest context ────────────────────────────────────────────────────────

struct GuestCtx<'a> {
    backend: &'a mut dyn SqlBackend,
    outcome: &'a mut TxOutcome,
    sandbox: &'a Sandbox,
}

impl GuestCtx<'_> {
    fn build_query(&self, call: &QueryCall) -> Result<(String, Vec<SqlParam>), HostError> {
        let args = &call.args;
        // Legacy positional surface: (action, table, info, params[, usePrivate]).
        if args.len() >= 4 {
            let (Some(action), Some(table), Some(info), Some(Value::Array(params))) = (
                args[0].as_str(),
                args[1].as_str(),
                args[2].as_str(),
                args.get(3),
            ) else {
                return Err(HostError::Abort(
                    "Invalid query: bad legacy call arguments.".to_string(),
                ));
            };
            let use_private = args.get(4).map(Value::truthy).unwrap_or(false);
            let sql = legacy::translate(
                action,
                table,
                info,
                use_private,
                &self.outcome.current_contract,
            )
            .map_err(|e| HostError::Abort(e.to_string()))?;
            let params = convert_params(params)?;
            return Ok((sql, params));
        }

        let Some(Value::Str(sql)) = args.first() else {
            return Err(HostError::Abort("Invalid query: no statement given.".to_string()));
        };
        let params = match args.get(1) {
            None | Some(Value::Undefined) | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => convert_params(items)?,
            Some(other) => {
                return Err(HostError::Abort(format!(
                    "Invalid query: parameters must be an array, not {}.",
                    other.type_name()
                )))
            }
        };
        let sql = guard::check_query(sql, self.outcome.special.is_some())
            .map_err(|e| HostError::Abort(e.to_string()))?;
        Ok((sql, params))
    }
}

fn convert_params(items: &[Value]) -> Result<Vec<SqlParam>, HostError> {
    items
        .iter()
        .map(|v| db_types::param_from_value(v).map_err(|e| HostError::Abort(e.to_string())))
        .collect()
}

fn query_result_value(result: QueryResult) -> Value {
    let rows = result
        .rows
        .into_iter()
        .map(Value::Object)
        .collect::<Vec<_>>();
    Value::Object(
        [
            ("rows".to_string(), Value::Array(rows)),
            ("rowCount".to_string(), Value::Number(result.row_count as f64)),
        ]
        .into_iter()
        .collect(),
    )
}

impl HostEnv for GuestCtx<'_> {
    fn query(&mut self, call: QueryCall) -> Result<Result<Value, Value>, HostError> {
        let (sql, params) = self.build_query(&call)?;
        match self.backend.execute(&sql, &params) {
            Ok(result) => {
                if call.fast {
                    Ok(Ok(Value::Undefined))
                } else {
                    Ok(Ok(query_result_value(result)))
                }
            }
            Err(DbError::Constraint { code }) => {
                if call.fast {
                    // The guest cannot observe fast queries; fail the
                    // transaction when the queue is drained.
                    if self.outcome.fast_failure.is_none() {
                        self.outcome.fast_failure =
                            Some(format!("constraint violation ({code})"));
                    }
                    Ok(Ok(Value::Undefined))
                } else {
                    // Deterministic, guest-catchable: code preserved, host
                    // detail stripped.
                    let error = Value::Object(
                        [
                            ("code".to_string(), Value::Str(code)),
                            (
                                "message".to_string(),
                                Value::Str("Constraint violation.".to_string()),
                            ),
                        ]
                        .into_iter()
                        .collect(),
                    );
                    Ok(Err(error))
                }
            }
            Err(e @ (DbError::Connectivity(_) | DbError::Corruption(_) | DbError::LockConflict)) => {
                Err(host_error(e))
            }
            Err(other) => {
                if call.fast {
                    if self.outcome.fast_failure.is_none() {
                        self.outcome.fast_failure = Some(other.to_string());
                    }
                    Ok(Ok(Value::Undefined))
                } else {
                    Err(HostError::Abort(other.to_string()))
                }
            }
        }
    }

    fn reject(&mut self, reason: String) {
        self.outcome.reject(reason);
    }

    fn json_parse(&mut self, text: &str) -> Value {
        // Execution always happens inside the sandbox, where bad input is
        // the undefined sentinel rather than an error.
        self.sandbox.json_parse(text).unwrap_or(Value::Undefined)
    }
}
