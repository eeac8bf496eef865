//! Determinism barrier around contract execution.
//!
//! While a contract runs, every host facility that could leak
//! non-determinism is unavailable: the clock, randomness, and
//! raising JSON decoding (bad input yields `undefined` instead of an
//! error, so a contract cannot branch on host exception behavior).
//! `enter` and `leave` are idempotent; the processor brackets every
//! execution with them and nothing else flips the flag.

use crate::vm::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("non-deterministic operation inside sandbox")]
    NonDeterminism,
    #[error("invalid json: {0}")]
    Json(String),
}

#[derive(Debug, Default)]
pub struct Sandbox {
    active: bool,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&mut self) {
        self.active = true;
    }

    pub fn leave(&mut self) {
        self.active = false;
    }

    pub fn is_sandboxed(&self) -> bool {
        self.active
    }

    /// Parse JSON text. Inside the sandbox bad input yields `undefined`;
    /// outside it is an error the host must handle.
    pub fn json_parse(&self, text: &str) -> Result<Value, SandboxError> {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(json) => Ok(Value::from_json(&json)),
            Err(e) => {
                if self.active {
                    Ok(Value::Undefined)
                } else {
                    Err(SandboxError::Json(e.to_string()))
                }
            }
        }
    }

    /// Wall clock in milliseconds. Unreachable while a contract runs;
    /// block timestamps are passed to contracts as plain arguments.
    pub fn current_time_ms(&self) -> Result<u64, SandboxError> {
        if self.active {
            return Err(SandboxError::NonDeterminism);
        }
        Ok(SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0))
    }

    /// Host randomness. Unreachable while a contract runs.
    pub fn random_bytes(&self, n: usize) -> Result<Vec<u8>, SandboxError> {
        if self.active {
            return Err(SandboxError::NonDeterminism);
        }
        use rand::RngCore;
        let mut out = vec![0u8; n];
        rand::rngs::OsRng.fill_bytes(&mut out);
        Ok(out)
    }
}
