use super::env::HostError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    #[error("parse error at line {line}: {message}")]
    Parse { line: u32, message: String },
    #[error("{0}")]
    Runtime(String),
    #[error("call depth limit exceeded")]
    CallDepth,
    #[error("execution budget exhausted")]
    OutOfFuel,
}

impl VmError {
    pub fn runtime(message: impl Into<String>) -> Self {
        VmError::Runtime(message.into())
    }
}

/// Why a script stopped before producing a return value.
#[derive(Debug)]
pub enum Interrupt {
    /// The guest called `reject()`; the reason is recorded in the host.
    Reject,
    /// A guest-level fault (bad member access, type error, budget).
    Error(VmError),
    /// A host-level fault that outranks the guest (connectivity, shutdown).
    Host(HostError),
}

impl From<VmError> for Interrupt {
    fn from(e: VmError) -> Self {
        Interrupt::Error(e)
    }
}

impl From<HostError> for Interrupt {
    fn from(e: HostError) -> Self {
        Interrupt::Host(e)
    }
}
