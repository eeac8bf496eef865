//! Deterministic script engine for contract code.
//!
//! Contracts are written in a strict JavaScript-like dialect, compiled to a
//! syntax tree at registration time and interpreted per transaction. The
//! engine exposes no clock, randomness, locale, timers or host escape;
//! every effect goes through the [`env::HostEnv`] the processor supplies.

pub mod ast;
pub mod env;
pub mod errors;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod value;

pub use env::{HostEnv, HostError, QueryCall};
pub use errors::{Interrupt, VmError};
pub use value::Value;

use ast::Stmt;

/// A compiled contract body. Compilation happens once (at create-contract
/// or registry load); running is cheap and reusable.
#[derive(Clone, Debug)]
pub struct Script {
    source: String,
    body: Vec<Stmt>,
}

impl Script {
    pub fn compile(source: &str) -> Result<Script, VmError> {
        let body = parser::parse(source)?;
        Ok(Script { source: source.to_string(), body })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Execute with the given root bindings. The returned value is the
    /// script's `return` value (or `undefined` when it runs off the end).
    pub fn run(
        &self,
        globals: Vec<(String, Value)>,
        host: &mut dyn HostEnv,
    ) -> Result<Value, Interrupt> {
        interpreter::run(&self.body, globals, host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_keeps_source() {
        let script = Script::compile("return 1;").unwrap();
        assert_eq!(script.source(), "return 1;");
    }

    #[test]
    fn test_compile_rejects_bad_source() {
        assert!(matches!(
            Script::compile("let = ;"),
            Err(VmError::Parse { .. })
        ));
    }
}
