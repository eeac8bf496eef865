//! Contract registry: the in-memory map behind `basics.contracts`.
//!
//! Loaded once at startup and mutated only when a create- or
//! delete-contract transaction succeeds. After a failed block commit the
//! caller must `reload` so the map matches the rolled-back table again.

use std::collections::HashMap;

use thiserror::Error;

use crate::db::{DbError, SqlBackend};
use crate::template::Template;
use crate::vm::{Script, Value, VmError};

/// All-zeros hash: the built-in create-contract handler.
pub const CREATE_CONTRACT_HASH: [u8; 32] = [0x00; 32];
/// All-ones hash: the built-in delete-contract handler.
pub const DELETE_CONTRACT_HASH: [u8; 32] = [0xFF; 32];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("bad registry row: {0}")]
    BadRow(String),
    #[error("stored contract does not compile: {0}")]
    Compile(#[from] VmError),
}

#[derive(Debug)]
pub struct ContractEntry {
    pub contract_type: String,
    pub contract_version: String,
    pub description: String,
    /// Textual address of the creating identity.
    pub creator: String,
    pub template: Template,
    pub code: Script,
    pub validana_version: u8,
}

#[derive(Debug, Default)]
pub struct Registry {
    contracts: HashMap<[u8; 32], ContractEntry>,
}

impl Registry {
    pub fn load(backend: &mut dyn SqlBackend) -> Result<Self, RegistryError> {
        let mut registry = Registry::default();
        registry.reload(backend)?;
        Ok(registry)
    }

    /// Replace the whole map with the current table contents.
    pub fn reload(&mut self, backend: &mut dyn SqlBackend) -> Result<(), RegistryError> {
        let result = backend.execute(
            "SELECT contract_hash, contract_type, contract_version, description, creator, \
             contract_template, code, validana_version FROM basics.contracts;",
            &[],
        )?;
        let mut contracts = HashMap::with_capacity(result.rows.len());
        for row in &result.rows {
            let (hash, entry) = parse_row(row)?;
            contracts.insert(hash, entry);
        }
        self.contracts = contracts;
        tracing::info!(contracts = self.contracts.len(), "contract registry loaded");
        Ok(())
    }

    pub fn get(&self, hash: &[u8; 32]) -> Option<&ContractEntry> {
        self.contracts.get(hash)
    }

    pub fn install(&mut self, hash: [u8; 32], entry: ContractEntry) {
        tracing::info!(
            contract = %hex::encode(hash),
            contract_type = %entry.contract_type,
            "contract installed"
        );
        self.contracts.insert(hash, entry);
    }

    pub fn remove(&mut self, hash: &[u8; 32]) {
        if self.contracts.remove(hash).is_some() {
            tracing::info!(contract = %hex::encode(hash), "contract removed");
        }
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

fn parse_row(
    row: &std::collections::BTreeMap<String, Value>,
) -> Result<([u8; 32], ContractEntry), RegistryError> {
    let text = |column: &str| -> Result<String, RegistryError> {
        match row.get(column) {
            Some(Value::Str(s)) => Ok(s.clone()),
            other => Err(RegistryError::BadRow(format!("{column}: {other:?}"))),
        }
    };

    let hash_bytes = hex::decode(text("contract_hash")?)
        .map_err(|e| RegistryError::BadRow(format!("contract_hash: {e}")))?;
    let hash: [u8; 32] = hash_bytes
        .try_into()
        .map_err(|_| RegistryError::BadRow("contract_hash: bad length".into()))?;

    let template_json = row
        .get("contract_template")
        .ok_or_else(|| RegistryError::BadRow("contract_template missing".into()))?
        .to_json();
    let template: Template = serde_json::from_value(template_json)
        .map_err(|e| RegistryError::BadRow(format!("contract_template: {e}")))?;

    let code_bytes = hex::decode(text("code")?)
        .map_err(|e| RegistryError::BadRow(format!("code: {e}")))?;
    let source = String::from_utf8(code_bytes)
        .map_err(|_| RegistryError::BadRow("code: not utf-8".into()))?;
    let code = Script::compile(&source)?;

    let validana_version = match row.get("validana_version") {
        Some(Value::Number(n)) if (*n == 1.0 || *n == 2.0) => *n as u8,
        other => return Err(RegistryError::BadRow(format!("validana_version: {other:?}"))),
    };

    Ok((
        hash,
        ContractEntry {
            contract_type: text("contract_type")?,
            contract_version: text("contract_version")?,
            description: text("description")?,
            creator: text("creator")?,
            template,
            code,
            validana_version,
        },
    ))
}

/// Template of the built-in create-contract handler (validated with
/// version-2 semantics, hence the optional field).
pub fn create_contract_template() -> Template {
    Template::from_fields(&[
        ("type", "str", "type", "Contract type"),
        ("version", "str", "version", "Contract version"),
        ("description", "str", "description", "Contract description"),
        ("template", "json", "template", "Payload template of the new contract"),
        ("init", "base64", "init", "Initialization code"),
        ("code", "base64", "code", "Contract body"),
        ("validanaVersion", "uint?", "validanaVersion", "Compatibility version"),
    ])
}

/// Template of the built-in delete-contract handler.
pub fn delete_contract_template() -> Template {
    Template::from_fields(&[("hash", "hash", "hash", "Hash of the contract to delete")])
}
