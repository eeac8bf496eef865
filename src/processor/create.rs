//! Built-in create-contract handler (the all-zeros reserved hash).

use super::{init_arguments, Interrupt, Processor, TxContext};
use crate::crypto::{self, keys::Address};
use crate::db::{SqlBackend, SqlParam};
use crate::registry::{self, ContractEntry};
use crate::template::{Template, TemplateField};
use crate::types::Transaction;
use crate::vm::{Script, Value};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Prepended byte-for-byte to version-2 contract sources before hashing
/// and compilation.
pub const STRICT_PROLOG: &str = "\"use strict\";\n";

/// `try … catch` with anything in between is forbidden: deterministic
/// errors must stay on the query promise where the engine can see them.
fn has_try_catch(source: &str) -> bool {
    let Some(t) = source.find("try") else {
        return false;
    };
    let rest = &source[t + 3..];
    // Adjacent "trycatch" is just an identifier fragment; any gap is not.
    rest.get(1..).is_some_and(|tail| tail.contains("catch"))
}

/// Every `query(` must be immediately preceded by `await `.
fn has_unawaited_query(source: &str) -> bool {
    let mut start = 0;
    while let Some(offset) = source[start..].find("query(") {
        let idx = start + offset;
        let awaited = idx >= 6 && &source[idx - 6..idx] == "await ";
        if !awaited {
            return true;
        }
        start = idx + 6;
    }
    false
}

struct CreateRequest {
    contract_type: String,
    contract_version: String,
    description: String,
    template_json: serde_json::Value,
    template: Template,
    init_source: String,
    code_source: String,
    validana_version: u8,
}

/// Validate the payload into a concrete request, or give the rejection
/// reason. All checks here are policy; the payload already matched the
/// built-in template.
fn validate_request(payload: &serde_json::Value) -> Result<CreateRequest, String> {
    let text = |key: &str| payload.get(key).and_then(|v| v.as_str()).unwrap_or("");
    let contract_type = text("type");
    let contract_version = text("version");
    let description = text("description");
    if contract_type.len() > 64 {
        return Err("Contract type is too long.".to_string());
    }
    if contract_version.len() > 32 {
        return Err("Contract version is too long.".to_string());
    }
    if description.len() > 256 {
        return Err("Contract description is too long.".to_string());
    }

    let validana_version = payload
        .get("validanaVersion")
        .and_then(|v| v.as_u64())
        .unwrap_or(1);
    if validana_version != 1 && validana_version != 2 {
        return Err("Invalid validanaVersion.".to_string());
    }

    let template_json = payload.get("template").cloned().unwrap_or(serde_json::Value::Null);
    let template = parse_template(&template_json)
        .ok_or_else(|| "Invalid contract template.".to_string())?;

    let decode = |key: &str| -> Result<String, String> {
        let bytes = BASE64
            .decode(text(key))
            .map_err(|_| format!("Contract {key} is not valid base64."))?;
        String::from_utf8(bytes).map_err(|_| format!("Contract {key} is not valid utf-8."))
    };
    let mut init_source = decode("init")?;
    let mut code_source = decode("code")?;
    if init_source.is_empty() && code_source.is_empty() {
        return Err("Contract init and code cannot both be empty.".to_string());
    }
    if validana_version != 1 {
        if !init_source.is_empty() {
            init_source = format!("{STRICT_PROLOG}{init_source}");
        }
        code_source = format!("{STRICT_PROLOG}{code_source}");
    }
    for source in [&init_source, &code_source] {
        if has_try_catch(source) {
            return Err("Contract may not use try catch.".to_string());
        }
        if has_unawaited_query(source) {
            return Err("Queries must be awaited.".to_string());
        }
    }

    Ok(CreateRequest {
        contract_type: contract_type.to_string(),
        contract_version: contract_version.to_string(),
        description: description.to_string(),
        template_json,
        template,
        init_source,
        code_source,
        validana_version: validana_version as u8,
    })
}

/// The new contract's template must be an object of
/// `{type, name, desc}` descriptors, nothing more and nothing less.
fn parse_template(value: &serde_json::Value) -> Option<Template> {
    let object = value.as_object()?;
    let mut fields = std::collections::BTreeMap::new();
    for (key, descriptor) in object {
        if key.len() > 64 {
            return None;
        }
        let descriptor = descriptor.as_object()?;
        if descriptor.len() != 3 {
            return None;
        }
        let part = |name: &str, max: usize| -> Option<String> {
            let text = descriptor.get(name)?.as_str()?;
            (text.len() <= max).then(|| text.to_string())
        };
        fields.insert(
            key.clone(),
            TemplateField {
                field_type: part("type", 64)?,
                name: part("name", 64)?,
                desc: part("desc", 256)?,
            },
        );
    }
    Some(Template(fields))
}

pub(super) fn execute<B: SqlBackend>(
    p: &mut Processor<B>,
    payload: &serde_json::Value,
    from: &Address,
    tx: &Transaction,
    context: &TxContext,
) -> Result<Value, Interrupt> {
    let reject = |p: &mut Processor<B>, reason: String| -> Interrupt {
        p.outcome.reject(reason);
        Interrupt::Reject
    };

    if *from != p.address {
        return Err(reject(p, "Only the processor can create new contracts.".to_string()));
    }
    let request = match validate_request(payload) {
        Ok(request) => request,
        Err(reason) => return Err(reject(p, reason)),
    };

    let contract_hash = crypto::hash256(request.code_source.as_bytes());
    if contract_hash == registry::CREATE_CONTRACT_HASH
        || contract_hash == registry::DELETE_CONTRACT_HASH
    {
        return Err(reject(p, "Contract hash collides with a reserved hash.".to_string()));
    }

    let code = match Script::compile(&request.code_source) {
        Ok(script) => script,
        Err(e) => return Err(reject(p, format!("Contract code does not compile: {e}"))),
    };
    let init = if request.init_source.is_empty() {
        None
    } else {
        match Script::compile(&request.init_source) {
            Ok(script) => Some(script),
            Err(e) => return Err(reject(p, format!("Contract init does not compile: {e}"))),
        }
    };

    // Registry writes need the manager role; everything below runs inside
    // the caller's transaction, so SET LOCAL scopes privilege correctly.
    p.special_query("SET LOCAL ROLE smartcontractmanager;", &[])?;
    let existing = p.special_query(
        "SELECT contract_hash FROM basics.contracts WHERE contract_hash = $1;",
        &[SqlParam::Bytea(contract_hash.to_vec())],
    )?;
    if existing.row_count > 0 {
        return Err(reject(p, "Contract already exists.".to_string()));
    }

    if let Some(init) = &init {
        p.special_query("SET LOCAL ROLE smartcontract;", &[])?;
        // The init body may build tables and seed data; it runs without a
        // statement timeout, restored before anything else happens.
        let previous_timeout = p
            .special_query("SHOW statement_timeout;", &[])?
            .rows
            .first()
            .and_then(|row| row.get("statement_timeout").cloned())
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "0".to_string());
        p.special_query("SET LOCAL statement_timeout = 0;", &[])?;

        let processor_address = p.address.clone();
        let globals = init_arguments(from, &processor_address, tx, context);
        p.run_script(init, globals)?;

        p.special_query(
            &format!("SET LOCAL statement_timeout = '{previous_timeout}';"),
            &[],
        )?;
        p.special_query("SET LOCAL ROLE smartcontractmanager;", &[])?;
    }

    p.special_query(
        "INSERT INTO basics.contracts (contract_hash, contract_type, contract_version, \
         description, creator, contract_template, code, validana_version) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8);",
        &[
            SqlParam::Bytea(contract_hash.to_vec()),
            SqlParam::Text(request.contract_type.clone()),
            SqlParam::Text(request.contract_version.clone()),
            SqlParam::Text(request.description.clone()),
            SqlParam::Text(from.to_text()),
            SqlParam::Json(request.template_json.clone()),
            SqlParam::Bytea(request.code_source.clone().into_bytes()),
            SqlParam::Int(request.validana_version as i64),
        ],
    )?;
    p.special_query("SET LOCAL ROLE smartcontract;", &[])?;

    p.outcome.pending_install = Some((
        contract_hash,
        ContractEntry {
            contract_type: request.contract_type,
            contract_version: request.contract_version,
            description: request.description,
            creator: from.to_text(),
            template: request.template,
            code,
            validana_version: request.validana_version,
        },
    ));
    Ok(Value::Undefined)
}
