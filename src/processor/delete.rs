//! Built-in delete-contract handler (the all-ones reserved hash).

use super::{Interrupt, Processor};
use crate::crypto::keys::Address;
use crate::db::{SqlBackend, SqlParam};
use crate::vm::Value;

pub(super) fn execute<B: SqlBackend>(
    p: &mut Processor<B>,
    payload: &serde_json::Value,
    from: &Address,
) -> Result<Value, Interrupt> {
    // Template-checked: a 64-character hex string.
    let hash_hex = payload
        .get("hash")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_lowercase();
    let hash: [u8; 32] = match hex::decode(&hash_hex).ok().and_then(|b| b.try_into().ok()) {
        Some(hash) => hash,
        None => {
            p.outcome.reject(format!(
                "Not creator of contract or contract: {hash_hex} does not exist."
            ));
            return Err(Interrupt::Reject);
        }
    };

    p.special_query("SET LOCAL ROLE smartcontractmanager;", &[])?;
    let result = p.special_query(
        "DELETE FROM basics.contracts WHERE contract_hash = $1 AND creator = $2;",
        &[SqlParam::Bytea(hash.to_vec()), SqlParam::Text(from.to_text())],
    )?;
    if result.row_count == 0 {
        p.outcome.reject(format!(
            "Not creator of contract or contract: {hash_hex} does not exist."
        ));
        return Err(Interrupt::Reject);
    }
    p.special_query("SET LOCAL ROLE smartcontract;", &[])?;

    p.outcome.pending_remove = Some(hash);
    Ok(Value::Undefined)
}
