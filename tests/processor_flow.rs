//! End-to-end processor scenarios over a scripted database backend.
//!
//! The mock emulates exactly the statements the flows below issue: the
//! `basics.contracts` registry table and one user table (`test`) with an
//! (addr, called) counter row per address.

use std::collections::{BTreeMap, HashMap};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use validana::crypto::keys::PrivateKey;
use validana::db::{DbError, QueryResult, SqlBackend, SqlParam};
use validana::processor::{Processor, TxContext, TxSource, TxStatus};
use validana::types::{Transaction, TxData};
use validana::vm::Value;

const SIGN_PREFIX: &[u8] = b"bla";
const WIF: &str = "KxLJSyM1111111111111111111111111111111111111119cskYz";

// ── Mock backend ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct StoredContract {
    contract_type: String,
    contract_version: String,
    description: String,
    creator: String,
    template: serde_json::Value,
    code: Vec<u8>,
    validana_version: i64,
}

#[derive(Default)]
struct MockDb {
    contracts: HashMap<String, StoredContract>,
    counter_table: HashMap<String, i64>,
    executed: Vec<String>,
    fail_next: Option<DbError>,
    fail_on_insert_test: bool,
}

fn text_param(params: &[SqlParam], i: usize) -> String {
    match &params[i] {
        SqlParam::Text(s) => s.clone(),
        other => panic!("expected text param at {i}, got {other:?}"),
    }
}

fn bytea_param(params: &[SqlParam], i: usize) -> Vec<u8> {
    match &params[i] {
        SqlParam::Bytea(b) => b.clone(),
        other => panic!("expected bytea param at {i}, got {other:?}"),
    }
}

fn int_param(params: &[SqlParam], i: usize) -> i64 {
    match &params[i] {
        SqlParam::Int(n) => *n,
        other => panic!("expected int param at {i}, got {other:?}"),
    }
}

fn row(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

impl SqlBackend for MockDb {
    fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<QueryResult, DbError> {
        self.executed.push(sql.to_string());
        if let Some(error) = self.fail_next.take() {
            return Err(error);
        }
        let upper = sql.trim().to_uppercase();

        if upper.starts_with("SHOW STATEMENT_TIMEOUT") {
            return Ok(QueryResult {
                rows: vec![row(&[("statement_timeout", Value::Str("2s".into()))])],
                row_count: 1,
            });
        }
        if upper.starts_with("SET LOCAL") {
            return Ok(QueryResult::default());
        }

        // Registry load.
        if sql.starts_with("SELECT contract_hash, contract_type") {
            let rows = self
                .contracts
                .iter()
                .map(|(hash, c)| {
                    row(&[
                        ("contract_hash", Value::Str(hash.clone())),
                        ("contract_type", Value::Str(c.contract_type.clone())),
                        ("contract_version", Value::Str(c.contract_version.clone())),
                        ("description", Value::Str(c.description.clone())),
                        ("creator", Value::Str(c.creator.clone())),
                        ("contract_template", Value::from_json(&c.template)),
                        ("code", Value::Str(hex::encode(&c.code))),
                        (
                            "validana_version",
                            Value::Number(c.validana_version as f64),
                        ),
                    ])
                })
                .collect::<Vec<_>>();
            let row_count = rows.len() as u64;
            return Ok(QueryResult { rows, row_count });
        }

        // Existence probe during create-contract.
        if sql.starts_with("SELECT contract_hash FROM basics.contracts") {
            let hash = hex::encode(bytea_param(params, 0));
            let rows = if self.contracts.contains_key(&hash) {
                vec![row(&[("contract_hash", Value::Str(hash))])]
            } else {
                vec![]
            };
            let row_count = rows.len() as u64;
            return Ok(QueryResult { rows, row_count });
        }

        if sql.starts_with("INSERT INTO basics.contracts") {
            let hash = hex::encode(bytea_param(params, 0));
            let template = match &params[5] {
                SqlParam::Json(j) => j.clone(),
                other => panic!("expected json template, got {other:?}"),
            };
            self.contracts.insert(
                hash,
                StoredContract {
                    contract_type: text_param(params, 1),
                    contract_version: text_param(params, 2),
                    description: text_param(params, 3),
                    creator: text_param(params, 4),
                    template,
                    code: bytea_param(params, 6),
                    validana_version: int_param(params, 7),
                },
            );
            return Ok(QueryResult { rows: vec![], row_count: 1 });
        }

        if sql.starts_with("DELETE FROM basics.contracts") {
            let hash = hex::encode(bytea_param(params, 0));
            let creator = text_param(params, 1);
            let matches = self
                .contracts
                .get(&hash)
                .is_some_and(|c| c.creator == creator);
            if matches {
                self.contracts.remove(&hash);
                return Ok(QueryResult { rows: vec![], row_count: 1 });
            }
            return Ok(QueryResult { rows: vec![], row_count: 0 });
        }

        // The counter contract's statements.
        if sql.starts_with("CREATE TABLE test") {
            return Ok(QueryResult::default());
        }
        if sql.starts_with("SELECT called FROM test") {
            let addr = text_param(params, 0);
            let rows = match self.counter_table.get(&addr) {
                Some(called) => vec![row(&[("called", Value::Number(*called as f64))])],
                None => vec![],
            };
            let row_count = rows.len() as u64;
            return Ok(QueryResult { rows, row_count });
        }
        if sql.starts_with("INSERT INTO test") {
            if self.fail_on_insert_test {
                return Err(DbError::Constraint { code: "23505".into() });
            }
            let addr = text_param(params, 0);
            let called = int_param(params, 1);
            self.counter_table.insert(addr, called);
            return Ok(QueryResult { rows: vec![], row_count: 1 });
        }
        if sql.starts_with("SELECT * FROM \"test\"") {
            let addr = text_param(params, 0);
            let rows = match self.counter_table.get(&addr) {
                Some(called) => vec![row(&[
                    ("addr", Value::Str(addr.clone())),
                    ("called", Value::Number(*called as f64)),
                ])],
                None => vec![],
            };
            let row_count = rows.len() as u64;
            return Ok(QueryResult { rows, row_count });
        }

        panic!("mock has no script for statement: {sql}");
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn signer() -> PrivateKey {
    PrivateKey::from_wif(WIF).unwrap()
}

fn context(block_id: u64) -> TxContext {
    TxContext {
        block_id,
        current_block_ts: 20_000 + block_id,
        previous_block_ts: 10_000 + block_id,
        previous_block_hash: [0u8; 32],
    }
}

fn sign_tx(key: &PrivateKey, contract_hash: [u8; 32], payload: &str, valid_till: u64) -> Transaction {
    Transaction::sign(
        &TxData {
            version: 1,
            transaction_id: Transaction::generate_id(),
            contract_hash,
            valid_till,
            payload,
        },
        SIGN_PREFIX,
        key,
    )
    .unwrap()
}

fn processor_with(db: MockDb) -> Processor<MockDb> {
    Processor::new(db, signer().address(), Some(SIGN_PREFIX.to_vec())).unwrap()
}

const COUNTER_INIT: &str = r#"await query("CREATE TABLE test (addr VARCHAR(35) PRIMARY KEY, called BIGINT NOT NULL);", []);"#;

const COUNTER_CODE: &str = r#"let res = await query("SELECT called FROM test WHERE addr = $1;", [from]);
let current = 0;
if (res.rows.length > 0) {
    current = res.rows[0].called;
}
await queryFast("INSERT INTO test (addr, called) VALUES ($1, $2) ON CONFLICT (addr) DO UPDATE SET called = $2;", [from, current + payload.amount]);
return "" + current;"#;

fn create_payload(template: serde_json::Value, init: &str, code: &str) -> String {
    serde_json::json!({
        "type": "counter",
        "version": "1.0",
        "description": "Counts calls per address.",
        "template": template,
        "init": BASE64.encode(init),
        "code": BASE64.encode(code),
        "validanaVersion": 2,
    })
    .to_string()
}

fn counter_template() -> serde_json::Value {
    serde_json::json!({
        "amount": {"type": "uint", "name": "amount", "desc": "How much to count."}
    })
}

/// Create the counter contract and return its hash.
fn install_counter(processor: &mut Processor<MockDb>) -> [u8; 32] {
    let payload = create_payload(counter_template(), COUNTER_INIT, COUNTER_CODE);
    let tx = sign_tx(&signer(), [0u8; 32], &payload, 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(0), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Accepted, "create failed: {:?}", result.message);

    // The hash is over the prolog-prefixed code.
    let source = format!("\"use strict\";\n{COUNTER_CODE}");
    validana::crypto::hash256(source.as_bytes())
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[test]
fn test_create_and_count() {
    let mut processor = processor_with(MockDb::default());
    let hash = install_counter(&mut processor);
    assert!(processor.registry().get(&hash).is_some());

    let mut messages = Vec::new();
    for (i, amount) in [3u64, 2, 0].into_iter().enumerate() {
        let payload = format!(r#"{{"amount":{amount}}}"#);
        let tx = sign_tx(&signer(), hash, &payload, 0);
        let result = processor
            .process_tx(TxSource::Typed(tx), &context(i as u64 + 1), true)
            .unwrap();
        assert_eq!(result.status, TxStatus::Accepted, "call {i}: {:?}", result.message);
        messages.push(result.message.unwrap());
    }
    assert_eq!(messages, ["0", "3", "5"]);
}

#[test]
fn test_template_extra_key_is_invalid() {
    let mut processor = processor_with(MockDb::default());
    // Contract with an empty template.
    let payload = create_payload(serde_json::json!({}), "", r#"return "OK";"#);
    let tx = sign_tx(&signer(), [0u8; 32], &payload, 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(0), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Accepted);
    let hash = validana::crypto::hash256(b"\"use strict\";\nreturn \"OK\";");

    let tx = sign_tx(&signer(), hash, r#"{"extrakey":""}"#, 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(1), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Invalid);
    assert_eq!(result.message.as_deref(), Some("Payload has extra key."));
}

#[test]
fn test_signature_mutation_is_invalid() {
    let mut processor = processor_with(MockDb::default());
    let tx = sign_tx(&signer(), [5u8; 32], "{}", 0);
    let bytes = tx.bytes().to_vec();

    // Flip one byte inside the signature (the 64 bytes before the key).
    let sig_start = bytes.len() - 97;
    for offset in [0usize, 13, 63] {
        let mut mutated = bytes.clone();
        mutated[sig_start + offset] ^= 0x01;
        let result = processor
            .process_tx(TxSource::Bytes(mutated), &context(0), true)
            .unwrap();
        assert_eq!(result.status, TxStatus::Invalid);
        assert_eq!(result.message.as_deref(), Some("Invalid signature."));
    }
}

#[test]
fn test_expired_transaction_is_invalid() {
    let mut processor = processor_with(MockDb::default());
    let tx = sign_tx(&signer(), [5u8; 32], "{}", 1);
    let ctx = TxContext {
        block_id: 1,
        current_block_ts: 12_340_680,
        previous_block_ts: 12_340_678,
        previous_block_hash: [0u8; 32],
    };
    let result = processor.process_tx(TxSource::Typed(tx), &ctx, true).unwrap();
    assert_eq!(result.status, TxStatus::Invalid);
    assert_eq!(result.message.as_deref(), Some("Transaction valid till expired."));
}

#[test]
fn test_forbidden_sql_in_init_is_invalid() {
    let mut processor = processor_with(MockDb::default());
    let payload = create_payload(
        serde_json::json!({}),
        r#"await query("SELECT localtime;", []);"#,
        r#"return "OK";"#,
    );
    let tx = sign_tx(&signer(), [0u8; 32], &payload, 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(0), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Invalid);
    assert_eq!(
        result.message.as_deref(),
        Some("Invalid query: multiple queries, comments or time request.")
    );
}

#[test]
fn test_unknown_contract_is_rejected() {
    let mut processor = processor_with(MockDb::default());
    let tx = sign_tx(&signer(), [5u8; 32], "{}", 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(0), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Rejected);
    assert_eq!(result.message.as_deref(), Some("Contract does not exist."));
}

#[test]
fn test_delete_by_non_creator_is_invalid() {
    let mut processor = processor_with(MockDb::default());
    let hash = install_counter(&mut processor);

    let stranger = PrivateKey::generate();
    let payload = format!(r#"{{"hash":"{}"}}"#, hex::encode(hash));
    let tx = sign_tx(&stranger, [0xFFu8; 32], &payload, 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(1), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Invalid);
    let expected = format!(
        "Not creator of contract or contract: {} does not exist.",
        hex::encode(hash)
    );
    assert_eq!(result.message.as_deref(), Some(expected.as_str()));
    // Still registered.
    assert!(processor.registry().get(&hash).is_some());
}

#[test]
fn test_delete_by_creator_succeeds() {
    let mut processor = processor_with(MockDb::default());
    let hash = install_counter(&mut processor);

    let payload = format!(r#"{{"hash":"{}"}}"#, hex::encode(hash));
    let tx = sign_tx(&signer(), [0xFFu8; 32], &payload, 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(1), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Accepted);
    assert!(processor.registry().get(&hash).is_none());

    // Calling the deleted contract now rejects.
    let tx = sign_tx(&signer(), hash, r#"{"amount":1}"#, 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(2), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Rejected);
}

#[test]
fn test_missing_sign_prefix_means_retry() {
    let db = MockDb::default();
    let mut processor = Processor::new(db, signer().address(), None).unwrap();
    let tx = sign_tx(&signer(), [5u8; 32], "{}", 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(0), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Retry);
}

#[test]
fn test_corruption_requests_shutdown() {
    // Seed the registry directly so no create flow is needed.
    let source = format!("\"use strict\";\n{COUNTER_CODE}");
    let hash = validana::crypto::hash256(source.as_bytes());
    let mut db = MockDb::default();
    db.contracts.insert(
        hex::encode(hash),
        StoredContract {
            contract_type: "counter".into(),
            contract_version: "1.0".into(),
            description: "d".into(),
            creator: signer().address().to_text(),
            template: counter_template(),
            code: source.into_bytes(),
            validana_version: 2,
        },
    );
    let mut processor = processor_with(db);

    // The contract's first statement (the SELECT on the counter table)
    // reports index corruption.
    processor.backend_mut().fail_next = Some(DbError::Corruption("XX001".into()));
    let tx = sign_tx(&signer(), hash, r#"{"amount":1}"#, 0);
    let shutdown = processor
        .process_tx(TxSource::Typed(tx), &context(1), true)
        .unwrap_err();
    assert_eq!(shutdown.code, 51);
}

#[test]
fn test_fast_query_failure_invalidates() {
    let hash;
    let mut processor = {
        let db = MockDb::default();
        let mut p = processor_with(db);
        hash = install_counter(&mut p);
        p
    };
    // The counter's SELECT succeeds, then the fast INSERT hits a
    // constraint violation.
    processor.backend_mut().fail_on_insert_test = true;
    let tx = sign_tx(&signer(), hash, r#"{"amount":1}"#, 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(1), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Invalid);
    assert!(result.message.unwrap().starts_with("Fast query failed"));
}

#[test]
fn test_v1_contract_result_semantics() {
    let seed = |source: &str, hash_byte: u8| -> (MockDb, [u8; 32]) {
        let mut db = MockDb::default();
        let hash = [hash_byte; 32];
        db.contracts.insert(
            hex::encode(hash),
            StoredContract {
                contract_type: "legacy".into(),
                contract_version: "0.9".into(),
                description: "d".into(),
                creator: signer().address().to_text(),
                template: serde_json::json!({}),
                code: source.as_bytes().to_vec(),
                validana_version: 1,
            },
        );
        (db, hash)
    };

    let (db, hash) = seed(r#"return "OK";"#, 0x21);
    let mut processor = processor_with(db);
    let tx = sign_tx(&signer(), hash, "{}", 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(0), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Accepted);

    let (db, hash) = seed(r#"return "insufficient balance";"#, 0x22);
    let mut processor = processor_with(db);
    let tx = sign_tx(&signer(), hash, "{}", 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(0), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::V1Rejected);
    assert_eq!(result.message.as_deref(), Some("insufficient balance"));

    let (db, hash) = seed("return 5;", 0x23);
    let mut processor = processor_with(db);
    let tx = sign_tx(&signer(), hash, "{}", 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(0), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::V1Rejected);
    assert_eq!(result.message.as_deref(), Some("Unknown result type"));
}

#[test]
fn test_v1_legacy_query_surface() {
    let mut db = MockDb::default();
    let hash = [0x31u8; 32];
    let source = r#"let res = await query("SELECT", "test", "WHERE addr = $1", [from], false);
if (res.rowCount == 0) {
    return "no row";
}
return "OK";"#;
    db.contracts.insert(
        hex::encode(hash),
        StoredContract {
            contract_type: "legacy".into(),
            contract_version: "0.9".into(),
            description: "d".into(),
            creator: signer().address().to_text(),
            template: serde_json::json!({}),
            code: source.as_bytes().to_vec(),
            validana_version: 1,
        },
    );
    db.counter_table.insert(signer().address().to_text(), 7);
    let mut processor = processor_with(db);
    let tx = sign_tx(&signer(), hash, "{}", 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(0), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Accepted, "{:?}", result.message);
}

#[test]
fn test_rejecting_contract() {
    let mut db = MockDb::default();
    let hash = [0x41u8; 32];
    db.contracts.insert(
        hex::encode(hash),
        StoredContract {
            contract_type: "guarded".into(),
            contract_version: "1.0".into(),
            description: "d".into(),
            creator: signer().address().to_text(),
            template: serde_json::json!({}),
            code: br#"reject("Not allowed.");"#.to_vec(),
            validana_version: 2,
        },
    );
    let mut processor = processor_with(db);
    let tx = sign_tx(&signer(), hash, "{}", 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(0), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Rejected);
    assert_eq!(result.message.as_deref(), Some("Not allowed."));
}

#[test]
fn test_create_by_non_processor_is_invalid() {
    let stranger = PrivateKey::generate();
    let mut processor = processor_with(MockDb::default());
    let payload = create_payload(serde_json::json!({}), "", r#"return "OK";"#);
    let tx = sign_tx(&stranger, [0u8; 32], &payload, 0);
    let result = processor
        .process_tx(TxSource::Typed(tx), &context(0), true)
        .unwrap();
    // Reserved-contract rejection is promoted to invalid.
    assert_eq!(result.status, TxStatus::Invalid);
    assert_eq!(
        result.message.as_deref(),
        Some("Only the processor can create new contracts.")
    );
}

#[test]
fn test_malformed_bytes_are_invalid() {
    let mut processor = processor_with(MockDb::default());
    let result = processor
        .process_tx(TxSource::Bytes(vec![1, 2, 3]), &context(0), true)
        .unwrap();
    assert_eq!(result.status, TxStatus::Invalid);
}
