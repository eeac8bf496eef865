//! Payload templates: typed validation of decoded transaction payloads.
//!
//! A template maps field names to `{type, name, desc}` descriptors. The
//! `type` tag is one of the base tags below, optionally suffixed with
//! `Array` (an array of the base type) or, for version-2 contracts, `?`
//! (the field may be absent). Version-1 contracts know neither `?` nor the
//! stricter `json`/`id` rules; unknown tags fall back to the string check.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::crypto::keys::is_valid_address;
use crate::crypto::MAX_SAFE_INTEGER;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateField {
    #[serde(rename = "type")]
    pub field_type: String,
    pub name: String,
    pub desc: String,
}

impl TemplateField {
    pub fn new(field_type: &str, name: &str, desc: &str) -> Self {
        Self {
            field_type: field_type.to_string(),
            name: name.to_string(),
            desc: desc.to_string(),
        }
    }
}

/// Field name → descriptor. BTreeMap keeps check order deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template(pub BTreeMap<String, TemplateField>);

impl Template {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: &[(&str, &str, &str, &str)]) -> Self {
        Self(
            fields
                .iter()
                .map(|(key, ty, name, desc)| {
                    (key.to_string(), TemplateField::new(ty, name, desc))
                })
                .collect(),
        )
    }
}

/// Check a decoded payload against a template. `None` means the payload
/// passes; `Some(reason)` carries the first failure.
pub fn check_payload(
    payload: &Value,
    template: &Template,
    validana_version: u8,
) -> Option<String> {
    let Value::Object(fields) = payload else {
        return Some("Payload is invalid json.".to_string());
    };
    for key in fields.keys() {
        if !template.0.contains_key(key) {
            return Some("Payload has extra key.".to_string());
        }
    }
    for (key, descriptor) in &template.0 {
        if let Some(reason) =
            check_type(fields.get(key), &descriptor.field_type, validana_version)
        {
            return Some(reason);
        }
    }
    None
}

fn check_type(value: Option<&Value>, type_tag: &str, validana_version: u8) -> Option<String> {
    if validana_version != 1 {
        if let Some(base) = type_tag.strip_suffix('?') {
            return match value {
                None => None,
                Some(v) => check_required(v, base, validana_version),
            };
        }
    }
    match value {
        None => Some(format!("Invalid {type_tag}.")),
        Some(v) => check_required(v, type_tag, validana_version),
    }
}

fn check_required(value: &Value, type_tag: &str, validana_version: u8) -> Option<String> {
    if let Some(base) = type_tag.strip_suffix("Array") {
        let Value::Array(items) = value else {
            return Some(format!("Invalid {type_tag}."));
        };
        for item in items {
            if !check_base(item, base, validana_version) {
                return Some(format!("Invalid {base} in array."));
            }
        }
        return None;
    }
    if check_base(value, type_tag, validana_version) {
        None
    } else {
        Some(format!("Invalid {type_tag}."))
    }
}

fn is_hex(text: &str) -> bool {
    text.len() % 2 == 0 && text.chars().all(|c| c.is_ascii_hexdigit())
}

fn check_base(value: &Value, tag: &str, validana_version: u8) -> bool {
    match tag {
        "bool" => value.is_boolean(),
        "int" => match value.as_i64() {
            Some(n) => n.unsigned_abs() <= MAX_SAFE_INTEGER,
            None => false,
        },
        "uint" => matches!(value.as_u64(), Some(n) if n <= MAX_SAFE_INTEGER),
        // JSON numbers are finite by construction.
        "float" => value.is_number(),
        "addr" => value.as_str().is_some_and(is_valid_address),
        "hex" => value.as_str().is_some_and(is_hex),
        "hash" => value.as_str().is_some_and(|s| s.len() == 64 && is_hex(s)),
        "base64" => value.as_str().is_some_and(|s| BASE64.decode(s).is_ok()),
        "json" => {
            if validana_version == 1 {
                value
                    .as_str()
                    .is_some_and(|s| serde_json::from_str::<Value>(s).is_ok())
            } else {
                true
            }
        }
        "id" => {
            if validana_version == 1 {
                value.is_string()
            } else {
                value.as_str().is_some_and(|s| s.len() == 32 && is_hex(s))
            }
        }
        // Unknown tags (including v1 seeing a `?` suffix) behave as `str`.
        _ => value.is_string(),
    }
}
