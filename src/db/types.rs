//! Row and parameter conversion between the driver and guest values.
//!
//! Only types with an exact deterministic guest representation are allowed
//! through: integers must fit the 53-bit safe range and binary columns
//! surface as lowercase hex (guests have no binary type).

use super::{DbError, SqlParam};
use crate::crypto::MAX_SAFE_INTEGER;
use crate::vm::Value;
use postgres::types::ToSql;
use postgres::Row;
use std::collections::BTreeMap;

static NULL_PARAM: Option<String> = None;

pub fn param_as_dyn(param: &SqlParam) -> &(dyn ToSql + Sync) {
    match param {
        SqlParam::Null => &NULL_PARAM,
        SqlParam::Bool(b) => b,
        SqlParam::Int(i) => i,
        SqlParam::Float(f) => f,
        SqlParam::Text(s) => s,
        SqlParam::Bytea(b) => b,
        SqlParam::Json(j) => j,
    }
}

/// Build a parameter from a guest value. Arrays and objects travel as
/// JSON; functions and promises cannot be bound.
pub fn param_from_value(value: &Value) -> Result<SqlParam, DbError> {
    match value {
        Value::Undefined | Value::Null => Ok(SqlParam::Null),
        Value::Bool(b) => Ok(SqlParam::Bool(*b)),
        Value::Number(n) => {
            if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER as f64 {
                Ok(SqlParam::Int(*n as i64))
            } else {
                Ok(SqlParam::Float(*n))
            }
        }
        Value::Str(s) => Ok(SqlParam::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => Ok(SqlParam::Json(value.to_json())),
        Value::Function(_) | Value::Promise(_) => {
            Err(DbError::BadParam(value.type_name().to_string()))
        }
    }
}

fn safe_int(n: i64) -> Result<Value, DbError> {
    if n.unsigned_abs() > MAX_SAFE_INTEGER {
        return Err(DbError::Decode(format!("integer {n} exceeds safe range")));
    }
    Ok(Value::Number(n as f64))
}

/// Convert one row into a name → value map.
pub fn row_to_values(row: &Row) -> Result<BTreeMap<String, Value>, DbError> {
    let mut out = BTreeMap::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = column_value(row, i, column.type_().name())?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn column_value(row: &Row, i: usize, type_name: &str) -> Result<Value, DbError> {
    let decode = |e: postgres::Error| DbError::Decode(e.to_string());
    macro_rules! get {
        ($t:ty) => {
            row.try_get::<usize, Option<$t>>(i).map_err(decode)?
        };
    }
    let value = match type_name {
        "bool" => get!(bool).map(Value::Bool),
        "int2" => match get!(i16) {
            Some(n) => Some(Value::Number(n as f64)),
            None => None,
        },
        "int4" => match get!(i32) {
            Some(n) => Some(Value::Number(n as f64)),
            None => None,
        },
        "int8" => match get!(i64) {
            Some(n) => Some(safe_int(n)?),
            None => None,
        },
        "float4" => get!(f32).map(|n| Value::Number(n as f64)),
        "float8" => get!(f64).map(Value::Number),
        "text" | "varchar" | "bpchar" | "name" => get!(String).map(Value::Str),
        "bytea" => get!(Vec<u8>).map(|b| Value::Str(hex::encode(b))),
        "json" | "jsonb" => get!(serde_json::Value).map(|j| Value::from_json(&j)),
        "_bool" => get!(Vec<bool>).map(|v| Value::Array(v.into_iter().map(Value::Bool).collect())),
        "_int2" => match get!(Vec<i16>) {
            Some(v) => Some(Value::Array(
                v.into_iter().map(|n| Value::Number(n as f64)).collect(),
            )),
            None => None,
        },
        "_int4" => match get!(Vec<i32>) {
            Some(v) => Some(Value::Array(
                v.into_iter().map(|n| Value::Number(n as f64)).collect(),
            )),
            None => None,
        },
        "_int8" => match get!(Vec<i64>) {
            Some(v) => {
                let items = v.into_iter().map(safe_int).collect::<Result<Vec<_>, _>>()?;
                Some(Value::Array(items))
            }
            None => None,
        },
        "_float8" => get!(Vec<f64>)
            .map(|v| Value::Array(v.into_iter().map(Value::Number).collect())),
        "_text" | "_varchar" => get!(Vec<String>)
            .map(|v| Value::Array(v.into_iter().map(Value::Str).collect())),
        "_bytea" => get!(Vec<Vec<u8>>).map(|v| {
            Value::Array(v.into_iter().map(|b| Value::Str(hex::encode(b))).collect())
        }),
        other => {
            return Err(DbError::Decode(format!("unsupported column type {other}")));
        }
    };
    Ok(value.unwrap_or(Value::Null))
}
