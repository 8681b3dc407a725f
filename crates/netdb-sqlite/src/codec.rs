//! Value translation between the engine's JSON field values and SQLite
//! storage classes.
//!
//! Scalars map directly; composite values (route metrics, MPLS label
//! stacks) are stored as their JSON text and revived on read. The codec
//! is scoped to this backend; nothing global is registered.

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::Value;

pub(crate) fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(*flag as i64),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or(0.0)),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        composite => SqlValue::Text(composite.to_string()),
    }
}

pub(crate) fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => Value::from(integer),
        ValueRef::Real(real) => serde_json::Number::from_f64(real)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            // Composite values round-trip through their JSON text.
            if text.starts_with('[') || text.starts_with('{') {
                match serde_json::from_str(&text) {
                    Ok(parsed) => parsed,
                    Err(_) => Value::String(text),
                }
            } else {
                Value::String(text)
            }
        }
        ValueRef::Blob(bytes) => {
            Value::String(bytes.iter().map(|byte| format!("{byte:02x}")).collect())
        }
    }
}
