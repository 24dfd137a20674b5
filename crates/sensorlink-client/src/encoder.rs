//! Record encoders for the REST proxy.
//!
//! The proxy expects Avro's JSON encoding, which differs from plain JSON in
//! two ways: every record field is present, in schema order, and a non-null
//! value of a union is wrapped in an object naming its branch:
//!
//! ```text
//! schema: {"name": "battery", "type": ["null", "float"]}
//! plain:  {"battery": 0.5}
//! avro:   {"battery": {"float": 0.5}}
//! ```

use crate::error::{ClientError, Result};
use crate::topic::Schema;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Turns a key or value into the JSON text sent for it.
pub trait RecordEncoder: Send + Sync {
    fn encode(&self, schema: &Schema, datum: &Value) -> Result<String>;
}

/// Avro JSON encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvroJsonEncoder;

impl RecordEncoder for AvroJsonEncoder {
    fn encode(&self, schema: &Schema, datum: &Value) -> Result<String> {
        let mut named = NamedTypes::default();
        collect_named(schema.json(), None, &mut named);
        let encoded = encode_value(schema.json(), datum, &named, "")?;
        Ok(serde_json::to_string(&encoded)?)
    }
}

/// Named types of one schema, by short and full name.
#[derive(Default)]
struct NamedTypes<'a> {
    by_name: HashMap<String, &'a Value>,
    full_names: Vec<(&'a Value, String)>,
}

impl<'a> NamedTypes<'a> {
    fn get(&self, name: &str) -> Option<&'a Value> {
        self.by_name.get(name).copied()
    }

    /// Full name of a named type definition found in this schema.
    fn full_name_of(&self, definition: &Value) -> Option<&str> {
        self.full_names
            .iter()
            .find(|(schema, _)| std::ptr::eq(*schema, definition))
            .map(|(_, name)| name.as_str())
    }
}

/// Register every named type, so later references by name resolve.
fn collect_named<'a>(schema: &'a Value, namespace: Option<&str>, named: &mut NamedTypes<'a>) {
    match schema {
        Value::Array(branches) => {
            for branch in branches {
                collect_named(branch, namespace, named);
            }
        }
        Value::Object(map) => {
            let type_name = map.get("type").and_then(Value::as_str).unwrap_or_default();
            let own_namespace = map
                .get("namespace")
                .and_then(Value::as_str)
                .or(namespace);
            if matches!(type_name, "record" | "enum" | "fixed") {
                if let Some(name) = map.get("name").and_then(Value::as_str) {
                    let full = full_name(name, own_namespace);
                    named.by_name.insert(name.to_string(), schema);
                    named.by_name.insert(full.clone(), schema);
                    named.full_names.push((schema, full));
                }
            }
            if let Some(fields) = map.get("fields").and_then(Value::as_array) {
                for field in fields {
                    if let Some(field_type) = field.get("type") {
                        collect_named(field_type, own_namespace, named);
                    }
                }
            }
            for nested in ["items", "values"] {
                if let Some(inner) = map.get(nested) {
                    collect_named(inner, own_namespace, named);
                }
            }
            if let Some(inner @ (Value::Object(_) | Value::Array(_))) = map.get("type") {
                collect_named(inner, own_namespace, named);
            }
        }
        _ => {}
    }
}

fn full_name(name: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() && !name.contains('.') => format!("{}.{}", ns, name),
        _ => name.to_string(),
    }
}

fn mismatch(path: &str, expected: &str, datum: &Value) -> ClientError {
    let at = if path.is_empty() { "<root>" } else { path };
    ClientError::SerializationError(format!("{}: expected {}, got {}", at, expected, datum))
}

fn encode_value(schema: &Value, datum: &Value, named: &NamedTypes<'_>, path: &str) -> Result<Value> {
    match schema {
        Value::String(type_name) => encode_named(type_name, datum, named, path),
        Value::Array(branches) => encode_union(branches, datum, named, path),
        Value::Object(map) => match map.get("type") {
            Some(Value::String(type_name)) => match type_name.as_str() {
                "record" => encode_record(map, datum, named, path),
                "enum" => {
                    let symbol = datum.as_str().ok_or_else(|| mismatch(path, "enum symbol", datum))?;
                    let known = map
                        .get("symbols")
                        .and_then(Value::as_array)
                        .is_some_and(|symbols| symbols.iter().any(|s| s.as_str() == Some(symbol)));
                    if !known {
                        return Err(mismatch(path, "known enum symbol", datum));
                    }
                    Ok(datum.clone())
                }
                "array" => {
                    let items = map.get("items").ok_or_else(|| mismatch(path, "array items", datum))?;
                    let values = datum.as_array().ok_or_else(|| mismatch(path, "array", datum))?;
                    values
                        .iter()
                        .enumerate()
                        .map(|(i, v)| encode_value(items, v, named, &format!("{}[{}]", path, i)))
                        .collect::<Result<Vec<_>>>()
                        .map(Value::Array)
                }
                "map" => {
                    let values = map.get("values").ok_or_else(|| mismatch(path, "map values", datum))?;
                    let entries = datum.as_object().ok_or_else(|| mismatch(path, "map", datum))?;
                    let mut out = Map::new();
                    for (k, v) in entries {
                        out.insert(k.clone(), encode_value(values, v, named, &format!("{}.{}", path, k))?);
                    }
                    Ok(Value::Object(out))
                }
                "fixed" => match datum {
                    Value::String(_) => Ok(datum.clone()),
                    _ => Err(mismatch(path, "fixed", datum)),
                },
                // Primitive with attributes, e.g. a logical type
                other => encode_named(other, datum, named, path),
            },
            Some(inner) => encode_value(inner, datum, named, path),
            None => Err(mismatch(path, "schema with a type", datum)),
        },
        _ => Err(mismatch(path, "valid schema", datum)),
    }
}

fn encode_named(type_name: &str, datum: &Value, named: &NamedTypes<'_>, path: &str) -> Result<Value> {
    let ok = match type_name {
        "null" => datum.is_null(),
        "boolean" => datum.is_boolean(),
        "int" | "long" => datum.is_i64() || datum.is_u64(),
        "float" | "double" => datum.is_number(),
        "string" | "bytes" => datum.is_string(),
        other => {
            return match named.get(other) {
                Some(schema) => encode_value(schema, datum, named, path),
                None => Err(ClientError::SerializationError(format!(
                    "{}: unknown type '{}'",
                    path, other
                ))),
            }
        }
    };
    if ok {
        Ok(datum.clone())
    } else {
        Err(mismatch(path, type_name, datum))
    }
}

fn encode_record(
    schema: &Map<String, Value>,
    datum: &Value,
    named: &NamedTypes<'_>,
    path: &str,
) -> Result<Value> {
    let object = datum.as_object().ok_or_else(|| mismatch(path, "record", datum))?;
    let fields = schema.get("fields").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);

    let mut out = Map::new();
    for field in fields {
        let name = field.get("name").and_then(Value::as_str).unwrap_or_default();
        let field_type = field.get("type").unwrap_or(&Value::Null);
        let field_path = if path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", path, name)
        };

        let encoded = match (object.get(name), field.get("default")) {
            (Some(value), _) => encode_value(field_type, value, named, &field_path)?,
            (None, Some(default)) => encode_default(field_type, default, named, &field_path)?,
            (None, None) => {
                return Err(ClientError::SerializationError(format!(
                    "{}: missing field without default",
                    field_path
                )))
            }
        };
        out.insert(name.to_string(), encoded);
    }
    Ok(Value::Object(out))
}

/// A field default is written for its union's first branch.
fn encode_default(schema: &Value, default: &Value, named: &NamedTypes<'_>, path: &str) -> Result<Value> {
    match schema {
        Value::Array(branches) => match branches.first() {
            Some(first) => {
                let encoded = encode_value(first, default, named, path)?;
                Ok(wrap_branch(first, encoded, named))
            }
            None => Err(mismatch(path, "non-empty union", default)),
        },
        _ => encode_value(schema, default, named, path),
    }
}

fn encode_union(branches: &[Value], datum: &Value, named: &NamedTypes<'_>, path: &str) -> Result<Value> {
    for branch in branches {
        if let Ok(encoded) = encode_value(branch, datum, named, path) {
            return Ok(wrap_branch(branch, encoded, named));
        }
    }
    Err(mismatch(path, "one of the union branches", datum))
}

fn wrap_branch(branch: &Value, encoded: Value, named: &NamedTypes<'_>) -> Value {
    match branch_name(branch, named) {
        Some(name) if name != "null" => {
            let mut wrapper = Map::new();
            wrapper.insert(name, encoded);
            Value::Object(wrapper)
        }
        _ => encoded,
    }
}

fn branch_name(branch: &Value, named: &NamedTypes<'_>) -> Option<String> {
    match branch {
        Value::String(name) => match named.get(name).and_then(|d| named.full_name_of(d)) {
            Some(full) => Some(full.to_string()),
            None => Some(name.clone()),
        },
        Value::Object(map) => {
            let type_name = map.get("type")?.as_str()?;
            match type_name {
                "record" | "enum" | "fixed" => match named.full_name_of(branch) {
                    Some(full) => Some(full.to_string()),
                    None => {
                        let name = map.get("name")?.as_str()?;
                        Some(full_name(name, map.get("namespace").and_then(Value::as_str)))
                    }
                },
                other => Some(other.to_string()),
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(schema: &str, datum: Value) -> Result<String> {
        AvroJsonEncoder.encode(&Schema::parse(schema).unwrap(), &datum)
    }

    #[test]
    fn test_fields_follow_schema_order() {
        let encoded = encode(
            crate::topic::tests::VALUE_SCHEMA,
            json!({"z": 3.0, "y": 2.0, "x": 1.0, "timeReceived": 11.0, "time": 10.0}),
        )
        .unwrap();
        assert_eq!(
            encoded,
            r#"{"time":10.0,"timeReceived":11.0,"x":1.0,"y":2.0,"z":3.0}"#
        );
    }

    #[test]
    fn test_nullable_union_is_wrapped() {
        let schema = r#"{"type": "record", "name": "Battery", "fields": [
            {"name": "level", "type": ["null", "float"]},
            {"name": "status", "type": ["null", "string"]}
        ]}"#;
        let encoded = encode(schema, json!({"level": 0.5, "status": null})).unwrap();
        assert_eq!(encoded, r#"{"level":{"float":0.5},"status":null}"#);
    }

    #[test]
    fn test_missing_field_uses_default() {
        let schema = r#"{"type": "record", "name": "K", "namespace": "org.sensorlink", "fields": [
            {"name": "userId", "type": "string"},
            {"name": "projectId", "type": ["null", "string"], "default": null},
            {"name": "state", "type": {"type": "enum", "name": "State", "symbols": ["ON", "OFF"]}, "default": "ON"}
        ]}"#;
        let encoded = encode(schema, json!({"userId": "u"})).unwrap();
        assert_eq!(encoded, r#"{"userId":"u","projectId":null,"state":"ON"}"#);

        assert!(encode(schema, json!({})).is_err());
    }

    #[test]
    fn test_named_record_branch_uses_full_name() {
        let schema = r#"{"type": "record", "name": "Outer", "namespace": "org.sensorlink", "fields": [
            {"name": "inner", "type": ["null", {"type": "record", "name": "Inner", "fields": [
                {"name": "v", "type": "int"}
            ]}]},
            {"name": "again", "type": "Inner"}
        ]}"#;
        let encoded = encode(schema, json!({"inner": {"v": 1}, "again": {"v": 2}})).unwrap();
        assert_eq!(encoded, r#"{"inner":{"org.sensorlink.Inner":{"v":1}},"again":{"v":2}}"#);
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let err = encode(
            crate::topic::tests::VALUE_SCHEMA,
            json!({"time": "now", "timeReceived": 1.0, "x": 0, "y": 0, "z": 0}),
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::SerializationError(ref msg) if msg.contains("time")));
    }
}
