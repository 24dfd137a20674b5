//! Measurement topics and their Avro schemas.
//!
//! A topic pairs a name with a key schema and a value schema. Every value
//! schema must be a record declaring numeric `time` and `timeReceived`
//! fields: `time` is when the sensor took the measurement, `timeReceived`
//! when the host received it (both seconds since the epoch). Retention
//! pruning relies on `timeReceived`.

use crate::error::{ClientError, Result};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Field names every value schema must declare.
pub const REQUIRED_TIME_FIELDS: [&str; 2] = ["time", "timeReceived"];

const NUMERIC_TYPES: [&str; 4] = ["int", "long", "float", "double"];

/// A parsed Avro schema.
///
/// Keeps the compact JSON text, which is what gets registered and inlined,
/// next to the parsed tree used for encoding.
#[derive(Debug, Clone)]
pub struct Schema {
    text: String,
    root: Value,
}

impl Schema {
    /// Parse a schema from its JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text)
            .map_err(|e| ClientError::InvalidSchema(format!("not JSON: {}", e)))?;
        Self::from_value(root)
    }

    /// Build a schema from an already parsed JSON tree.
    pub fn from_value(root: Value) -> Result<Self> {
        match &root {
            Value::String(_) | Value::Array(_) => {}
            Value::Object(map) if map.contains_key("type") => {}
            other => {
                return Err(ClientError::InvalidSchema(format!(
                    "expected a type name, union or object with \"type\", got {}",
                    other
                )))
            }
        }
        let text = serde_json::to_string(&root)?;
        Ok(Self { text, root })
    }

    /// Compact JSON text of the schema.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn json(&self) -> &Value {
        &self.root
    }

    /// Record name, for record, enum and fixed schemas.
    pub fn name(&self) -> Option<&str> {
        self.root.get("name").and_then(Value::as_str)
    }

    pub fn is_record(&self) -> bool {
        self.root.get("type").and_then(Value::as_str) == Some("record")
    }

    /// Field definitions of a record schema.
    pub fn fields(&self) -> &[Value] {
        self.root
            .get("fields")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether the record declares `name` with a numeric type, directly or
    /// as one branch of a union.
    pub fn has_numeric_field(&self, name: &str) -> bool {
        self.fields()
            .iter()
            .filter(|field| field.get("name").and_then(Value::as_str) == Some(name))
            .filter_map(|field| field.get("type"))
            .any(is_numeric_type)
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Schema {}

fn is_numeric_type(schema: &Value) -> bool {
    match schema {
        Value::String(name) => NUMERIC_TYPES.contains(&name.as_str()),
        Value::Object(map) => map.get("type").is_some_and(is_numeric_type),
        Value::Array(branches) => branches.iter().any(is_numeric_type),
        _ => false,
    }
}

/// An immutable measurement topic. Cheap to clone.
///
/// Two topics are equal when their names are equal.
#[derive(Clone)]
pub struct Topic {
    inner: Arc<TopicInner>,
}

struct TopicInner {
    name: String,
    key_schema: Schema,
    value_schema: Schema,
}

impl Topic {
    /// Create a topic, validating both schemas.
    ///
    /// # Errors
    ///
    /// `ClientError::InvalidTopic` when the name is empty, the key schema is
    /// not a record, or the value schema lacks numeric `time` and
    /// `timeReceived` fields.
    pub fn new(name: impl Into<String>, key_schema: Schema, value_schema: Schema) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(ClientError::InvalidTopic(
                name,
                "name must be non-empty and must not contain '/'".to_string(),
            ));
        }
        if !key_schema.is_record() {
            return Err(ClientError::InvalidTopic(
                name,
                "key schema must be a record".to_string(),
            ));
        }
        if !value_schema.is_record() {
            return Err(ClientError::InvalidTopic(
                name,
                "value schema must be a record".to_string(),
            ));
        }
        for field in REQUIRED_TIME_FIELDS {
            if !value_schema.has_numeric_field(field) {
                return Err(ClientError::InvalidTopic(
                    name,
                    format!("value schema must declare a numeric '{}' field", field),
                ));
            }
        }

        Ok(Self {
            inner: Arc::new(TopicInner {
                name,
                key_schema,
                value_schema,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn key_schema(&self) -> &Schema {
        &self.inner.key_schema
    }

    pub fn value_schema(&self) -> &Schema {
        &self.inner.value_schema
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.inner.name == other.inner.name
    }
}

impl Eq for Topic {}

impl Hash for Topic {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.name.hash(state);
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic").field("name", &self.inner.name).finish()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}
