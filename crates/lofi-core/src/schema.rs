//! Collection schemas: fixed per-collection field descriptors

use crate::document::{DocumentId, DEFAULT_MAX_KEY_LENGTH};
use crate::error::{Error, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    /// RFC 3339 string or integer milliseconds
    DateTime,
    Any,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Any, _) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Integer, v) => v.as_i64().is_some(),
            (FieldType::Number, v) => v.as_f64().is_some(),
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            (FieldType::Array, Value::Array(_)) => true,
            (FieldType::DateTime, Value::String(s)) => looks_like_datetime(s),
            (FieldType::DateTime, v) => v.as_i64().is_some(),
            _ => false,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::DateTime => "date-time",
            FieldType::Any => "any",
        };
        write!(f, "{}", name)
    }
}

/// `YYYY-MM-DDTHH:MM...`
fn looks_like_datetime(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 16
        && b[..4].iter().all(u8::is_ascii_digit)
        && b[4] == b'-'
        && b[5..7].iter().all(u8::is_ascii_digit)
        && b[7] == b'-'
        && b[8..10].iter().all(u8::is_ascii_digit)
        && (b[10] == b'T' || b[10] == b' ')
        && b[11..13].iter().all(u8::is_ascii_digit)
        && b[13] == b':'
}

/// Descriptor of a single field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub encrypted: bool,
    /// Name of the collection this field references by primary key
    #[serde(default)]
    pub reference: Option<String>,
    /// Maximum length for string fields
    #[serde(default)]
    pub max_length: Option<usize>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            encrypted: false,
            reference: None,
            max_length: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::DateTime)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    pub fn references(mut self, collection: impl Into<String>) -> Self {
        self.reference = Some(collection.into());
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }
}

fn default_primary_key() -> String {
    "id".to_string()
}

fn default_max_key_length() -> usize {
    DEFAULT_MAX_KEY_LENGTH
}

/// Schema of a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    /// Accept fields that have no descriptor
    #[serde(default)]
    pub additional_fields: bool,
}

impl CollectionSchema {
    /// New schema with primary key `id` (max 100 bytes)
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            primary_key: default_primary_key(),
            max_key_length: DEFAULT_MAX_KEY_LENGTH,
            fields: Vec::new(),
            additional_fields: false,
        }
    }

    pub fn primary_key(mut self, name: impl Into<String>, max_length: usize) -> Self {
        self.primary_key = name.into();
        self.max_key_length = max_length;
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn allow_additional_fields(mut self) -> Self {
        self.additional_fields = true;
        self
    }

    pub fn descriptor(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields stored encrypted at rest
    pub fn encrypted_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.encrypted)
    }

    pub fn has_encrypted_fields(&self) -> bool {
        self.fields.iter().any(|f| f.encrypted)
    }

    /// Check the schema itself for mistakes
    pub fn check(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("<unnamed>", "collection name cannot be empty"));
        }
        if self.max_key_length == 0 {
            return Err(Error::validation(&self.name, "max_key_length must be positive"));
        }
        if let Some(pk) = self.descriptor(&self.primary_key) {
            if pk.field_type != FieldType::String {
                return Err(Error::validation(&self.name, "primary key must be a string field"));
            }
            if pk.encrypted {
                return Err(Error::validation(&self.name, "primary key cannot be encrypted"));
            }
        }
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::validation(
                    &self.name,
                    format!("duplicate field descriptor '{}'", field.name),
                ));
            }
        }
        Ok(())
    }

    /// Validate a document body and extract its primary key.
    ///
    /// Nothing is mutated on failure.
    pub fn validate(&self, data: &Value) -> Result<DocumentId> {
        let fields = data.as_object().ok_or_else(|| {
            Error::validation(&self.name, format!("document must be an object, got {}", data.type_name()))
        })?;

        let key = fields
            .get(&self.primary_key)
            .ok_or_else(|| {
                Error::validation(&self.name, format!("missing primary key '{}'", self.primary_key))
            })?
            .as_str()
            .ok_or_else(|| {
                Error::validation(&self.name, format!("primary key '{}' must be a string", self.primary_key))
            })?;

        let id = DocumentId::with_max_length(key, self.max_key_length)
            .map_err(|e| Error::validation(&self.name, e.to_string()))?;

        for field in &self.fields {
            match fields.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(Error::validation(
                        &self.name,
                        format!("missing required field '{}'", field.name),
                    ));
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    if !field.field_type.accepts(value) {
                        return Err(Error::validation(
                            &self.name,
                            format!(
                                "field '{}' expects {}, got {}",
                                field.name,
                                field.field_type,
                                value.type_name()
                            ),
                        ));
                    }
                    if let (Some(max), Value::String(s)) = (field.max_length, value) {
                        if s.chars().count() > max {
                            return Err(Error::validation(
                                &self.name,
                                format!("field '{}' exceeds {} characters", field.name, max),
                            ));
                        }
                    }
                }
            }
        }

        if !self.additional_fields {
            if let Some(unknown) = fields
                .keys()
                .find(|k| **k != self.primary_key && self.descriptor(k).is_none())
            {
                return Err(Error::validation(&self.name, format!("unknown field '{}'", unknown)));
            }
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn todo_schema() -> CollectionSchema {
        CollectionSchema::new("todos")
            .field(FieldDescriptor::string("id").required().max_length(100))
            .field(FieldDescriptor::string("name").required())
            .field(FieldDescriptor::boolean("done").required())
            .field(FieldDescriptor::datetime("timestamp"))
    }

    #[test]
    fn test_valid_document() {
        let schema = todo_schema();
        let data = Value::from(json!({"id": "1", "name": "milk", "done": false, "timestamp": 1700000000000i64}));
        assert_eq!(schema.validate(&data).unwrap().as_str(), "1");

        let data = Value::from(json!({"id": "2", "name": "eggs", "done": true, "timestamp": "2024-01-02T10:00:00Z"}));
        assert!(schema.validate(&data).is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let err = todo_schema()
            .validate(&Value::from(json!({"id": "1", "done": false})))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_wrong_type_and_unknown_field() {
        let schema = todo_schema();
        assert!(schema
            .validate(&Value::from(json!({"id": "1", "name": 3, "done": false})))
            .is_err());
        assert!(schema
            .validate(&Value::from(json!({"id": "1", "name": "a", "done": false, "extra": 1})))
            .is_err());
        assert!(schema
            .validate(&Value::from(json!({"id": "1", "name": "a", "done": false, "timestamp": "yesterday"})))
            .is_err());
    }

    #[test]
    fn test_oversized_key() {
        let schema = CollectionSchema::new("short").primary_key("id", 4);
        assert!(schema.validate(&Value::from(json!({"id": "abcd"}))).is_ok());
        assert!(schema.validate(&Value::from(json!({"id": "abcde"}))).is_err());
    }

    #[test]
    fn test_schema_check() {
        let bad = CollectionSchema::new("x").field(FieldDescriptor::integer("id"));
        assert!(bad.check().is_err());
        let dup = CollectionSchema::new("x")
            .field(FieldDescriptor::string("a"))
            .field(FieldDescriptor::string("a"));
        assert!(dup.check().is_err());
        assert!(todo_schema().check().is_ok());
    }

    #[test]
    fn test_schema_from_json() {
        let schema: CollectionSchema = serde_json::from_value(json!({
            "name": "list",
            "fields": [
                {"name": "description", "type": "string", "encrypted": true},
                {"name": "list_id", "type": "string", "required": true, "reference": "todos"}
            ]
        }))
        .unwrap();
        assert_eq!(schema.primary_key, "id");
        assert!(schema.has_encrypted_fields());
        assert_eq!(schema.descriptor("list_id").unwrap().reference.as_deref(), Some("todos"));
    }
}
