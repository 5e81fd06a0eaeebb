//! Schema model shared by every pipeline stage.
//!
//! A source's records are described by a numbered, immutable [`SchemaVersion`]
//! holding an ordered list of typed fields. Versions for one source form a
//! compatibility chain: a new version must carry every field of the previous
//! latest with an identical type, and may only add fields on top.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of field types a schema may declare.
///
/// The unsuffixed `Int`, `Uint` and `Float` variants are aliases for the
/// widest member of their family; they are kept distinct so that the
/// compatibility check can compare declared type strings exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Bytes,
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float,
    Float32,
    Float64,
    Array,
    Map,
}

impl FieldType {
    /// Whether a runtime JSON value is acceptable for this declared type.
    ///
    /// Strings satisfy `string` and `bytes`; any JSON number satisfies the
    /// integer and float variants; objects satisfy `map` and arrays `array`.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String | FieldType::Bytes => value.is_string(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Int
            | FieldType::Int8
            | FieldType::Int16
            | FieldType::Int32
            | FieldType::Int64
            | FieldType::Uint
            | FieldType::Uint8
            | FieldType::Uint16
            | FieldType::Uint32
            | FieldType::Uint64
            | FieldType::Float
            | FieldType::Float32
            | FieldType::Float64 => value.is_number(),
            FieldType::Array => value.is_array(),
            FieldType::Map => value.is_object(),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            FieldType::Int
                | FieldType::Int8
                | FieldType::Int16
                | FieldType::Int32
                | FieldType::Int64
                | FieldType::Uint
                | FieldType::Uint8
                | FieldType::Uint16
                | FieldType::Uint32
                | FieldType::Uint64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, FieldType::Float | FieldType::Float32 | FieldType::Float64)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::String => "string",
            FieldType::Bytes => "bytes",
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::Int8 => "int8",
            FieldType::Int16 => "int16",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Uint => "uint",
            FieldType::Uint8 => "uint8",
            FieldType::Uint16 => "uint16",
            FieldType::Uint32 => "uint32",
            FieldType::Uint64 => "uint64",
            FieldType::Float => "float",
            FieldType::Float32 => "float32",
            FieldType::Float64 => "float64",
            FieldType::Array => "array",
            FieldType::Map => "map",
        };
        f.write_str(s)
    }
}

/// A single named, typed field of a schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self { name: name.into(), field_type }
    }
}

/// Whether the schema for a source is fixed by the pipeline definition or
/// fetched on demand from a remote registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaConfigType {
    Internal,
    External,
}

/// Payload encoding of a source's records. Only JSON is implemented; the
/// variant list is closed so new formats are an explicit change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Json,
}

/// Schema identity and resolution policy for one source of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub pipeline_id: String,
    pub source_id: String,
    pub config_type: SchemaConfigType,
    pub data_format: DataFormat,
}

/// A numbered, immutable set of typed fields describing record shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub pipeline_id: String,
    pub source_id: String,
    pub version_id: u32,
    pub fields: Vec<Field>,
}

impl SchemaVersion {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate a parsed JSON record against this version's fields.
    ///
    /// Every declared field must be present and its runtime JSON type must be
    /// acceptable for the declared type. Unknown fields in the record are
    /// ignored. All violations are collected into one error.
    pub fn validate(&self, record: &Value) -> Result<(), SchemaError> {
        let obj = match record.as_object() {
            Some(obj) => obj,
            None => {
                return Err(SchemaError::Validation {
                    source_id: self.source_id.clone(),
                    version_id: self.version_id,
                    violations: vec!["record is not a JSON object".to_string()],
                })
            }
        };

        let mut violations = Vec::new();
        for field in &self.fields {
            match obj.get(&field.name) {
                None => violations.push(format!("field {:?} is missing", field.name)),
                Some(value) if !field.field_type.accepts(value) => violations.push(format!(
                    "field {:?} has JSON type {} incompatible with declared type {}",
                    field.name,
                    json_type_name(value),
                    field.field_type,
                )),
                Some(_) => {}
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Validation {
                source_id: self.source_id.clone(),
                version_id: self.version_id,
                violations,
            })
        }
    }

    /// Check that `next` is a compatible extension of this version.
    ///
    /// Every field of this version must exist in `next` with the identical
    /// type; fields only present in `next` are allowed. All violations are
    /// aggregated into a single error so the caller can report them at once.
    pub fn check_compatible(&self, next: &SchemaVersion) -> Result<(), SchemaError> {
        let next_fields: HashMap<&str, FieldType> =
            next.fields.iter().map(|f| (f.name.as_str(), f.field_type)).collect();

        let mut violations = Vec::new();
        for field in &self.fields {
            match next_fields.get(field.name.as_str()) {
                None => violations.push(format!(
                    "field {:?} of version {} is missing in version {}",
                    field.name, self.version_id, next.version_id
                )),
                Some(t) if *t != field.field_type => violations.push(format!(
                    "field {:?} changed type from {} to {}",
                    field.name, field.field_type, t
                )),
                Some(_) => {}
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Incompatible {
                source_id: self.source_id.clone(),
                version_id: next.version_id,
                violations,
            })
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Failures of schema resolution, validation and version installation.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema not found for source {source_id:?}{}", fmt_version(.version_id))]
    NotFound { source_id: String, version_id: Option<u32> },

    #[error("schema id {version_id} for source {source_id:?} is incompatible: {}", .violations.join("; "))]
    Incompatible { source_id: String, version_id: u32, violations: Vec<String> },

    #[error("record failed validation against {source_id:?} v{version_id}: {}", .violations.join("; "))]
    Validation { source_id: String, version_id: u32, violations: Vec<String> },

    #[error("malformed wire envelope: {0}")]
    MalformedEnvelope(String),

    #[error("unsupported data format: {0}")]
    UnsupportedFormat(String),

    #[error("schema registry request failed: {0}")]
    Registry(String),
}

fn fmt_version(version_id: &Option<u32>) -> String {
    match version_id {
        Some(v) => format!(" version {v}"),
        None => String::new(),
    }
}

/// Size of the wire envelope prepended to externally-described payloads.
pub const ENVELOPE_LEN: usize = 5;

/// Magic byte expected at offset 0 of the wire envelope.
pub const ENVELOPE_MAGIC: u8 = 0x00;

/// Extract the schema id and body from an externally-described payload.
///
/// The envelope is exactly five bytes: a zero magic byte followed by the
/// big-endian unsigned 32-bit schema id. The body starts at byte 5.
pub fn extract_schema_id(payload: &[u8]) -> Result<(u32, &[u8]), SchemaError> {
    if payload.len() < ENVELOPE_LEN {
        return Err(SchemaError::MalformedEnvelope(format!(
            "payload of {} bytes is shorter than the {} byte envelope",
            payload.len(),
            ENVELOPE_LEN
        )));
    }
    if payload[0] != ENVELOPE_MAGIC {
        return Err(SchemaError::MalformedEnvelope(format!(
            "expected magic byte 0x00, got {:#04x}",
            payload[0]
        )));
    }
    let id = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    Ok((id, &payload[ENVELOPE_LEN..]))
}

/// Prepend the wire envelope for `schema_id` to `body`.
pub fn wrap_schema_id(schema_id: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_LEN + body.len());
    out.push(ENVELOPE_MAGIC);
    out.extend_from_slice(&schema_id.to_be_bytes());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn version(fields: Vec<Field>) -> SchemaVersion {
        SchemaVersion {
            pipeline_id: "p1".into(),
            source_id: "orders".into(),
            version_id: 1,
            fields,
        }
    }

    #[test]
    fn validate_accepts_matching_record() {
        let v = version(vec![
            Field::new("id", FieldType::String),
            Field::new("amount", FieldType::Int64),
            Field::new("tags", FieldType::Array),
        ]);
        let record = json!({"id": "a-1", "amount": 10, "tags": [], "extra": true});
        v.validate(&record).unwrap();
    }

    #[test]
    fn validate_collects_all_violations() {
        let v = version(vec![
            Field::new("id", FieldType::String),
            Field::new("amount", FieldType::Int64),
        ]);
        let record = json!({"amount": "ten"});
        let err = v.validate(&record).unwrap_err();
        match err {
            SchemaError::Validation { violations, .. } => {
                assert_eq!(violations.len(), 2);
                assert!(violations[0].contains("missing"));
                assert!(violations[1].contains("incompatible"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validate_rejects_non_object() {
        let v = version(vec![Field::new("id", FieldType::String)]);
        assert!(v.validate(&json!([1, 2, 3])).is_err());
    }

    #[test]
    fn compatible_extension_is_accepted() {
        let prev = version(vec![Field::new("id", FieldType::String)]);
        let mut next = version(vec![
            Field::new("id", FieldType::String),
            Field::new("email", FieldType::String),
        ]);
        next.version_id = 2;
        prev.check_compatible(&next).unwrap();
    }

    #[test]
    fn removed_and_retyped_fields_are_aggregated() {
        let prev = version(vec![
            Field::new("id", FieldType::String),
            Field::new("amount", FieldType::Int64),
        ]);
        let mut next = version(vec![Field::new("amount", FieldType::Float64)]);
        next.version_id = 2;
        let err = prev.check_compatible(&next).unwrap_err();
        match err {
            SchemaError::Incompatible { violations, .. } => assert_eq!(violations.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn envelope_round_trip() {
        let wrapped = wrap_schema_id(1102, b"{\"a\":1}");
        let (id, body) = extract_schema_id(&wrapped).unwrap();
        assert_eq!(id, 1102);
        assert_eq!(body, b"{\"a\":1}");
    }

    #[test]
    fn envelope_rejects_short_payload() {
        assert!(matches!(
            extract_schema_id(&[0x00, 0x01]),
            Err(SchemaError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn envelope_rejects_bad_magic() {
        assert!(matches!(
            extract_schema_id(&[0x01, 0, 0, 0, 1, b'x']),
            Err(SchemaError::MalformedEnvelope(_))
        ));
    }
}
