//! Windowed deduplication backed by the bus key-value facility.
//!
//! The key is a stable 64-bit hash of the configured id field in its typed
//! representation, so `"1"` as a string and `1` as an integer never collide.
//! First-writer-wins: the conditional insert is atomic in the store, which
//! also enforces the window TTL, so the check is correct across partitions
//! and across worker replicas.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use setl_core::bus::{subjects, BusError, MessageBus};
use setl_core::definition::DeduplicationConfig;
use setl_core::schema::FieldType;

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("dedup field {0:?} is missing from the record")]
    MissingField(String),

    #[error("dedup field {field:?} value {value} cannot be read as {expected}")]
    Coercion { field: String, value: String, expected: FieldType },
}

pub struct DedupStore {
    bus: Arc<dyn MessageBus>,
    bucket: String,
    config: DeduplicationConfig,
}

impl DedupStore {
    pub fn new(pipeline_id: &str, bus: Arc<dyn MessageBus>, config: DeduplicationConfig) -> Self {
        Self { bus, bucket: subjects::dedup_bucket(pipeline_id), config }
    }

    pub fn window(&self) -> Duration {
        self.config.time_window
    }

    /// Derive the dedup key for `record`.
    pub fn key_for(&self, record: &serde_json::Map<String, Value>) -> Result<String, DedupError> {
        let value = record
            .get(&self.config.id_field)
            .ok_or_else(|| DedupError::MissingField(self.config.id_field.clone()))?;
        let canonical = coerce(value, self.config.id_field_type).ok_or_else(|| {
            DedupError::Coercion {
                field: self.config.id_field.clone(),
                value: value.to_string(),
                expected: self.config.id_field_type,
            }
        })?;
        Ok(format!("{:016x}", fnv1a64(canonical.as_bytes())))
    }

    /// Atomically claim `key_hash` for this window. Returns `true` when this
    /// record is the first within the window and must be published, `false`
    /// when it is a repeat and must be silently dropped.
    pub async fn insert_first(&self, topic_id: &str, key_hash: &str) -> Result<bool, BusError> {
        let key = format!("{topic_id}.{key_hash}");
        let first_seen = Utc::now().to_rfc3339();
        self.bus
            .kv_put_if_absent(&self.bucket, &key, first_seen.into_bytes(), self.config.time_window)
            .await
    }
}

/// Canonical, type-tagged text form of the id value after coercion to the
/// configured type. `None` means the value cannot be coerced.
fn coerce(value: &Value, field_type: FieldType) -> Option<String> {
    match field_type {
        FieldType::String | FieldType::Bytes => {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some(format!("s:{text}"))
        }
        t if t.is_integer() => {
            let number = match value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_u64().map(|u| u as i64))?,
                Value::String(s) => s.trim().parse().ok()?,
                _ => return None,
            };
            Some(format!("i:{number}"))
        }
        t if t.is_float() => {
            let number = match value {
                Value::Number(n) => n.as_f64()?,
                Value::String(s) => s.trim().parse().ok()?,
                _ => return None,
            };
            Some(format!("f:{number}"))
        }
        FieldType::Bool => {
            let flag = match value {
                Value::Bool(b) => *b,
                Value::String(s) => match s.as_str() {
                    "true" => true,
                    "false" => false,
                    _ => return None,
                },
                _ => return None,
            };
            Some(format!("b:{flag}"))
        }
        // Composite id fields hash their canonical JSON text.
        _ => Some(format!("j:{value}")),
    }
}

/// FNV-1a, 64-bit. Deterministic across processes, unlike the std hasher.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x00000100000001b3;
    let mut hash = OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
