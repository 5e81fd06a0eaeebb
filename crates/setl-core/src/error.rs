//! Error taxonomy and the durable error/signal record formats.
//!
//! Error kinds and signal reasons are closed enums rather than open error
//! hierarchies, so every disposition switch in the operators is exhaustive
//! and checked at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The pipeline stage a DLQ or signal entry originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Ingestor,
    Transformer,
    Filter,
    Join,
    Sink,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Component::Ingestor => "ingestor",
            Component::Transformer => "transformer",
            Component::Filter => "filter",
            Component::Join => "join",
            Component::Sink => "sink",
        };
        f.write_str(s)
    }
}

/// Per-record error classification carried on every DLQ entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedEnvelope,
    SchemaNotFound,
    SchemaIncompatible,
    SchemaValidation,
    TransformError,
    FilterError,
    JoinPublishError,
    MappingError,
    SinkInsertFailed,
}

/// Per-pipeline operational conditions consumed by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalReason {
    SchemaNotFound,
    SchemaIncompatible,
    SinkFatal,
    StartupFailed,
    Stopped,
}

/// Durable record of a single failed message, with the original payload so
/// the control plane can inspect or replay it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub pipeline_id: String,
    pub component: Component,
    pub error_kind: ErrorKind,
    pub error_message: String,
    #[serde(with = "serde_bytes_b64")]
    pub original_message: Vec<u8>,
    pub occurred_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn new(
        pipeline_id: impl Into<String>,
        component: Component,
        error_kind: ErrorKind,
        error_message: impl Into<String>,
        original_message: Vec<u8>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            component,
            error_kind,
            error_message: error_message.into(),
            original_message,
            occurred_at: Utc::now(),
        }
    }
}

/// Durable record of a per-pipeline operational event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEntry {
    pub pipeline_id: String,
    pub component: Component,
    pub reason: SignalReason,
    pub text: String,
    pub occurred_at: DateTime<Utc>,
}

impl SignalEntry {
    pub fn new(
        pipeline_id: impl Into<String>,
        component: Component,
        reason: SignalReason,
        text: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            component,
            reason,
            text: text.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Raised when the pipeline definition fails validation before any
/// consumption begins.
#[derive(Debug, thiserror::Error)]
#[error("pipeline startup failed: {0}")]
pub struct StartupError(pub String);

// Original payloads are arbitrary bytes; encode them as base64 text so DLQ
// entries stay valid JSON documents.
mod serde_bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Vec<u8>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_entry_round_trips_through_json() {
        let entry = DlqEntry::new(
            "p1",
            Component::Ingestor,
            ErrorKind::SchemaValidation,
            "field \"id\" is missing",
            br#"{"key":"value"}"#.to_vec(),
        );
        let text = serde_json::to_string(&entry).unwrap();
        assert!(text.contains("\"component\":\"ingestor\""));
        assert!(text.contains("\"error_kind\":\"schema_validation\""));
        let back: DlqEntry = serde_json::from_str(&text).unwrap();
        assert_eq!(back.original_message, entry.original_message);
        assert_eq!(back.error_kind, ErrorKind::SchemaValidation);
    }

    #[test]
    fn signal_reason_uses_snake_case_wire_names() {
        let entry = SignalEntry::new("p1", Component::Sink, SignalReason::SinkFatal, "boom");
        let text = serde_json::to_string(&entry).unwrap();
        assert!(text.contains("\"reason\":\"sink_fatal\""));
    }

}
