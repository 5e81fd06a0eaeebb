//! Durable message bus capability.
//!
//! Components never hold in-memory references to one another; every hop in a
//! pipeline is a durable subject on the bus. The bus also provides the
//! key-value facility backing the deduplication window (TTL enforced by the
//! store, with an atomic conditional insert).
//!
//! Concrete drivers implement [`MessageBus`]; the runtime only depends on
//! this trait.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Headers attached to every message published on a pipeline subject.
///
/// The serde renames are the wire names used by bus drivers that carry
/// headers as string maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    /// Resolved schema version of the payload.
    #[serde(rename = "schema-version-id", skip_serializing_if = "Option::is_none")]
    pub schema_version_id: Option<u32>,

    /// Deduplication key the ingestor derived from the configured id field.
    #[serde(rename = "dedup-key", skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,

    /// Originating Kafka coordinates, for observability only.
    #[serde(rename = "kafka-msg-id", skip_serializing_if = "Option::is_none")]
    pub kafka_msg_id: Option<String>,
}

impl Headers {
    pub fn with_version(version_id: u32) -> Self {
        Self { schema_version_id: Some(version_id), ..Default::default() }
    }
}

/// One message handed to a subscriber. The delivery stays pending (and will
/// be redelivered) until it is acked through the owning [`Subscription`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
    /// Per-subscription delivery tag, passed back to [`Subscription::ack`].
    pub delivery_id: u64,
    pub redelivered: bool,
}

/// Failures of the bus itself. Per-record problems never surface here; they
/// go to the DLQ instead.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("message bus unavailable: {0}")]
    Unavailable(String),

    #[error("subject {0:?} is closed")]
    Closed(String),
}

/// Pull-based consumer of one subject. `next` resolves when a message is
/// available and must be cancel-safe; unacked deliveries are redelivered
/// after the driver's ack deadline.
#[async_trait]
pub trait Subscription: Send {
    async fn next(&mut self) -> Result<Option<Delivery>, BusError>;
    async fn ack(&mut self, delivery_id: u64) -> Result<(), BusError>;
}

/// Capability set required of a message bus driver.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;

    /// Create (or resume) a durable subscription on `subject`. Two
    /// subscriptions with the same durable name share one cursor.
    async fn subscribe(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> Result<Box<dyn Subscription>, BusError>;

    /// Atomically insert `key` if absent; returns `true` on insert, `false`
    /// when a live entry already exists. The store expires the entry after
    /// `ttl`.
    async fn kv_put_if_absent(
        &self,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, BusError>;

    async fn kv_get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, BusError>;
}

/// Subject naming for the well-known channels of one pipeline.
pub mod subjects {
    /// Ingestor output for one source.
    pub fn ingress(pipeline_id: &str, source_id: &str) -> String {
        format!("{pipeline_id}.ingress.{source_id}")
    }

    /// Transformer output.
    pub fn transform_out(pipeline_id: &str) -> String {
        format!("{pipeline_id}.transform.out")
    }

    /// Filter output.
    pub fn filter_out(pipeline_id: &str) -> String {
        format!("{pipeline_id}.filter.out")
    }

    /// Join output, consumed by the sink when a join is configured.
    pub fn join_out(pipeline_id: &str) -> String {
        format!("{pipeline_id}.join.out")
    }

    /// Dead-letter queue, consumed by the control plane.
    pub fn dlq(pipeline_id: &str) -> String {
        format!("{pipeline_id}.dlq")
    }

    /// Operational signal stream, consumed by the control plane.
    pub fn signal(pipeline_id: &str) -> String {
        format!("{pipeline_id}.signal")
    }

    /// KV bucket holding the deduplication window for one pipeline.
    pub fn dedup_bucket(pipeline_id: &str) -> String {
        format!("{pipeline_id}.dedup")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_serialize_with_wire_names() {
        let headers = Headers {
            schema_version_id: Some(3),
            dedup_key: Some("k".into()),
            kafka_msg_id: None,
        };
        let text = serde_json::to_string(&headers).unwrap();
        assert!(text.contains("\"schema-version-id\":3"));
        assert!(text.contains("\"dedup-key\":\"k\""));
        assert!(!text.contains("kafka-msg-id"));
    }

    #[test]
    fn subject_names_are_parameterised_by_pipeline() {
        assert_eq!(subjects::ingress("p1", "orders"), "p1.ingress.orders");
        assert_eq!(subjects::join_out("p1"), "p1.join.out");
        assert_eq!(subjects::dlq("p1"), "p1.dlq");
        assert_eq!(subjects::signal("p1"), "p1.signal");
    }
}
