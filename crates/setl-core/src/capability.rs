//! Capabilities implemented by external collaborators.
//!
//! The runtime is written entirely against these traits; concrete Kafka,
//! schema-registry and database drivers live behind them. Each capability is
//! the minimal surface a component needs, so a test double is a few lines.

use async_trait::async_trait;
use serde_json::Value;

use crate::schema::{Field, SchemaError};

/// One record pulled from a Kafka topic-partition.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl SourceRecord {
    /// Stable observability id carried downstream as the `kafka-msg-id`
    /// header.
    pub fn msg_id(&self) -> String {
        format!("{}-{}-{}", self.topic, self.partition, self.offset)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("kafka poll failed: {0}")]
    Poll(String),

    #[error("kafka offset commit failed: {0}")]
    Commit(String),

    #[error("partition stream closed")]
    Closed,
}

/// In-order stream of one assigned topic-partition.
///
/// `poll` must be cancel-safe. `commit` marks everything up to and including
/// `offset` as processed; it is only called after the corresponding publish
/// succeeded (at-least-once).
#[async_trait]
pub trait PartitionStream: Send {
    fn topic(&self) -> &str;
    fn partition(&self) -> i32;
    async fn poll(&mut self) -> Result<SourceRecord, ConsumeError>;
    async fn commit(&mut self, offset: i64) -> Result<(), ConsumeError>;
}

/// Consumer-group member for one topic. There is a single consumer (and thus
/// a single broker connection) per topic per pipeline; partition parallelism
/// comes from splitting it into per-partition streams.
#[async_trait]
pub trait RecordConsumer: Send + Sync {
    /// Split into one stream per assigned partition. Records within a stream
    /// arrive in partition order.
    async fn partition_streams(&mut self) -> Result<Vec<Box<dyn PartitionStream>>, ConsumeError>;
}

/// Remote schema registry lookup, keyed by the wire-envelope schema id.
#[async_trait]
pub trait SchemaRegistryRemote: Send + Sync + 'static {
    /// Fetch the field list for `schema_id`. `Ok(None)` means the registry
    /// does not know the id; transport failures are `Err`.
    async fn get(&self, schema_id: u32) -> Result<Option<Vec<Field>>, SchemaError>;
}

/// Failures of the analytical database, split by disposition: transient
/// failures are retried with backoff, fatal ones stop the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("transient database failure: {0}")]
    Transient(String),

    #[error("fatal database failure: {0}")]
    Fatal(String),
}

/// Batch-insert surface of the destination database. The sink issues only
/// bulk inserts of a fixed column set; there is no query path.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn insert_batch(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> Result<(), DbError>;
}
