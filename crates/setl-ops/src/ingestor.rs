//! Kafka ingestion: consume, validate, deduplicate, publish, commit.
//!
//! One loop per topic-partition, all sharing the topic's consumer. For every
//! record the loop resolves the schema version, validates the payload,
//! optionally claims the dedup key, publishes to the ingress subject, and
//! only then commits the Kafka offset, so delivery downstream is
//! at-least-once.
//!
//! Every drop is accounted: a record either reaches the ingress subject, is
//! silently dropped as a dedup repeat, or lands on the DLQ.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use setl_core::bus::{subjects, Headers, MessageBus};
use setl_core::capability::{ConsumeError, PartitionStream, RecordConsumer, SourceRecord};
use setl_core::definition::TopicConfig;
use setl_core::error::{Component, ErrorKind, SignalReason};
use setl_core::schema::SchemaError;
use setl_io::schema_cache::SchemaCache;

use crate::dedup::DedupStore;
use crate::dlq::ErrorChannels;
use crate::retry::bus_retry;

const POLL_RETRY: Duration = Duration::from_secs(1);

/// Terminal disposition of one consumed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Published,
    DedupDropped,
    DeadLettered,
}

pub struct Ingestor {
    pipeline_id: String,
    topic: TopicConfig,
    subject: String,
    cache: Arc<SchemaCache>,
    bus: Arc<dyn MessageBus>,
    channels: Arc<ErrorChannels>,
    dedup: Option<DedupStore>,
}

impl Ingestor {
    pub fn new(
        pipeline_id: &str,
        topic: TopicConfig,
        cache: Arc<SchemaCache>,
        bus: Arc<dyn MessageBus>,
        channels: Arc<ErrorChannels>,
    ) -> Self {
        let dedup = topic
            .deduplication
            .clone()
            .filter(|d| d.enabled)
            .map(|config| DedupStore::new(pipeline_id, Arc::clone(&bus), config));
        Self {
            pipeline_id: pipeline_id.to_string(),
            subject: subjects::ingress(pipeline_id, &topic.id),
            topic,
            cache,
            bus,
            channels,
            dedup,
        }
    }

    /// Run one loop per assigned partition until cancellation. Returns an
    /// error only for unrecoverable infrastructure failure (the bus staying
    /// unavailable through the whole retry schedule).
    pub async fn run(
        self: Arc<Self>,
        mut consumer: Box<dyn RecordConsumer>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let streams = consumer
            .partition_streams()
            .await
            .context("splitting consumer into partition streams")?;
        info!(
            "ingestor [{}]: topic {:?} starting {} partition loop(s)",
            self.pipeline_id,
            self.topic.name,
            streams.len()
        );

        let mut handles = Vec::with_capacity(streams.len());
        for stream in streams {
            let ingestor = Arc::clone(&self);
            let token = cancel.child_token();
            handles.push(tokio::spawn(async move {
                ingestor.partition_loop(stream, token).await
            }));
        }
        for handle in handles {
            handle.await.context("partition loop panicked")??;
        }
        info!("ingestor [{}]: topic {:?} stopped", self.pipeline_id, self.topic.name);
        Ok(())
    }

    async fn partition_loop(
        &self,
        mut stream: Box<dyn PartitionStream>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(
                        "ingestor [{}]: partition {} loop cancelled",
                        self.pipeline_id,
                        stream.partition()
                    );
                    return Ok(());
                }
                polled = stream.poll() => match polled {
                    Ok(record) => record,
                    Err(ConsumeError::Closed) => return Ok(()),
                    Err(e) => {
                        warn!("ingestor [{}]: poll failed: {e}", self.pipeline_id);
                        tokio::time::sleep(POLL_RETRY).await;
                        continue;
                    }
                },
            };

            metrics::increment_counter!("setl_consumed_total", "topic" => self.topic.id.clone());
            self.process(&record, &cancel).await?;

            // The offset advances for every accounted outcome; a commit
            // failure only means redelivery, which at-least-once tolerates.
            if let Err(e) = stream.commit(record.offset).await {
                warn!(
                    "ingestor [{}]: offset commit failed on partition {}: {e}",
                    self.pipeline_id,
                    stream.partition()
                );
            }
        }
    }

    async fn process(
        &self,
        record: &SourceRecord,
        cancel: &CancellationToken,
    ) -> Result<Disposition> {
        let (version, body) = match self
            .cache
            .resolve_for_record(&self.topic.id, &record.payload)
            .await
        {
            Ok(resolved) => resolved,
            Err(err) => return self.reject(record, err).await,
        };

        let parsed: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                self.dead_letter(
                    record,
                    ErrorKind::SchemaValidation,
                    format!("record is not valid JSON: {e}"),
                )
                .await?;
                return Ok(Disposition::DeadLettered);
            }
        };
        if let Err(err) = version.validate(&parsed) {
            self.dead_letter(record, ErrorKind::SchemaValidation, err.to_string())
                .await?;
            return Ok(Disposition::DeadLettered);
        }
        let object = match parsed.as_object() {
            Some(object) => object,
            None => {
                self.dead_letter(
                    record,
                    ErrorKind::SchemaValidation,
                    "record is not a JSON object".to_string(),
                )
                .await?;
                return Ok(Disposition::DeadLettered);
            }
        };

        let mut dedup_key = None;
        if let Some(store) = &self.dedup {
            let key = match store.key_for(object) {
                Ok(key) => key,
                Err(e) => {
                    self.dead_letter(record, ErrorKind::SchemaValidation, e.to_string())
                        .await?;
                    return Ok(Disposition::DeadLettered);
                }
            };
            let first = bus_retry("ingestor", cancel, || {
                store.insert_first(&self.topic.id, &key)
            })
            .await?;
            if !first {
                // First writer won; repeats inside the window drop silently.
                debug!(
                    "ingestor [{}]: dropping duplicate key {key} on topic {:?}",
                    self.pipeline_id, self.topic.id
                );
                metrics::increment_counter!("setl_dedup_dropped_total", "topic" => self.topic.id.clone());
                return Ok(Disposition::DedupDropped);
            }
            dedup_key = Some(key);
        }

        let headers = Headers {
            schema_version_id: Some(version.version_id),
            dedup_key,
            kafka_msg_id: Some(record.msg_id()),
        };
        let payload = body.to_vec();
        bus_retry("ingestor", cancel, || {
            self.bus.publish(&self.subject, headers.clone(), payload.clone())
        })
        .await?;
        metrics::increment_counter!("setl_published_total", "topic" => self.topic.id.clone());
        Ok(Disposition::Published)
    }

    /// Schema resolution failed; dead-letter the record and, for conditions
    /// the control plane must know about, raise a signal.
    async fn reject(&self, record: &SourceRecord, err: SchemaError) -> Result<Disposition> {
        match &err {
            SchemaError::MalformedEnvelope(_) => {
                self.dead_letter(record, ErrorKind::MalformedEnvelope, err.to_string())
                    .await?;
            }
            SchemaError::NotFound { version_id, .. } => {
                let text = match version_id {
                    Some(id) => format!("schema id {id} validation failed"),
                    None => err.to_string(),
                };
                self.dead_letter(record, ErrorKind::SchemaNotFound, text.clone())
                    .await?;
                self.channels
                    .signal(Component::Ingestor, SignalReason::SchemaNotFound, text)
                    .await
                    .context("signalling schema_not_found")?;
            }
            // An unreachable registry resolves to schema-not-found.
            SchemaError::Registry(_) => {
                self.dead_letter(record, ErrorKind::SchemaNotFound, err.to_string())
                    .await?;
                self.channels
                    .signal(Component::Ingestor, SignalReason::SchemaNotFound, err.to_string())
                    .await
                    .context("signalling schema_not_found")?;
            }
            SchemaError::Incompatible { .. } => {
                self.dead_letter(record, ErrorKind::SchemaIncompatible, err.to_string())
                    .await?;
                self.channels
                    .signal(Component::Ingestor, SignalReason::SchemaIncompatible, err.to_string())
                    .await
                    .context("signalling schema_incompatible")?;
            }
            SchemaError::Validation { .. } | SchemaError::UnsupportedFormat(_) => {
                self.dead_letter(record, ErrorKind::SchemaValidation, err.to_string())
                    .await?;
            }
        }
        Ok(Disposition::DeadLettered)
    }

    async fn dead_letter(
        &self,
        record: &SourceRecord,
        kind: ErrorKind,
        message: String,
    ) -> Result<()> {
        self.channels
            .dlq(Component::Ingestor, kind, message, record.payload.clone())
            .await
            .context("writing DLQ entry")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use setl_core::definition::PipelineDefinition;
    use setl_core::error::DlqEntry;
    use setl_io::bus_memory::MemoryBus;
    use setl_io::source_memory::MemorySource;

    use super::*;

    fn definition(dedup: bool) -> PipelineDefinition {
        let dedup_block = if dedup {
            r#"
      deduplication:
        enabled: true
        id_field: id
        id_field_type: int64
        time_window: 1h"#
        } else {
            ""
        };
        PipelineDefinition::from_yaml(&format!(
            r#"
pipeline_id: p1
ingestor:
  kafka_connection:
    brokers: localhost:9092
  topics:
    - name: orders
      id: orders
      consumer_group: g1
      partitions: 1{dedup_block}
sink:
  type: clickhouse
  source_id: orders
  table: orders
  mapping:
    - column: id
      column_type: int64
      source_field: id
schema_versions:
  orders:
    version_id: 1
    fields:
      - name: id
        type: int64
"#
        ))
        .unwrap()
    }

    struct Fixture {
        bus: Arc<MemoryBus>,
        source: MemorySource,
        ingestor: Arc<Ingestor>,
        cancel: CancellationToken,
    }

    fn fixture(dedup: bool) -> Fixture {
        let def = definition(dedup);
        let bus = Arc::new(MemoryBus::default());
        let cache = Arc::new(SchemaCache::from_definition(&def, None));
        let channels = Arc::new(ErrorChannels::new("p1", bus.clone()));
        let topic = def.ingestor.topics[0].clone();
        let ingestor = Arc::new(Ingestor::new("p1", topic, cache, bus.clone(), channels));
        Fixture {
            bus,
            source: MemorySource::new("orders", 1),
            ingestor,
            cancel: CancellationToken::new(),
        }
    }

    async fn run_until_published(fix: &Fixture, expected: usize) {
        let consumer = Box::new(fix.source.clone());
        let handle = tokio::spawn(fix.ingestor.clone().run(consumer, fix.cancel.clone()));
        let subject = "p1.ingress.orders";
        for _ in 0..200 {
            if fix.bus.message_count(subject).await >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Give trailing work (commits, dlq writes) a moment to land.
        tokio::time::sleep(Duration::from_millis(30)).await;
        fix.cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn publishes_valid_records_with_headers_and_commits() {
        let fix = fixture(false);
        fix.source.push_json(0, r#"{"id": 1}"#).await;
        fix.source.push_json(0, r#"{"id": 2}"#).await;
        run_until_published(&fix, 2).await;

        let published = fix.bus.published("p1.ingress.orders").await;
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0.schema_version_id, Some(1));
        assert_eq!(published[0].0.kafka_msg_id.as_deref(), Some("orders-0-0"));
        assert_eq!(fix.source.committed(0).await, 1);
        assert_eq!(fix.bus.message_count("p1.dlq").await, 0);
    }

    #[tokio::test]
    async fn duplicate_keys_inside_window_are_dropped_silently() {
        let fix = fixture(true);
        for id in [123, 456, 789, 789] {
            fix.source
                .push_json(0, &json!({ "id": id }).to_string())
                .await;
        }
        run_until_published(&fix, 3).await;

        let published = fix.bus.published("p1.ingress.orders").await;
        assert_eq!(published.len(), 3);
        assert_eq!(fix.bus.message_count("p1.dlq").await, 0);
        // The duplicate still advances the offset.
        assert_eq!(fix.source.committed(0).await, 3);
        // The winning record carries the dedup key header.
        assert!(published[2].0.dedup_key.is_some());
    }

    #[tokio::test]
    async fn invalid_records_are_dead_lettered_and_committed() {
        let fix = fixture(false);
        fix.source.push_json(0, r#"{"id": "not-a-number"}"#).await;
        fix.source.push_json(0, r#"{"id": 7}"#).await;
        run_until_published(&fix, 1).await;

        assert_eq!(fix.bus.message_count("p1.ingress.orders").await, 1);
        let dlq = fix.bus.published("p1.dlq").await;
        assert_eq!(dlq.len(), 1);
        let entry: DlqEntry = serde_json::from_slice(&dlq[0].1).unwrap();
        assert_eq!(entry.error_kind, ErrorKind::SchemaValidation);
        assert_eq!(entry.component, Component::Ingestor);
        assert_eq!(entry.original_message, br#"{"id": "not-a-number"}"#);
        assert_eq!(fix.source.committed(0).await, 1);
    }

    #[tokio::test]
    async fn non_json_payload_is_dead_lettered() {
        let fix = fixture(false);
        fix.source.push(0, None, b"\xff\xfe not json".to_vec()).await;
        fix.source.push_json(0, r#"{"id": 1}"#).await;
        run_until_published(&fix, 1).await;

        assert_eq!(fix.bus.message_count("p1.dlq").await, 1);
        assert_eq!(fix.bus.message_count("p1.ingress.orders").await, 1);
    }
}
