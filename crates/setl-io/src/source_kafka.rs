use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{CommitMode, Consumer, DefaultConsumerContext, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, warn};

use setl_core::capability::{ConsumeError, PartitionStream, RecordConsumer, SourceRecord};
use setl_core::definition::{KafkaConnectionConfig, TopicConfig};

/// Kafka driver for the consumer capability.
///
/// One `StreamConsumer` (one broker connection) per topic per pipeline;
/// partition parallelism comes from splitting it into per-partition queues.
/// Offsets are committed manually, only after the downstream publish
/// succeeded, so delivery is at-least-once.
pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partitions: usize,
}

impl KafkaSource {
    pub fn connect(
        connection: &KafkaConnectionConfig,
        topic: &TopicConfig,
    ) -> Result<Self, ConsumeError> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &connection.brokers)
            .set("group.id", &topic.consumer_group)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false");
        for (key, value) in &connection.options {
            config.set(key, value);
        }

        let consumer: StreamConsumer =
            config.create().map_err(|e| ConsumeError::Poll(e.to_string()))?;

        // The definition's partition count is authoritative; assign them
        // explicitly instead of waiting on group rebalance.
        let mut assignment = TopicPartitionList::new();
        for partition in 0..topic.partitions {
            assignment.add_partition(&topic.name, partition as i32);
        }
        consumer
            .assign(&assignment)
            .map_err(|e| ConsumeError::Poll(e.to_string()))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: topic.name.clone(),
            partitions: topic.partitions,
        })
    }
}

#[async_trait]
impl RecordConsumer for KafkaSource {
    async fn partition_streams(&mut self) -> Result<Vec<Box<dyn PartitionStream>>, ConsumeError> {
        let mut streams: Vec<Box<dyn PartitionStream>> = Vec::with_capacity(self.partitions);
        for partition in 0..self.partitions {
            let queue = self
                .consumer
                .split_partition_queue(&self.topic, partition as i32)
                .ok_or_else(|| {
                    ConsumeError::Poll(format!(
                        "partition {partition} of {:?} could not be split",
                        self.topic
                    ))
                })?;
            streams.push(Box::new(KafkaPartitionStream {
                topic: self.topic.clone(),
                partition: partition as i32,
                queue,
                consumer: Arc::clone(&self.consumer),
            }));
        }

        // With all partitions split off, the main stream only carries driver
        // events; it still has to be polled for commits to make progress.
        let driver = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        tokio::spawn(async move {
            loop {
                match driver.recv().await {
                    Ok(message) => debug!(
                        "unexpected message on main stream for {}: partition {}",
                        topic,
                        message.partition()
                    ),
                    Err(e) => {
                        warn!("kafka driver event stream for {} ended: {e}", topic);
                        break;
                    }
                }
            }
        });

        Ok(streams)
    }
}

struct KafkaPartitionStream {
    topic: String,
    partition: i32,
    queue: StreamPartitionQueue<DefaultConsumerContext>,
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl PartitionStream for KafkaPartitionStream {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn poll(&mut self) -> Result<SourceRecord, ConsumeError> {
        let message = self
            .queue
            .recv()
            .await
            .map_err(|e| ConsumeError::Poll(e.to_string()))?;
        Ok(SourceRecord {
            topic: self.topic.clone(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| k.to_vec()),
            payload: message.payload().unwrap_or_default().to_vec(),
        })
    }

    async fn commit(&mut self, offset: i64) -> Result<(), ConsumeError> {
        let mut committed = TopicPartitionList::new();
        committed
            .add_partition_offset(&self.topic, self.partition, Offset::Offset(offset + 1))
            .map_err(|e| ConsumeError::Commit(e.to_string()))?;
        self.consumer
            .commit(&committed, CommitMode::Async)
            .map_err(|e| ConsumeError::Commit(e.to_string()))
    }
}
