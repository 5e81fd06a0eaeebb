//! In-memory implementation of the consumer capability.
//!
//! Each partition is an append-only record log with a poll cursor and a
//! committed offset. Re-splitting the consumer rewinds the poll cursor to the
//! committed offset, which is exactly the redelivery behaviour a real broker
//! gives a restarted consumer group.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use setl_core::capability::{ConsumeError, PartitionStream, RecordConsumer, SourceRecord};

#[derive(Clone)]
pub struct MemorySource {
    topic: String,
    partitions: Arc<Vec<Arc<PartitionState>>>,
}

struct PartitionState {
    log: Mutex<PartitionLog>,
    notify: Notify,
}

#[derive(Default)]
struct PartitionLog {
    records: Vec<StoredRecord>,
    next_poll: usize,
    committed: i64,
}

#[derive(Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

impl MemorySource {
    pub fn new(topic: &str, partitions: usize) -> Self {
        let states = (0..partitions)
            .map(|_| {
                Arc::new(PartitionState {
                    log: Mutex::new(PartitionLog { committed: -1, ..Default::default() }),
                    notify: Notify::new(),
                })
            })
            .collect();
        Self { topic: topic.to_string(), partitions: Arc::new(states) }
    }

    /// Append a record to `partition`; offsets are assigned sequentially.
    pub async fn push(&self, partition: i32, key: Option<Vec<u8>>, payload: Vec<u8>) {
        let state = &self.partitions[partition as usize];
        state.log.lock().await.records.push(StoredRecord { key, payload });
        state.notify.notify_waiters();
    }

    pub async fn push_json(&self, partition: i32, payload: &str) {
        self.push(partition, None, payload.as_bytes().to_vec()).await;
    }

    /// Highest committed offset for `partition`, `-1` when nothing is
    /// committed yet.
    pub async fn committed(&self, partition: i32) -> i64 {
        self.partitions[partition as usize].log.lock().await.committed
    }
}

#[async_trait]
impl RecordConsumer for MemorySource {
    async fn partition_streams(&mut self) -> Result<Vec<Box<dyn PartitionStream>>, ConsumeError> {
        let mut streams: Vec<Box<dyn PartitionStream>> = Vec::with_capacity(self.partitions.len());
        for (partition, state) in self.partitions.iter().enumerate() {
            {
                // Restarted consumers resume from the committed offset.
                let mut log = state.log.lock().await;
                log.next_poll = (log.committed + 1) as usize;
            }
            streams.push(Box::new(MemoryPartitionStream {
                topic: self.topic.clone(),
                partition: partition as i32,
                state: Arc::clone(state),
            }));
        }
        Ok(streams)
    }
}

struct MemoryPartitionStream {
    topic: String,
    partition: i32,
    state: Arc<PartitionState>,
}

#[async_trait]
impl PartitionStream for MemoryPartitionStream {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn poll(&mut self) -> Result<SourceRecord, ConsumeError> {
        loop {
            // Register for wakeups before checking the log, otherwise a push
            // landing between the check and the await is lost.
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut log = self.state.log.lock().await;
                if log.next_poll < log.records.len() {
                    let offset = log.next_poll;
                    let record = log.records[offset].clone();
                    log.next_poll += 1;
                    return Ok(SourceRecord {
                        topic: self.topic.clone(),
                        partition: self.partition,
                        offset: offset as i64,
                        key: record.key,
                        payload: record.payload,
                    });
                }
            }
            notified.await;
        }
    }

    async fn commit(&mut self, offset: i64) -> Result<(), ConsumeError> {
        let mut log = self.state.log.lock().await;
        log.committed = log.committed.max(offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn polls_in_order_and_resumes_from_committed() {
        let mut source = MemorySource::new("t", 1);
        source.push_json(0, "one").await;
        source.push_json(0, "two").await;

        let mut streams = source.partition_streams().await.unwrap();
        let first = streams[0].poll().await.unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(first.offset, 0);
        streams[0].commit(0).await.unwrap();
        let second = streams[0].poll().await.unwrap();
        assert_eq!(second.payload, b"two");
        drop(streams);

        // Offset 1 was never committed: a re-split replays it.
        let mut resumed = source.partition_streams().await.unwrap();
        let replayed = resumed[0].poll().await.unwrap();
        assert_eq!(replayed.payload, b"two");
        assert_eq!(replayed.offset, 1);
    }

    #[tokio::test]
    async fn partitions_are_independent() {
        let mut source = MemorySource::new("t", 2);
        source.push_json(1, "only-on-one").await;
        let mut streams = source.partition_streams().await.unwrap();
        let record = streams[1].poll().await.unwrap();
        assert_eq!(record.partition, 1);
        assert_eq!(source.committed(0).await, -1);
    }
}
