//! In-memory message bus with durable-subject semantics.
//!
//! Backs tests and single-process local runs. Subjects are append-only logs;
//! a durable consumer owns a cursor plus a pending set, and deliveries that
//! are not acked within the ack deadline are redelivered. The KV facility
//! enforces entry TTLs itself, matching the contract the dedup store relies
//! on.
//!
//! Timekeeping uses `tokio::time`, so tests can pause and advance the clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use setl_core::bus::{BusError, Delivery, Headers, MessageBus, Subscription};

const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
    ack_wait: Duration,
}

#[derive(Default)]
struct BusState {
    subjects: HashMap<String, SubjectLog>,
    kv: HashMap<String, HashMap<String, KvEntry>>,
}

#[derive(Default)]
struct SubjectLog {
    messages: Vec<StoredMessage>,
    durables: HashMap<String, DurableCursor>,
}

#[derive(Clone)]
struct StoredMessage {
    headers: Headers,
    payload: Vec<u8>,
}

#[derive(Default)]
struct DurableCursor {
    next_index: usize,
    next_delivery_id: u64,
    pending: HashMap<u64, PendingDelivery>,
}

struct PendingDelivery {
    msg_index: usize,
    deadline: Instant,
}

struct KvEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_WAIT)
    }
}

impl MemoryBus {
    pub fn new(ack_wait: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            notify: Arc::new(Notify::new()),
            ack_wait,
        }
    }

    /// Snapshot of everything published on `subject`, in publish order.
    /// Introspection for tests and local tooling.
    pub async fn published(&self, subject: &str) -> Vec<(Headers, Vec<u8>)> {
        let state = self.state.lock().await;
        state
            .subjects
            .get(subject)
            .map(|log| {
                log.messages
                    .iter()
                    .map(|m| (m.headers.clone(), m.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn message_count(&self, subject: &str) -> usize {
        let state = self.state.lock().await;
        state.subjects.get(subject).map(|log| log.messages.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        state
            .subjects
            .entry(subject.to_string())
            .or_default()
            .messages
            .push(StoredMessage { headers, payload });
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let mut state = self.state.lock().await;
        state
            .subjects
            .entry(subject.to_string())
            .or_default()
            .durables
            .entry(durable_name.to_string())
            .or_default();
        drop(state);
        Ok(Box::new(MemorySubscription {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            subject: subject.to_string(),
            durable_name: durable_name.to_string(),
            ack_wait: self.ack_wait,
        }))
    }

    async fn kv_put_if_absent(
        &self,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, BusError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let bucket = state.kv.entry(bucket.to_string()).or_default();
        match bucket.get(key) {
            Some(entry) if entry.expires_at > now => Ok(false),
            _ => {
                bucket.insert(key.to_string(), KvEntry { value, expires_at: now + ttl });
                Ok(true)
            }
        }
    }

    async fn kv_get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, BusError> {
        let now = Instant::now();
        let state = self.state.lock().await;
        Ok(state
            .kv
            .get(bucket)
            .and_then(|b| b.get(key))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }
}

struct MemorySubscription {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
    subject: String,
    durable_name: String,
    ack_wait: Duration,
}

impl MemorySubscription {
    /// One delivery attempt: a timed-out pending message first, then the next
    /// unseen log entry. `None` means nothing is deliverable right now.
    async fn try_deliver(&self) -> Option<Delivery> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let log = state.subjects.get_mut(&self.subject)?;
        let message_count = log.messages.len();
        let cursor = log.durables.get_mut(&self.durable_name)?;

        let expired = cursor
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .min_by_key(|(_, p)| p.msg_index)
            .map(|(id, _)| *id);
        if let Some(old_id) = expired {
            let Some(pending) = cursor.pending.remove(&old_id) else {
                return None;
            };
            let delivery_id = cursor.next_delivery_id;
            cursor.next_delivery_id += 1;
            cursor.pending.insert(
                delivery_id,
                PendingDelivery { msg_index: pending.msg_index, deadline: now + self.ack_wait },
            );
            let message = log.messages[pending.msg_index].clone();
            return Some(Delivery {
                subject: self.subject.clone(),
                headers: message.headers,
                payload: message.payload,
                delivery_id,
                redelivered: true,
            });
        }

        if cursor.next_index < message_count {
            let msg_index = cursor.next_index;
            cursor.next_index += 1;
            let delivery_id = cursor.next_delivery_id;
            cursor.next_delivery_id += 1;
            cursor
                .pending
                .insert(delivery_id, PendingDelivery { msg_index, deadline: now + self.ack_wait });
            let message = log.messages[msg_index].clone();
            return Some(Delivery {
                subject: self.subject.clone(),
                headers: message.headers,
                payload: message.payload,
                delivery_id,
                redelivered: false,
            });
        }

        None
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>, BusError> {
        loop {
            if let Some(delivery) = self.try_deliver().await {
                return Ok(Some(delivery));
            }
            // Wake on publish, or re-check for ack-deadline expiries.
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.ack_wait.min(Duration::from_millis(25))) => {}
            }
        }
    }

    async fn ack(&mut self, delivery_id: u64) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if let Some(log) = state.subjects.get_mut(&self.subject) {
            if let Some(cursor) = log.durables.get_mut(&self.durable_name) {
                cursor.pending.remove(&delivery_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = MemoryBus::default();
        bus.publish("s", Headers::default(), b"one".to_vec()).await.unwrap();
        bus.publish("s", Headers::default(), b"two".to_vec()).await.unwrap();

        let mut sub = bus.subscribe("s", "d").await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
        assert!(!first.redelivered);
    }

    #[tokio::test]
    async fn unacked_delivery_is_redelivered_after_deadline() {
        let bus = MemoryBus::new(Duration::from_millis(40));
        bus.publish("s", Headers::default(), b"msg".to_vec()).await.unwrap();

        let mut sub = bus.subscribe("s", "d").await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        assert!(!first.redelivered);

        let again = sub.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.payload, b"msg");

        sub.ack(again.delivery_id).await.unwrap();
        tokio::select! {
            _ = sub.next() => panic!("acked message must not be redelivered"),
            _ = tokio::time::sleep(Duration::from_millis(120)) => {}
        }
    }

    #[tokio::test]
    async fn durable_cursor_is_shared_across_resubscribes() {
        let bus = MemoryBus::default();
        bus.publish("s", Headers::default(), b"one".to_vec()).await.unwrap();
        bus.publish("s", Headers::default(), b"two".to_vec()).await.unwrap();

        let mut sub = bus.subscribe("s", "d").await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        sub.ack(first.delivery_id).await.unwrap();
        drop(sub);

        let mut resumed = bus.subscribe("s", "d").await.unwrap();
        let second = resumed.next().await.unwrap().unwrap();
        assert_eq!(second.payload, b"two");
    }

    #[tokio::test(start_paused = true)]
    async fn kv_entry_expires_after_ttl() {
        let bus = MemoryBus::default();
        let inserted = bus
            .kv_put_if_absent("b", "k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(inserted);
        assert!(!bus
            .kv_put_if_absent("b", "k", b"v2".to_vec(), Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(bus.kv_get("b", "k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(bus.kv_get("b", "k").await.unwrap(), None);
        assert!(bus
            .kv_put_if_absent("b", "k", b"v3".to_vec(), Duration::from_secs(60))
            .await
            .unwrap());
    }
}
