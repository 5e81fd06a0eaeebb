//! Temporal inner join of two ingress streams.
//!
//! A single owner task multiplexes left arrivals, right arrivals and the
//! eviction tick, which makes the interleaving deterministic for a given
//! arrival order. Each side buffers records per join key; an arrival emits
//! one combined record for every live opposite-side entry with the same key,
//! and both sides retain their entries until the side's TTL expires, so the
//! join is many-to-many within the window.
//!
//! Eviction never emits; only arrivals do. Backpressure is upstream bus
//! credit: the loop publishes inline, so a blocked egress pauses both inputs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use setl_core::bus::{subjects, Delivery, Headers, MessageBus};
use setl_core::definition::{JoinConfig, JoinProjection, JoinSide};
use setl_core::error::{Component, ErrorKind, StartupError};

use crate::dlq::ErrorChannels;
use crate::retry::bus_retry;

const MIN_EVICTION_INTERVAL: Duration = Duration::from_millis(100);

pub struct JoinOperator {
    pipeline_id: String,
    left: SideConfig,
    right: SideConfig,
    projection: Vec<JoinProjection>,
    output_subject: String,
    eviction_interval: Duration,
    bus: Arc<dyn MessageBus>,
    channels: Arc<ErrorChannels>,
}

struct SideConfig {
    source_id: String,
    join_key: String,
    ttl: Duration,
    input_subject: String,
}

/// Per-key, arrival-ordered buffer of one side.
struct SideBuffer {
    entries: HashMap<String, Vec<BufferedRecord>>,
}

struct BufferedRecord {
    record: Map<String, Value>,
    arrived_at: Instant,
}

impl SideBuffer {
    fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    fn insert(&mut self, key: String, record: Map<String, Value>, arrived_at: Instant) {
        self.entries
            .entry(key)
            .or_default()
            .push(BufferedRecord { record, arrived_at });
    }

    /// Live entries for `key` in arrival order.
    fn live<'a>(
        &'a self,
        key: &str,
        now: Instant,
        ttl: Duration,
    ) -> impl Iterator<Item = &'a BufferedRecord> + 'a {
        self.entries
            .get(key)
            .into_iter()
            .flatten()
            .filter(move |entry| now.duration_since(entry.arrived_at) <= ttl)
    }

    fn evict_older_than(&mut self, now: Instant, ttl: Duration) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, records| {
            let before = records.len();
            records.retain(|entry| now.duration_since(entry.arrived_at) <= ttl);
            removed += before - records.len();
            !records.is_empty()
        });
        removed
    }

    fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

impl JoinOperator {
    /// `input_subjects` maps each join source id to the subject its chain
    /// terminates on (ingress, transform or filter output).
    pub fn new(
        pipeline_id: &str,
        config: &JoinConfig,
        input_subjects: &HashMap<String, String>,
        bus: Arc<dyn MessageBus>,
        channels: Arc<ErrorChannels>,
    ) -> Result<Self, StartupError> {
        let side = |orientation: JoinSide| -> Result<SideConfig, StartupError> {
            let source = config.side(orientation).ok_or_else(|| {
                StartupError(format!("temporal join is missing its {orientation} source"))
            })?;
            let input_subject = input_subjects.get(&source.source_id).ok_or_else(|| {
                StartupError(format!(
                    "join source {:?} has no input subject",
                    source.source_id
                ))
            })?;
            Ok(SideConfig {
                source_id: source.source_id.clone(),
                join_key: source.join_key.clone(),
                ttl: source.time_window,
                input_subject: input_subject.clone(),
            })
        };

        let left = side(JoinSide::Left)?;
        let right = side(JoinSide::Right)?;
        let eviction_interval = (left.ttl.min(right.ttl) / 10).max(MIN_EVICTION_INTERVAL);

        Ok(Self {
            pipeline_id: pipeline_id.to_string(),
            left,
            right,
            projection: config.projection.clone(),
            output_subject: subjects::join_out(pipeline_id),
            eviction_interval,
            bus,
            channels,
        })
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut left_sub = self
            .bus
            .subscribe(&self.left.input_subject, "join-left")
            .await
            .context("subscribing join left input")?;
        let mut right_sub = self
            .bus
            .subscribe(&self.right.input_subject, "join-right")
            .await
            .context("subscribing join right input")?;

        let mut left_buf = SideBuffer::new();
        let mut right_buf = SideBuffer::new();
        let mut tick = tokio::time::interval(self.eviction_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            "join [{}]: {} (left) x {} (right) -> {}",
            self.pipeline_id,
            self.left.input_subject,
            self.right.input_subject,
            self.output_subject
        );

        loop {
            // Fixed polling priority keeps re-processing of the same arrival
            // order deterministic.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("join [{}]: stopped", self.pipeline_id);
                    return Ok(());
                }
                delivery = left_sub.next() => {
                    let delivery = match delivery.context("join left input")? {
                        Some(delivery) => delivery,
                        None => return Ok(()),
                    };
                    self.on_arrival(
                        JoinSide::Left,
                        &delivery,
                        &mut left_buf,
                        &mut right_buf,
                        &cancel,
                    )
                    .await?;
                    left_sub.ack(delivery.delivery_id).await.context("acking join left")?;
                }
                delivery = right_sub.next() => {
                    let delivery = match delivery.context("join right input")? {
                        Some(delivery) => delivery,
                        None => return Ok(()),
                    };
                    self.on_arrival(
                        JoinSide::Right,
                        &delivery,
                        &mut right_buf,
                        &mut left_buf,
                        &cancel,
                    )
                    .await?;
                    right_sub.ack(delivery.delivery_id).await.context("acking join right")?;
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    let evicted = left_buf.evict_older_than(now, self.left.ttl)
                        + right_buf.evict_older_than(now, self.right.ttl);
                    if evicted > 0 {
                        debug!(
                            "join [{}]: evicted {evicted} expired entries ({} left, {} right live)",
                            self.pipeline_id,
                            left_buf.len(),
                            right_buf.len()
                        );
                    }
                }
            }
        }
    }

    /// Buffer the arrival, then emit one combined record per live
    /// opposite-side entry with the same key. The delivery is acked by the
    /// caller only after every emission was published.
    async fn on_arrival(
        &self,
        side: JoinSide,
        delivery: &Delivery,
        own: &mut SideBuffer,
        other: &mut SideBuffer,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let config = self.side_config(side);
        let record: Map<String, Value> = match serde_json::from_slice(&delivery.payload) {
            Ok(Value::Object(object)) => object,
            _ => {
                return self
                    .dead_letter(delivery, format!("{side} record is not a JSON object"))
                    .await
            }
        };
        let key = match record.get(&config.join_key).and_then(canonical_key) {
            Some(key) => key,
            None => {
                return self
                    .dead_letter(
                        delivery,
                        format!("{side} record has no usable join key {:?}", config.join_key),
                    )
                    .await
            }
        };

        let now = Instant::now();
        let other_config = self.side_config(side.other());

        let mut outputs = Vec::new();
        for matched in other.live(&key, now, other_config.ttl) {
            let combined = match side {
                JoinSide::Left => self.project(&record, &matched.record),
                JoinSide::Right => self.project(&matched.record, &record),
            };
            outputs.push(combined);
        }
        own.insert(key.clone(), record, now);

        for output in outputs {
            let payload =
                serde_json::to_vec(&Value::Object(output)).context("serializing join output")?;
            let headers = Headers {
                schema_version_id: delivery.headers.schema_version_id,
                dedup_key: None,
                kafka_msg_id: delivery.headers.kafka_msg_id.clone(),
            };
            bus_retry("join", cancel, || {
                self.bus
                    .publish(&self.output_subject, headers.clone(), payload.clone())
            })
            .await?;
            metrics::increment_counter!("setl_join_emitted_total");
        }
        if !delivery.redelivered {
            debug!(
                "join [{}]: {side} arrival key {key} matched {} live entries",
                self.pipeline_id,
                other.live(&key, now, other_config.ttl).count()
            );
        } else {
            warn!(
                "join [{}]: reprocessing redelivered {side} arrival for key {key}",
                self.pipeline_id
            );
        }
        Ok(())
    }

    fn side_config(&self, side: JoinSide) -> &SideConfig {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }

    fn project(
        &self,
        left: &Map<String, Value>,
        right: &Map<String, Value>,
    ) -> Map<String, Value> {
        let mut output = Map::with_capacity(self.projection.len());
        for p in &self.projection {
            let source = if p.source_id == self.left.source_id { left } else { right };
            let value = source.get(&p.source_name).cloned().unwrap_or(Value::Null);
            output.insert(p.output_name.clone(), value);
        }
        output
    }

    async fn dead_letter(&self, delivery: &Delivery, message: String) -> Result<()> {
        self.channels
            .dlq(
                Component::Join,
                ErrorKind::JoinPublishError,
                message,
                delivery.payload.clone(),
            )
            .await
            .context("writing join DLQ entry")
    }
}

/// Canonical text form of a join key value. Numbers compare numerically, so
/// `1` and `1.0` land on the same key.
fn canonical_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(format!("s:{s}")),
        Value::Number(n) => n.as_f64().map(|f| format!("n:{f}")),
        Value::Bool(b) => Some(format!("b:{b}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use setl_core::definition::{JoinSourceConfig, JoinType};
    use setl_io::bus_memory::MemoryBus;

    use super::*;

    fn join_config(left_ttl: Duration, right_ttl: Duration) -> JoinConfig {
        JoinConfig {
            enabled: true,
            join_type: JoinType::Temporal,
            sources: vec![
                JoinSourceConfig {
                    source_id: "users".into(),
                    join_key: "id".into(),
                    time_window: left_ttl,
                    orientation: JoinSide::Left,
                },
                JoinSourceConfig {
                    source_id: "emails".into(),
                    join_key: "id".into(),
                    time_window: right_ttl,
                    orientation: JoinSide::Right,
                },
            ],
            projection: vec![
                JoinProjection {
                    source_id: "users".into(),
                    source_name: "id".into(),
                    output_name: "id".into(),
                },
                JoinProjection {
                    source_id: "users".into(),
                    source_name: "name".into(),
                    output_name: "name".into(),
                },
                JoinProjection {
                    source_id: "emails".into(),
                    source_name: "email".into(),
                    output_name: "email".into(),
                },
            ],
        }
    }

    struct Fixture {
        bus: Arc<MemoryBus>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start(left_ttl: Duration, right_ttl: Duration) -> Fixture {
        let bus = Arc::new(MemoryBus::default());
        let channels = Arc::new(ErrorChannels::new("p1", bus.clone()));
        let mut subjects_by_source = HashMap::new();
        subjects_by_source.insert("users".to_string(), "p1.ingress.users".to_string());
        subjects_by_source.insert("emails".to_string(), "p1.ingress.emails".to_string());
        let operator = JoinOperator::new(
            "p1",
            &join_config(left_ttl, right_ttl),
            &subjects_by_source,
            bus.clone(),
            channels,
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { operator.run(token).await });
        Fixture { bus, cancel, handle }
    }

    impl Fixture {
        async fn push(&self, subject: &str, payload: &str) {
            self.bus
                .publish(subject, Headers::with_version(1), payload.as_bytes().to_vec())
                .await
                .unwrap();
        }

        async fn outputs(&self, expected: usize) -> Vec<Map<String, Value>> {
            for _ in 0..300 {
                if self.bus.message_count("p1.join.out").await >= expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.bus
                .published("p1.join.out")
                .await
                .into_iter()
                .map(|(_, payload)| {
                    serde_json::from_slice::<Value>(&payload)
                        .unwrap()
                        .as_object()
                        .unwrap()
                        .clone()
                })
                .collect()
        }

        async fn stop(self) {
            self.cancel.cancel();
            self.handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn inner_join_emits_matched_pairs_only() {
        let fix = start(Duration::from_secs(2), Duration::from_secs(2)).await;
        fix.push("p1.ingress.users", r#"{"id": 1, "name": "Alice"}"#).await;
        fix.push("p1.ingress.users", r#"{"id": 2, "name": "Bob"}"#).await;
        fix.push("p1.ingress.users", r#"{"id": 3, "name": "Charlie"}"#).await;
        fix.push("p1.ingress.emails", r#"{"id": 2, "email": "bob@example.com"}"#).await;
        fix.push("p1.ingress.emails", r#"{"id": 1, "email": "alice@example.com"}"#).await;

        let outputs = fix.outputs(2).await;
        assert_eq!(outputs.len(), 2);
        let by_id = |id: i64| {
            outputs
                .iter()
                .find(|o| o["id"] == Value::from(id))
                .unwrap()
                .clone()
        };
        assert_eq!(by_id(2)["name"], Value::from("Bob"));
        assert_eq!(by_id(2)["email"], Value::from("bob@example.com"));
        assert_eq!(by_id(1)["name"], Value::from("Alice"));
        // id 3 never matched.
        assert!(outputs.iter().all(|o| o["id"] != Value::from(3)));
        fix.stop().await;
    }

    #[tokio::test]
    async fn right_entries_keep_serving_later_left_arrivals() {
        let fix = start(Duration::from_secs(2), Duration::from_secs(2)).await;
        fix.push("p1.ingress.users", r#"{"id": 1, "name": "Alice"}"#).await;
        fix.push("p1.ingress.users", r#"{"id": 2, "name": "Bob"}"#).await;
        fix.push("p1.ingress.emails", r#"{"id": 2, "email": "bob@example.com"}"#).await;
        fix.push("p1.ingress.emails", r#"{"id": 1, "email": "service@example.com"}"#).await;
        // Ensure the buffered right entry serves this late left arrival too.
        let _ = fix.outputs(2).await;
        fix.push("p1.ingress.users", r#"{"id": 1, "name": "Charlie"}"#).await;

        let outputs = fix.outputs(3).await;
        assert_eq!(outputs.len(), 3);
        let charlie = outputs
            .iter()
            .find(|o| o["name"] == Value::from("Charlie"))
            .unwrap();
        assert_eq!(charlie["email"], Value::from("service@example.com"));
        fix.stop().await;
    }

    #[tokio::test]
    async fn expired_entries_do_not_join() {
        let fix = start(Duration::from_millis(150), Duration::from_millis(150)).await;
        fix.push("p1.ingress.users", r#"{"id": 1, "name": "Alice"}"#).await;
        // Wait until the left entry is past its TTL (and evicted by ticks).
        tokio::time::sleep(Duration::from_millis(400)).await;
        fix.push("p1.ingress.emails", r#"{"id": 1, "email": "late@example.com"}"#).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fix.bus.message_count("p1.join.out").await, 0);
        fix.stop().await;
    }

    #[tokio::test]
    async fn record_without_join_key_is_dead_lettered() {
        let fix = start(Duration::from_secs(2), Duration::from_secs(2)).await;
        fix.push("p1.ingress.users", r#"{"name": "NoId"}"#).await;
        for _ in 0..100 {
            if fix.bus.message_count("p1.dlq").await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fix.bus.message_count("p1.dlq").await, 1);
        fix.stop().await;
    }
}
