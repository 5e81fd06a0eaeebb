//! Batching database sink.
//!
//! Consumes the terminal subject, maps records to destination rows, and
//! accumulates them per destination table until either the batch size or the
//! batch age bound is hit. A batch is one bulk insert; the contributing
//! upstream messages are acked together only after the database confirmed it.
//!
//! Transient insert failures retry on a bounded exponential backoff. When the
//! schedule is exhausted every row of the batch is dead-lettered individually
//! and the batch is acked, isolating poison batches without stalling the
//! pipeline. A fatal failure signals the control plane and stops the
//! pipeline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use setl_core::backoff::Backoff;
use setl_core::bus::{MessageBus, Subscription};
use setl_core::capability::{Database, DbError};
use setl_core::definition::SinkConfig;
use setl_core::error::{Component, ErrorKind, SignalReason};

use crate::dlq::ErrorChannels;
use crate::mapping::SinkMapping;

const INSERT_RETRY_BASE: Duration = Duration::from_millis(200);
const INSERT_RETRY_MAX: Duration = Duration::from_secs(10);

pub struct Sink {
    pipeline_id: String,
    config: SinkConfig,
    mapping: SinkMapping,
    columns: Vec<String>,
    input_subject: String,
    bus: Arc<dyn MessageBus>,
    db: Arc<dyn Database>,
    channels: Arc<ErrorChannels>,
}

/// One pending row and the delivery that produced it.
struct PendingRow {
    delivery_id: u64,
    row: Vec<Value>,
    original: Vec<u8>,
}

impl Sink {
    pub fn new(
        pipeline_id: &str,
        config: SinkConfig,
        mapping: SinkMapping,
        input_subject: String,
        bus: Arc<dyn MessageBus>,
        db: Arc<dyn Database>,
        channels: Arc<ErrorChannels>,
    ) -> Self {
        let columns = mapping.insert_columns();
        Self {
            pipeline_id: pipeline_id.to_string(),
            config,
            mapping,
            columns,
            input_subject,
            bus,
            db,
            channels,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut sub = self
            .bus
            .subscribe(&self.input_subject, "sink")
            .await
            .context("subscribing sink input")?;
        info!(
            "sink [{}]: {} -> table {:?} (batch <= {}, age <= {:?})",
            self.pipeline_id,
            self.input_subject,
            self.config.table,
            self.config.max_batch_size,
            self.config.max_batch_age
        );

        let mut batch: Vec<PendingRow> = Vec::with_capacity(self.config.max_batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            let age_deadline = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Shutdown flushes whatever is pending.
                    if !batch.is_empty() {
                        self.flush(&mut sub, &mut batch).await?;
                    }
                    info!("sink [{}]: stopped", self.pipeline_id);
                    return Ok(());
                }
                next = sub.next() => {
                    let delivery = match next.context("sink input")? {
                        Some(delivery) => delivery,
                        None => {
                            if !batch.is_empty() {
                                self.flush(&mut sub, &mut batch).await?;
                            }
                            return Ok(());
                        }
                    };

                    let record: Map<String, Value> =
                        match serde_json::from_slice(&delivery.payload) {
                            Ok(Value::Object(object)) => object,
                            _ => {
                                self.channels
                                    .dlq(
                                        Component::Sink,
                                        ErrorKind::MappingError,
                                        "record is not a JSON object",
                                        delivery.payload.clone(),
                                    )
                                    .await
                                    .context("writing sink DLQ entry")?;
                                sub.ack(delivery.delivery_id).await.context("acking sink input")?;
                                continue;
                            }
                        };

                    match self.mapping.row_for(&record) {
                        Ok(row) => {
                            if batch.is_empty() {
                                deadline = Some(Instant::now() + self.config.max_batch_age);
                            }
                            batch.push(PendingRow {
                                delivery_id: delivery.delivery_id,
                                row,
                                original: delivery.payload,
                            });
                            if batch.len() >= self.config.max_batch_size {
                                self.flush(&mut sub, &mut batch).await?;
                                deadline = None;
                            }
                        }
                        Err(e) => {
                            self.channels
                                .dlq(
                                    Component::Sink,
                                    ErrorKind::MappingError,
                                    e.to_string(),
                                    delivery.payload.clone(),
                                )
                                .await
                                .context("writing sink DLQ entry")?;
                            sub.ack(delivery.delivery_id).await.context("acking sink input")?;
                        }
                    }
                }
                _ = tokio::time::sleep_until(age_deadline), if deadline.is_some() => {
                    if !batch.is_empty() {
                        self.flush(&mut sub, &mut batch).await?;
                    }
                    deadline = None;
                }
            }
        }
    }

    /// Issue one bulk insert for the batch. Acks follow the confirmed insert;
    /// rows of an uninsertable batch are dead-lettered individually and acked
    /// so the pipeline keeps making progress.
    async fn flush(
        &self,
        sub: &mut Box<dyn Subscription>,
        batch: &mut Vec<PendingRow>,
    ) -> Result<()> {
        let pending = std::mem::take(batch);
        let rows: Vec<Vec<Value>> = pending.iter().map(|p| p.row.clone()).collect();
        debug!(
            "sink [{}]: flushing {} row(s) into {:?}",
            self.pipeline_id,
            rows.len(),
            self.config.table
        );

        let mut backoff = Backoff::new(INSERT_RETRY_BASE, INSERT_RETRY_MAX, self.config.max_attempts);
        loop {
            match self
                .db
                .insert_batch(&self.config.table, &self.columns, rows.clone())
                .await
            {
                Ok(()) => {
                    for row in &pending {
                        sub.ack(row.delivery_id).await.context("acking sink batch")?;
                    }
                    metrics::counter!(
                        "setl_sink_inserted_total",
                        pending.len() as u64,
                        "table" => self.config.table.clone()
                    );
                    return Ok(());
                }
                Err(DbError::Transient(message)) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "sink [{}]: transient insert failure ({message}), retrying in {delay:?}",
                            self.pipeline_id
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        // Poison-pill isolation: each row is dead-lettered on
                        // its own and the batch is acked.
                        warn!(
                            "sink [{}]: insert retries exhausted, dead-lettering {} row(s)",
                            self.pipeline_id,
                            pending.len()
                        );
                        for row in &pending {
                            self.channels
                                .dlq(
                                    Component::Sink,
                                    ErrorKind::SinkInsertFailed,
                                    format!("insert failed after {} attempts: {message}", backoff.attempts_made()),
                                    row.original.clone(),
                                )
                                .await
                                .context("writing sink DLQ entry")?;
                            sub.ack(row.delivery_id).await.context("acking sink batch")?;
                        }
                        return Ok(());
                    }
                },
                Err(DbError::Fatal(message)) => {
                    self.channels
                        .signal(
                            Component::Sink,
                            SignalReason::SinkFatal,
                            format!("fatal insert failure on {:?}: {message}", self.config.table),
                        )
                        .await
                        .context("signalling sink_fatal")?;
                    bail!("fatal database failure: {message}");
                }
            }
        }
    }
}
