//! Predicate filter.
//!
//! Evaluates a boolean expression per record; forwards on true, drops on
//! false. Dropped records are deliberate and counted, not dead-lettered; an
//! evaluation error is.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use setl_core::bus::{Delivery, MessageBus};
use setl_core::definition::FilterConfig;
use setl_core::error::{Component, ErrorKind, StartupError};
use setl_core::schema::Field;

use crate::dlq::ErrorChannels;
use crate::expr::Program;
use crate::retry::bus_retry;

pub struct Filter {
    pipeline_id: String,
    program: Program,
    input_subject: String,
    output_subject: String,
    bus: Arc<dyn MessageBus>,
    channels: Arc<ErrorChannels>,
}

impl Filter {
    pub fn new(
        pipeline_id: &str,
        config: &FilterConfig,
        input_subject: String,
        output_subject: String,
        bus: Arc<dyn MessageBus>,
        channels: Arc<ErrorChannels>,
    ) -> Result<Self, StartupError> {
        let program = Program::compile(&config.expression)
            .map_err(|e| StartupError(format!("filter expression does not compile: {e}")))?;
        Ok(Self {
            pipeline_id: pipeline_id.to_string(),
            program,
            input_subject,
            output_subject,
            bus,
            channels,
        })
    }

    /// Check every referenced field against the declared input schema.
    /// Presence checks are exempt: `has(x)` on an undeclared field is the
    /// point of the function.
    pub fn check_field_refs(&self, available: &[Field]) -> Result<(), StartupError> {
        for referenced in self.program.field_refs() {
            if !available.iter().any(|f| f.name == referenced) {
                return Err(StartupError(format!(
                    "filter references unknown field {referenced:?}"
                )));
            }
        }
        Ok(())
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut sub = self
            .bus
            .subscribe(&self.input_subject, "filter")
            .await
            .context("subscribing filter input")?;
        info!(
            "filter [{}]: {} -> {} ({})",
            self.pipeline_id,
            self.input_subject,
            self.output_subject,
            self.program.text()
        );

        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("filter [{}]: stopped", self.pipeline_id);
                    return Ok(());
                }
                next = sub.next() => match next.context("filter input")? {
                    Some(delivery) => delivery,
                    None => return Ok(()),
                },
            };

            self.process(&delivery, &cancel).await?;
            sub.ack(delivery.delivery_id).await.context("acking filter input")?;
        }
    }

    async fn process(&self, delivery: &Delivery, cancel: &CancellationToken) -> Result<()> {
        let record: Map<String, Value> = match serde_json::from_slice(&delivery.payload) {
            Ok(Value::Object(object)) => object,
            _ => {
                return self
                    .dead_letter(delivery, "record is not a JSON object".to_string())
                    .await
            }
        };

        match self.program.eval_predicate(&record) {
            Ok(true) => {
                bus_retry("filter", cancel, || {
                    self.bus.publish(
                        &self.output_subject,
                        delivery.headers.clone(),
                        delivery.payload.clone(),
                    )
                })
                .await?;
            }
            Ok(false) => {
                debug!("filter [{}]: dropped one record", self.pipeline_id);
                metrics::increment_counter!("setl_filtered_total");
            }
            Err(e) => {
                return self
                    .dead_letter(delivery, format!("predicate failed: {e}"))
                    .await
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, message: String) -> Result<()> {
        self.channels
            .dlq(
                Component::Filter,
                ErrorKind::FilterError,
                message,
                delivery.payload.clone(),
            )
            .await
            .context("writing filter DLQ entry")
    }
}
