//! Per-record expression transformation.
//!
//! Reads the ingress subject of its source, evaluates one expression per
//! declared output field, and republishes the resulting object on the
//! transform subject under the new declared schema version. A type mismatch
//! between an expression result and the declared field type dead-letters the
//! record.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use setl_core::bus::{Delivery, Headers, MessageBus};
use setl_core::definition::TransformationConfig;
use setl_core::error::{Component, ErrorKind, StartupError};
use setl_core::schema::{Field, FieldType};

use crate::dlq::ErrorChannels;
use crate::expr::Program;
use crate::retry::bus_retry;

pub struct Transformer {
    pipeline_id: String,
    version_id: u32,
    fields: Vec<CompiledField>,
    input_subject: String,
    output_subject: String,
    bus: Arc<dyn MessageBus>,
    channels: Arc<ErrorChannels>,
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("pipeline_id", &self.pipeline_id)
            .field("version_id", &self.version_id)
            .field("fields", &self.fields)
            .field("input_subject", &self.input_subject)
            .field("output_subject", &self.output_subject)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct CompiledField {
    name: String,
    field_type: FieldType,
    program: Program,
}

impl Transformer {
    /// Compile the configured expressions. Parse failures are configuration
    /// errors and abort startup.
    pub fn new(
        pipeline_id: &str,
        config: &TransformationConfig,
        input_subject: String,
        output_subject: String,
        bus: Arc<dyn MessageBus>,
        channels: Arc<ErrorChannels>,
    ) -> Result<Self, StartupError> {
        let mut fields = Vec::with_capacity(config.fields.len());
        for field in &config.fields {
            let program = Program::compile(&field.expression).map_err(|e| {
                StartupError(format!(
                    "transformation field {:?} expression does not compile: {e}",
                    field.name
                ))
            })?;
            fields.push(CompiledField {
                name: field.name.clone(),
                field_type: field.field_type,
                program,
            });
        }
        Ok(Self {
            pipeline_id: pipeline_id.to_string(),
            version_id: config.version_id,
            fields,
            input_subject,
            output_subject,
            bus,
            channels,
        })
    }

    /// Check every referenced field against the declared input schema.
    pub fn check_field_refs(&self, available: &[Field]) -> Result<(), StartupError> {
        for field in &self.fields {
            for referenced in field.program.field_refs() {
                if !available.iter().any(|f| f.name == referenced) {
                    return Err(StartupError(format!(
                        "transformation field {:?} references unknown field {referenced:?}",
                        field.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut sub = self
            .bus
            .subscribe(&self.input_subject, "transformer")
            .await
            .context("subscribing transformer input")?;
        info!(
            "transformer [{}]: {} -> {}",
            self.pipeline_id, self.input_subject, self.output_subject
        );

        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("transformer [{}]: stopped", self.pipeline_id);
                    return Ok(());
                }
                next = sub.next() => match next.context("transformer input")? {
                    Some(delivery) => delivery,
                    None => return Ok(()),
                },
            };

            self.process(&delivery, &cancel).await?;
            sub.ack(delivery.delivery_id)
                .await
                .context("acking transformer input")?;
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

        let mut output = Map::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = match field.program.eval(&record) {
                Ok(value) => value,
                Err(e) => {
                    return self
                        .dead_letter(
                            delivery,
                            format!("expression for {:?} failed: {e}", field.name),
                        )
                        .await
                }
            };
            if !field.field_type.accepts(&value) {
                return self
                    .dead_letter(
                        delivery,
                        format!(
                            "expression for {:?} produced {value}, declared type is {}",
                            field.name, field.field_type
                        ),
                    )
                    .await;
            }
            output.insert(field.name.clone(), value);
        }

        let headers = Headers {
            schema_version_id: Some(self.version_id),
            dedup_key: delivery.headers.dedup_key.clone(),
            kafka_msg_id: delivery.headers.kafka_msg_id.clone(),
        };
        let payload = serde_json::to_vec(&Value::Object(output))
            .context("serializing transformed record")?;
        bus_retry("transformer", cancel, || {
            self.bus
                .publish(&self.output_subject, headers.clone(), payload.clone())
        })
        .await?;
        debug!("transformer [{}]: republished one record", self.pipeline_id);
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, message: String) -> Result<()> {
        self.channels
            .dlq(
                Component::Transformer,
                ErrorKind::TransformError,
                message,
                delivery.payload.clone(),
            )
            .await
            .context("writing transformer DLQ entry")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use setl_core::definition::{TransformField, TransformationConfig};
    use setl_core::error::DlqEntry;
    use setl_io::bus_memory::MemoryBus;

    use super::*;

    fn config() -> TransformationConfig {
        TransformationConfig {
            source_id: "orders".into(),
            version_id: 2,
            fields: vec![
                TransformField {
                    name: "order_id".into(),
                    field_type: FieldType::String,
                    expression: "string(id)".into(),
                },
                TransformField {
                    name: "total_cents".into(),
                    field_type: FieldType::Int64,
                    expression: "round(total * 100)".into(),
                },
            ],
        }
    }

    fn transformer(bus: Arc<MemoryBus>) -> Transformer {
        let channels = Arc::new(ErrorChannels::new("p1", bus.clone()));
        Transformer::new(
            "p1",
            &config(),
            "p1.ingress.orders".into(),
            "p1.transform.out".into(),
            bus,
            channels,
        )
        .unwrap()
    }

    async fn run_one(bus: Arc<MemoryBus>, payload: &str) {
        let t = transformer(bus.clone());
        bus.publish(
            "p1.ingress.orders",
            Headers::with_version(1),
            payload.as_bytes().to_vec(),
        )
        .await
        .unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(async move { t.run(cancel.clone()).await });
        for _ in 0..200 {
            if bus.message_count("p1.transform.out").await + bus.message_count("p1.dlq").await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();
    }

    #[tokio::test]
    async fn evaluates_and_republishes_under_new_version() {
        let bus = Arc::new(MemoryBus::default());
        run_one(bus.clone(), r#"{"id": 7, "total": 12.5}"#).await;

        let out = bus.published("p1.transform.out").await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.schema_version_id, Some(2));
        let record: Value = serde_json::from_slice(&out[0].1).unwrap();
        assert_eq!(record["order_id"], Value::String("7".into()));
        assert_eq!(record["total_cents"], Value::from(1250));
    }

    #[tokio::test]
    async fn type_mismatch_is_dead_lettered() {
        let bus = Arc::new(MemoryBus::default());
        // `total` is a string, so round() fails and the record dead-letters.
        run_one(bus.clone(), r#"{"id": 7, "total": "oops"}"#).await;

        assert_eq!(bus.message_count("p1.transform.out").await, 0);
        let dlq = bus.published("p1.dlq").await;
        assert_eq!(dlq.len(), 1);
        let entry: DlqEntry = serde_json::from_slice(&dlq[0].1).unwrap();
        assert_eq!(entry.error_kind, ErrorKind::TransformError);
        assert_eq!(entry.component, Component::Transformer);
    }

    #[test]
    fn unknown_field_reference_fails_startup_check() {
        let bus = Arc::new(MemoryBus::default());
        let t = transformer(bus);
        let declared = vec![Field::new("id", FieldType::Int64)];
        let err = t.check_field_refs(&declared).unwrap_err();
        assert!(err.0.contains("unknown field \"total\""));
    }

    #[test]
    fn bad_expression_fails_construction() {
        let bus: Arc<MemoryBus> = Arc::new(MemoryBus::default());
        let channels = Arc::new(ErrorChannels::new("p1", bus.clone()));
        let mut cfg = config();
        cfg.fields[0].expression = "string(".into();
        let err = Transformer::new(
            "p1",
            &cfg,
            "in".into(),
            "out".into(),
            bus,
            channels,
        )
        .unwrap_err();
        assert!(err.0.contains("does not compile"));
    }
}
