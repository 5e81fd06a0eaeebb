//! Publishers for the two well-known error channels of a pipeline.
//!
//! Every component records per-record failures on the DLQ subject and
//! per-pipeline conditions on the signal subject; the control plane is the
//! sole consumer of both.

use std::sync::Arc;

use tracing::{error, warn};

use setl_core::bus::{subjects, BusError, Headers, MessageBus};
use setl_core::error::{Component, DlqEntry, ErrorKind, SignalEntry, SignalReason};

pub struct ErrorChannels {
    pipeline_id: String,
    bus: Arc<dyn MessageBus>,
    dlq_subject: String,
    signal_subject: String,
}

impl ErrorChannels {
    pub fn new(pipeline_id: &str, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            dlq_subject: subjects::dlq(pipeline_id),
            signal_subject: subjects::signal(pipeline_id),
            bus,
        }
    }

    /// Record one failed message. The caller acks upstream afterwards, so a
    /// DLQ write is the accounted disposition of the record.
    pub async fn dlq(
        &self,
        component: Component,
        error_kind: ErrorKind,
        error_message: impl Into<String>,
        original_message: Vec<u8>,
    ) -> Result<(), BusError> {
        let entry = DlqEntry::new(
            &self.pipeline_id,
            component,
            error_kind,
            error_message,
            original_message,
        );
        warn!(
            "{} [{}]: {} -> dlq",
            component, self.pipeline_id, entry.error_message
        );
        let payload = serde_json::to_vec(&entry)
            .map_err(|e| BusError::Unavailable(format!("dlq entry does not serialize: {e}")))?;
        self.bus
            .publish(&self.dlq_subject, Headers::default(), payload)
            .await?;
        metrics::increment_counter!("setl_dlq_total", "component" => component.to_string());
        Ok(())
    }

    /// Record one per-pipeline operational condition.
    pub async fn signal(
        &self,
        component: Component,
        reason: SignalReason,
        text: impl Into<String>,
    ) -> Result<(), BusError> {
        let entry = SignalEntry::new(&self.pipeline_id, component, reason, text);
        error!("{} [{}]: signal {:?}: {}", component, self.pipeline_id, reason, entry.text);
        let payload = serde_json::to_vec(&entry)
            .map_err(|e| BusError::Unavailable(format!("signal entry does not serialize: {e}")))?;
        self.bus
            .publish(&self.signal_subject, Headers::default(), payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use setl_io::bus_memory::MemoryBus;

    use super::*;

    #[tokio::test]
    async fn dlq_and_signal_land_on_their_subjects() {
        let bus = Arc::new(MemoryBus::default());
        let channels = ErrorChannels::new("p1", bus.clone());

        channels
            .dlq(
                Component::Ingestor,
                ErrorKind::SchemaValidation,
                "missing field",
                b"{}".to_vec(),
            )
            .await
            .unwrap();
        channels
            .signal(Component::Sink, SignalReason::SinkFatal, "schema drift at destination")
            .await
            .unwrap();

        let dlq = bus.published("p1.dlq").await;
        assert_eq!(dlq.len(), 1);
        let entry: DlqEntry = serde_json::from_slice(&dlq[0].1).unwrap();
        assert_eq!(entry.error_kind, ErrorKind::SchemaValidation);
        assert_eq!(entry.original_message, b"{}");

        let signals = bus.published("p1.signal").await;
        assert_eq!(signals.len(), 1);
        let entry: SignalEntry = serde_json::from_slice(&signals[0].1).unwrap();
        assert_eq!(entry.reason, SignalReason::SinkFatal);
    }
}
