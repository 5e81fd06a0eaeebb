//! Pipeline supervisor: startup validation, task spawning, two-phase stop.
//!
//! The whole definition is validated before any consumption begins: the
//! structural checks of the definition itself, expression compilation and
//! field-reference checks, join wiring, and the sink column mapping. Any
//! inconsistency signals `startup_failed` and aborts the start.
//!
//! Stop is a two-phase cooperative signal. Phase 1 cancels the ingestion
//! sources and leaves the downstream stages the grace period to drain the
//! durable subjects. Phase 2 cancels the remaining stages; the sink flushes
//! its pending batch on the way out. A phase-1 timeout escalates immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use setl_core::bus::{subjects, MessageBus};
use setl_core::capability::{Database, RecordConsumer, SchemaRegistryRemote};
use setl_core::definition::PipelineDefinition;
use setl_core::error::{Component, SignalReason, StartupError};
use setl_io::schema_cache::SchemaCache;

use crate::dlq::ErrorChannels;
use crate::filter::Filter;
use crate::ingestor::Ingestor;
use crate::join::JoinOperator;
use crate::mapping::SinkMapping;
use crate::sink::Sink;
use crate::transform::Transformer;

pub struct Pipeline {
    definition: PipelineDefinition,
    bus: Arc<dyn MessageBus>,
    db: Arc<dyn Database>,
    remote: Option<Arc<dyn SchemaRegistryRemote>>,
}

impl Pipeline {
    pub fn new(
        definition: PipelineDefinition,
        bus: Arc<dyn MessageBus>,
        db: Arc<dyn Database>,
        remote: Option<Arc<dyn SchemaRegistryRemote>>,
    ) -> Self {
        Self { definition, bus, db, remote }
    }

    /// Validate the definition, build every component, then start consuming.
    /// `consumers` supplies one consumer per configured topic, in topic
    /// order.
    pub async fn start(
        self,
        consumers: Vec<Box<dyn RecordConsumer>>,
    ) -> Result<RunningPipeline> {
        let channels = Arc::new(ErrorChannels::new(&self.definition.pipeline_id, self.bus.clone()));

        match self.build(consumers, Arc::clone(&channels)).await {
            Ok(running) => Ok(running),
            Err(e) => {
                // Best effort: the control plane learns why the worker never
                // came up, even though nothing was consumed.
                if let Err(signal_err) = channels
                    .signal(Component::Ingestor, SignalReason::StartupFailed, e.to_string())
                    .await
                {
                    warn!("startup failure signal could not be published: {signal_err}");
                }
                Err(e)
            }
        }
    }

    async fn build(
        self,
        consumers: Vec<Box<dyn RecordConsumer>>,
        channels: Arc<ErrorChannels>,
    ) -> Result<RunningPipeline> {
        let def = &self.definition;
        let pipeline_id = def.pipeline_id.clone();

        def.validate()?;
        if consumers.len() != def.ingestor.topics.len() {
            return Err(StartupError(format!(
                "{} consumer(s) supplied for {} topic(s)",
                consumers.len(),
                def.ingestor.topics.len()
            ))
            .into());
        }

        let cache = Arc::new(SchemaCache::from_definition(def, self.remote.clone()));

        // Each source chain terminates on the subject its last attached
        // stage publishes to.
        let mut chain_subjects: HashMap<String, String> = def
            .ingestor
            .topics
            .iter()
            .map(|t| (t.id.clone(), subjects::ingress(&pipeline_id, &t.id)))
            .collect();

        let transformer = match &def.transformation {
            Some(config) => {
                let input = chain_subjects
                    .get(&config.source_id)
                    .cloned()
                    .ok_or_else(|| StartupError(format!(
                        "transformation source {:?} has no subject",
                        config.source_id
                    )))?;
                let output = subjects::transform_out(&pipeline_id);
                let transformer = Transformer::new(
                    &pipeline_id,
                    config,
                    input,
                    output.clone(),
                    self.bus.clone(),
                    Arc::clone(&channels),
                )?;
                if let Some(version) = def.schema_versions.get(&config.source_id) {
                    transformer.check_field_refs(&version.fields)?;
                }
                chain_subjects.insert(config.source_id.clone(), output);
                Some(transformer)
            }
            None => None,
        };

        let filter = match &def.filter {
            Some(config) => {
                let input = chain_subjects
                    .get(&config.source_id)
                    .cloned()
                    .ok_or_else(|| StartupError(format!(
                        "filter source {:?} has no subject",
                        config.source_id
                    )))?;
                let output = subjects::filter_out(&pipeline_id);
                let filter = Filter::new(
                    &pipeline_id,
                    config,
                    input,
                    output.clone(),
                    self.bus.clone(),
                    Arc::clone(&channels),
                )?;
                if let Some(fields) = def.chain_fields(&config.source_id) {
                    filter.check_field_refs(&fields)?;
                }
                chain_subjects.insert(config.source_id.clone(), output);
                Some(filter)
            }
            None => None,
        };

        let join = match def.join.as_ref().filter(|j| j.enabled) {
            Some(config) => Some(JoinOperator::new(
                &pipeline_id,
                config,
                &chain_subjects,
                self.bus.clone(),
                Arc::clone(&channels),
            )?),
            None => None,
        };

        let sink_input = if join.is_some() {
            subjects::join_out(&pipeline_id)
        } else {
            chain_subjects
                .get(&def.sink.source_id)
                .cloned()
                .ok_or_else(|| StartupError(format!(
                    "sink source {:?} has no subject",
                    def.sink.source_id
                )))?
        };
        let sink_fields = def.sink_fields().ok_or_else(|| {
            StartupError("sink input fields are not declared; the mapping cannot be checked".into())
        })?;
        let mapping = SinkMapping::build(&def.sink, &sink_fields)?;
        let sink = Sink::new(
            &pipeline_id,
            def.sink.clone(),
            mapping,
            sink_input,
            self.bus.clone(),
            self.db.clone(),
            Arc::clone(&channels),
        );

        // Everything validated and built; only now do the tasks start.
        let source_cancel = CancellationToken::new();
        let downstream_cancel = CancellationToken::new();

        let mut ingest_tasks = JoinSet::new();
        for (topic, consumer) in def.ingestor.topics.iter().cloned().zip(consumers) {
            let ingestor = Arc::new(Ingestor::new(
                &pipeline_id,
                topic,
                Arc::clone(&cache),
                self.bus.clone(),
                Arc::clone(&channels),
            ));
            ingest_tasks.spawn(ingestor.run(consumer, source_cancel.child_token()));
        }

        let mut stage_tasks = JoinSet::new();
        if let Some(transformer) = transformer {
            let token = downstream_cancel.child_token();
            stage_tasks.spawn(async move { transformer.run(token).await });
        }
        if let Some(filter) = filter {
            let token = downstream_cancel.child_token();
            stage_tasks.spawn(async move { filter.run(token).await });
        }
        if let Some(join) = join {
            let token = downstream_cancel.child_token();
            stage_tasks.spawn(async move { join.run(token).await });
        }
        {
            let token = downstream_cancel.child_token();
            stage_tasks.spawn(async move { sink.run(token).await });
        }

        info!("pipeline [{pipeline_id}]: started");
        Ok(RunningPipeline {
            pipeline_id,
            channels,
            source_cancel,
            downstream_cancel,
            ingest_tasks,
            stage_tasks,
        })
    }
}

pub struct RunningPipeline {
    pipeline_id: String,
    channels: Arc<ErrorChannels>,
    source_cancel: CancellationToken,
    downstream_cancel: CancellationToken,
    ingest_tasks: JoinSet<Result<()>>,
    stage_tasks: JoinSet<Result<()>>,
}

impl RunningPipeline {
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Resolve when any component task fails. Components only return early
    /// with an error (unrecoverable infrastructure failure or a fatal sink
    /// condition), so this is the supervisor's cue to stop the pipeline.
    pub async fn failed(&mut self) -> anyhow::Error {
        loop {
            let joined = tokio::select! {
                joined = self.ingest_tasks.join_next(), if !self.ingest_tasks.is_empty() => joined,
                joined = self.stage_tasks.join_next(), if !self.stage_tasks.is_empty() => joined,
                // Every task already finished cleanly; nothing can fail.
                else => std::future::pending().await,
            };
            match joined {
                Some(Ok(Ok(()))) | None => continue,
                Some(Ok(Err(e))) => return e,
                Some(Err(join_err)) => return anyhow!("component task panicked: {join_err}"),
            }
        }
    }

    /// Two-phase cooperative stop. Phase 1 quiesces ingestion and leaves the
    /// downstream stages `grace` to drain; phase 2 cancels the rest and
    /// flushes the sink.
    pub async fn stop(mut self, grace: Duration) -> Result<()> {
        info!("pipeline [{}]: stopping (grace {grace:?})", self.pipeline_id);
        self.source_cancel.cancel();

        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = self.ingest_tasks.join_next().await {
                if let Err(e) = joined.context("ingest task panicked")? {
                    warn!("pipeline [{}]: ingestor failed during stop: {e}", self.pipeline_id);
                }
            }
            Ok::<_, anyhow::Error>(())
        })
        .await;

        match drained {
            Ok(result) => {
                result?;
                // Sources are quiet; give downstream the rest of the grace
                // period to work through the durable subjects.
                tokio::time::sleep(grace).await;
            }
            Err(_) => {
                warn!(
                    "pipeline [{}]: ingestion did not stop within {grace:?}, escalating",
                    self.pipeline_id
                );
                self.ingest_tasks.abort_all();
            }
        }

        self.downstream_cancel.cancel();
        let mut first_error = None;
        while let Some(joined) = self.stage_tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("pipeline [{}]: stage failed during stop: {e}", self.pipeline_id);
                    first_error.get_or_insert(e);
                }
                Err(join_err) => {
                    first_error.get_or_insert(anyhow!("stage task panicked: {join_err}"));
                }
            }
        }

        if let Err(e) = self
            .channels
            .signal(Component::Ingestor, SignalReason::Stopped, "pipeline stopped")
            .await
        {
            warn!("pipeline [{}]: stop signal could not be published: {e}", self.pipeline_id);
        }
        info!("pipeline [{}]: stopped", self.pipeline_id);

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
