//! Pipeline definition: the structured object the runtime receives from the
//! control plane, usually as a YAML document.
//!
//! The definition is validated once at startup; any inconsistency fails with
//! a [`StartupError`] before any consumption begins. A definition change is
//! applied by a controlled stop/start, never by mutating a running pipeline.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StartupError;
use crate::schema::{DataFormat, Field, FieldType, SchemaConfigType, SchemaVersion};

/// Complete definition of one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub pipeline_id: String,
    pub ingestor: IngestorConfig,
    #[serde(default)]
    pub transformation: Option<TransformationConfig>,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    #[serde(default)]
    pub join: Option<JoinConfig>,
    pub sink: SinkConfig,
    /// Latest declared schema version per source id. Mandatory for internal
    /// sources; optional seed for external ones (later versions arrive via
    /// the wire envelope).
    pub schema_versions: HashMap<String, SchemaVersionConfig>,
    /// Remote registry connection, required when any topic uses an external
    /// schema.
    #[serde(default)]
    pub schema_registry: Option<SchemaRegistryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestorConfig {
    pub kafka_connection: KafkaConnectionConfig,
    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConnectionConfig {
    /// Comma-separated list of broker addresses.
    pub brokers: String,
    /// Extra driver options passed through verbatim.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Kafka topic name.
    pub name: String,
    /// Source id, used in subject names and as the `schema_versions` key.
    pub id: String,
    pub consumer_group: String,
    pub partitions: usize,
    #[serde(default = "default_schema_type")]
    pub schema_type: SchemaConfigType,
    #[serde(default = "default_data_format")]
    pub data_format: DataFormat,
    #[serde(default)]
    pub deduplication: Option<DeduplicationConfig>,
}

impl TopicConfig {
    pub fn dedup_enabled(&self) -> bool {
        self.deduplication.as_ref().map(|d| d.enabled).unwrap_or(false)
    }
}

fn default_schema_type() -> SchemaConfigType {
    SchemaConfigType::Internal
}

fn default_data_format() -> DataFormat {
    DataFormat::Json
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicationConfig {
    pub enabled: bool,
    /// Record field the dedup key is derived from.
    pub id_field: String,
    /// Type the field value is coerced to before hashing.
    pub id_field_type: FieldType,
    /// Wall-clock window within which repeats are dropped.
    #[serde(with = "humantime_serde")]
    pub time_window: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRegistryConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Declared schema version, keyed by source id in the definition. The full
/// [`SchemaVersion`] identity is materialised with the pipeline id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaVersionConfig {
    pub version_id: u32,
    pub fields: Vec<Field>,
}

/// Per-field expression transformation, republishing under a new declared
/// schema version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformationConfig {
    /// Source chain this transformer is attached to.
    pub source_id: String,
    /// Schema version id attached to the transformer's output records.
    pub version_id: u32,
    /// Ordered output fields, each produced by one expression.
    pub fields: Vec<TransformField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub expression: String,
}

/// Boolean predicate; records evaluating false are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Source chain this filter is attached to.
    pub source_id: String,
    pub expression: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    #[default]
    Temporal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinSide {
    Left,
    Right,
}

impl JoinSide {
    pub fn other(self) -> JoinSide {
        match self {
            JoinSide::Left => JoinSide::Right,
            JoinSide::Right => JoinSide::Left,
        }
    }
}

impl std::fmt::Display for JoinSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinSide::Left => f.write_str("left"),
            JoinSide::Right => f.write_str("right"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    pub enabled: bool,
    #[serde(rename = "type", default)]
    pub join_type: JoinType,
    /// Exactly one left and one right source.
    pub sources: Vec<JoinSourceConfig>,
    /// Fields selected into the combined output record.
    pub projection: Vec<JoinProjection>,
}

impl JoinConfig {
    pub fn side(&self, side: JoinSide) -> Option<&JoinSourceConfig> {
        self.sources.iter().find(|s| s.orientation == side)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSourceConfig {
    pub source_id: String,
    /// Record field joined on.
    pub join_key: String,
    /// Buffer TTL for this side.
    #[serde(with = "humantime_serde")]
    pub time_window: Duration,
    pub orientation: JoinSide,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinProjection {
    pub source_id: String,
    /// Field name in the side's record.
    pub source_name: String,
    /// Field name in the combined output record.
    pub output_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Destination driver type, resolved by the host process.
    #[serde(rename = "type")]
    pub sink_type: String,
    /// Stream feeding the sink when no join is configured.
    pub source_id: String,
    /// Destination table.
    pub table: String,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_age", with = "humantime_serde")]
    pub max_batch_age: Duration,
    /// Bounded attempt count for transient insert failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub mapping: Vec<ColumnMapping>,
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_max_batch_age() -> Duration {
    Duration::from_secs(1)
}

fn default_max_attempts() -> u32 {
    5
}

/// Closed set of destination column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Bool,
    Datetime,
    Json,
}

/// Destination column: mapped to a source field, database-defaulted, or
/// nullable. Anything else is a configuration-time error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub column: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub source_field: Option<String>,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub has_default: bool,
}

impl PipelineDefinition {
    pub fn from_yaml(text: &str) -> Result<Self, StartupError> {
        serde_yaml::from_str(text)
            .map_err(|e| StartupError(format!("definition does not parse: {e}")))
    }

    pub fn topic(&self, source_id: &str) -> Option<&TopicConfig> {
        self.ingestor.topics.iter().find(|t| t.id == source_id)
    }

    /// Materialise the declared latest version for `source_id` with its full
    /// identity.
    pub fn schema_version(&self, source_id: &str) -> Option<SchemaVersion> {
        self.schema_versions.get(source_id).map(|cfg| SchemaVersion {
            pipeline_id: self.pipeline_id.clone(),
            source_id: source_id.to_string(),
            version_id: cfg.version_id,
            fields: cfg.fields.clone(),
        })
    }

    /// Fields visible on one source's chain right before the join or sink:
    /// the transformer's declared output if one is attached, otherwise the
    /// declared schema fields.
    pub fn chain_fields(&self, source_id: &str) -> Option<Vec<Field>> {
        if let Some(t) = &self.transformation {
            if t.source_id == source_id {
                return Some(
                    t.fields
                        .iter()
                        .map(|f| Field::new(f.name.clone(), f.field_type))
                        .collect(),
                );
            }
        }
        self.schema_versions
            .get(source_id)
            .map(|cfg| cfg.fields.clone())
    }

    /// Fields visible to the sink: join projection outputs when a join is
    /// configured, the terminal chain fields otherwise.
    pub fn sink_fields(&self) -> Option<Vec<Field>> {
        if let Some(join) = self.join.as_ref().filter(|j| j.enabled) {
            let mut fields = Vec::with_capacity(join.projection.len());
            for p in &join.projection {
                let side = self.chain_fields(&p.source_id)?;
                let declared = side.iter().find(|f| f.name == p.source_name)?;
                fields.push(Field::new(p.output_name.clone(), declared.field_type));
            }
            return Some(fields);
        }
        self.chain_fields(&self.sink.source_id)
    }

    /// Structural validation: referenced sources exist, schemas are declared
    /// where required, the join is two-sided, dedup fields are declared.
    ///
    /// Expression parsing and column-mapping checks need the operator crates
    /// and run in the supervisor, also before any consumption begins.
    pub fn validate(&self) -> Result<(), StartupError> {
        let mut problems = Vec::new();

        if self.pipeline_id.is_empty() {
            problems.push("pipeline_id is empty".to_string());
        }
        if self.ingestor.topics.is_empty() {
            problems.push("ingestor has no topics".to_string());
        }

        let mut seen = HashSet::new();
        for topic in &self.ingestor.topics {
            if !seen.insert(topic.id.as_str()) {
                problems.push(format!("duplicate source id {:?}", topic.id));
            }
            if topic.partitions == 0 {
                problems.push(format!("topic {:?} declares zero partitions", topic.name));
            }
            if topic.schema_type == SchemaConfigType::Internal
                && !self.schema_versions.contains_key(&topic.id)
            {
                problems.push(format!(
                    "internal source {:?} has no declared schema version",
                    topic.id
                ));
            }
            if topic.schema_type == SchemaConfigType::External && self.schema_registry.is_none() {
                problems.push(format!(
                    "external source {:?} requires a schema_registry connection",
                    topic.id
                ));
            }
            if let Some(dedup) = topic.deduplication.as_ref().filter(|d| d.enabled) {
                if dedup.id_field.is_empty() {
                    problems.push(format!("topic {:?} dedup id_field is empty", topic.name));
                } else if let Some(version) = self.schema_versions.get(&topic.id) {
                    match version.fields.iter().find(|f| f.name == dedup.id_field) {
                        None => problems.push(format!(
                            "dedup id_field {:?} is not declared by source {:?}",
                            dedup.id_field, topic.id
                        )),
                        Some(f) if f.field_type != dedup.id_field_type => problems.push(format!(
                            "dedup id_field {:?} is declared {} but configured {}",
                            dedup.id_field, f.field_type, dedup.id_field_type
                        )),
                        Some(_) => {}
                    }
                }
                if dedup.time_window.is_zero() {
                    problems.push(format!("topic {:?} dedup window is zero", topic.name));
                }
            }
        }

        if let Some(t) = &self.transformation {
            if self.topic(&t.source_id).is_none() {
                problems.push(format!(
                    "transformation references unknown source {:?}",
                    t.source_id
                ));
            }
            if t.fields.is_empty() {
                problems.push("transformation declares no output fields".to_string());
            }
            let mut names = HashSet::new();
            for f in &t.fields {
                if !names.insert(f.name.as_str()) {
                    problems.push(format!("transformation output field {:?} is duplicated", f.name));
                }
            }
        }

        if let Some(f) = &self.filter {
            if self.topic(&f.source_id).is_none() {
                problems.push(format!("filter references unknown source {:?}", f.source_id));
            }
        }

        if let Some(join) = self.join.as_ref().filter(|j| j.enabled) {
            if join.sources.len() != 2 {
                problems.push(format!(
                    "temporal join needs exactly two sources, got {}",
                    join.sources.len()
                ));
            }
            if join.side(JoinSide::Left).is_none() || join.side(JoinSide::Right).is_none() {
                problems.push("temporal join needs one left and one right source".to_string());
            }
            for source in &join.sources {
                if self.topic(&source.source_id).is_none() {
                    problems.push(format!(
                        "join references unknown source {:?}",
                        source.source_id
                    ));
                }
                if source.time_window.is_zero() {
                    problems.push(format!(
                        "join source {:?} has a zero time window",
                        source.source_id
                    ));
                }
                if let Some(fields) = self.chain_fields(&source.source_id) {
                    if !fields.iter().any(|f| f.name == source.join_key) {
                        problems.push(format!(
                            "join key {:?} is not a field of source {:?}",
                            source.join_key, source.source_id
                        ));
                    }
                }
            }
            if join.projection.is_empty() {
                problems.push("join projection is empty".to_string());
            }
            let mut outputs = HashSet::new();
            for p in &join.projection {
                if !join.sources.iter().any(|s| s.source_id == p.source_id) {
                    problems.push(format!(
                        "projection references source {:?} which is not a join input",
                        p.source_id
                    ));
                }
                if !outputs.insert(p.output_name.as_str()) {
                    problems.push(format!(
                        "projection output {:?} is duplicated",
                        p.output_name
                    ));
                }
                if let Some(fields) = self.chain_fields(&p.source_id) {
                    if !fields.iter().any(|f| f.name == p.source_name) {
                        problems.push(format!(
                            "projection field {:?} is not declared by source {:?}",
                            p.source_name, p.source_id
                        ));
                    }
                }
            }
        } else if self.topic(&self.sink.source_id).is_none() {
            problems.push(format!(
                "sink references unknown source {:?}",
                self.sink.source_id
            ));
        }

        if self.sink.mapping.is_empty() {
            problems.push("sink mapping is empty".to_string());
        }
        if self.sink.max_batch_size == 0 {
            problems.push("sink max_batch_size is zero".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(StartupError(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
pipeline_id: orders-pipeline
ingestor:
  kafka_connection:
    brokers: localhost:9092
  topics:
    - name: orders
      id: orders
      consumer_group: setl-orders
      partitions: 1
      deduplication:
        enabled: true
        id_field: id
        id_field_type: string
        time_window: 1h
sink:
  type: clickhouse
  source_id: orders
  table: orders
  max_batch_size: 100
  max_batch_age: 200ms
  mapping:
    - column: id
      column_type: string
      source_field: id
schema_versions:
  orders:
    version_id: 1
    fields:
      - name: id
        type: string
"#
    }

    #[test]
    fn minimal_definition_parses_and_validates() {
        let def = PipelineDefinition::from_yaml(minimal_yaml()).unwrap();
        def.validate().unwrap();
        assert_eq!(def.pipeline_id, "orders-pipeline");
        let topic = def.topic("orders").unwrap();
        assert!(topic.dedup_enabled());
        assert_eq!(
            topic.deduplication.as_ref().unwrap().time_window,
            Duration::from_secs(3600)
        );
        assert_eq!(def.sink.max_batch_age, Duration::from_millis(200));
    }

    #[test]
    fn missing_schema_for_internal_source_is_rejected() {
        let mut def = PipelineDefinition::from_yaml(minimal_yaml()).unwrap();
        def.schema_versions.clear();
        let err = def.validate().unwrap_err();
        assert!(err.0.contains("no declared schema version"));
    }

    #[test]
    fn dedup_field_must_be_declared() {
        let mut def = PipelineDefinition::from_yaml(minimal_yaml()).unwrap();
        def.ingestor.topics[0]
            .deduplication
            .as_mut()
            .unwrap()
            .id_field = "nope".into();
        let err = def.validate().unwrap_err();
        assert!(err.0.contains("not declared"));
    }

    #[test]
    fn join_requires_both_sides() {
        let mut def = PipelineDefinition::from_yaml(minimal_yaml()).unwrap();
        def.join = Some(JoinConfig {
            enabled: true,
            join_type: JoinType::Temporal,
            sources: vec![JoinSourceConfig {
                source_id: "orders".into(),
                join_key: "id".into(),
                time_window: Duration::from_secs(2),
                orientation: JoinSide::Left,
            }],
            projection: vec![JoinProjection {
                source_id: "orders".into(),
                source_name: "id".into(),
                output_name: "id".into(),
            }],
        });
        let err = def.validate().unwrap_err();
        assert!(err.0.contains("exactly two sources"));
    }

    #[test]
    fn sink_fields_follow_the_transformer_chain() {
        let mut def = PipelineDefinition::from_yaml(minimal_yaml()).unwrap();
        def.transformation = Some(TransformationConfig {
            source_id: "orders".into(),
            version_id: 2,
            fields: vec![TransformField {
                name: "order_id".into(),
                field_type: FieldType::String,
                expression: "id".into(),
            }],
        });
        let fields = def.sink_fields().unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "order_id");
    }
}
