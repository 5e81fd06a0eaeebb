//! # SETL Core - Streaming ETL Pipeline Core Library
//!
//! This crate provides the foundational types, traits, and abstractions for the
//! SETL streaming pipeline runtime. It defines the schema model, the pipeline
//! definition, the capability traits implemented by external drivers, and the
//! error taxonomy shared by every stage.
//!
//! ## Key Components
//!
//! - **Schema Model**: Versioned, typed field sets with compatibility checking
//! - **Pipeline Definition**: The validated configuration object a worker runs
//! - **Capability Traits**: `MessageBus`, `RecordConsumer`, `SchemaRegistryRemote`,
//!   and `Database` seams for concrete drivers
//! - **Error Taxonomy**: Closed enums for per-record errors, per-pipeline
//!   signals, and the durable DLQ record format
//!
//! Components reference each other only through subjects on the message bus,
//! never as in-memory pointers. All per-pipeline state (schema cache, dedup
//! window, join buffers) is owned by a single pipeline worker and lives for
//! the lifetime of that worker.

/// Bounded exponential retry schedule
pub mod backoff;

/// Message bus capability and subject naming
pub mod bus;

/// Kafka, schema registry, and database capabilities
pub mod capability;

/// Pipeline definition and startup validation
pub mod definition;

/// Error taxonomy and DLQ / signal record formats
pub mod error;

/// Schema, version, and wire-envelope model
pub mod schema;

pub use backoff::Backoff;
pub use bus::{subjects, BusError, Delivery, Headers, MessageBus, Subscription};
pub use capability::{
    ConsumeError, Database, DbError, PartitionStream, RecordConsumer, SchemaRegistryRemote,
    SourceRecord,
};
pub use definition::{
    ColumnMapping, ColumnType, DeduplicationConfig, FilterConfig, IngestorConfig, JoinConfig,
    JoinProjection, JoinSide, JoinSourceConfig, JoinType, KafkaConnectionConfig,
    PipelineDefinition, SchemaRegistryConfig, SchemaVersionConfig, SinkConfig, TopicConfig,
    TransformField, TransformationConfig,
};
pub use error::{Component, DlqEntry, ErrorKind, SignalEntry, SignalReason, StartupError};
pub use schema::{
    extract_schema_id, wrap_schema_id, DataFormat, Field, FieldType, Schema, SchemaConfigType,
    SchemaError, SchemaVersion, ENVELOPE_LEN, ENVELOPE_MAGIC,
};
