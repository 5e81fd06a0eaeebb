//! # SETL I/O - Driver Adapters
//!
//! This crate provides the concrete implementations behind the capability
//! traits of `setl-core`: the Kafka consumer, the remote schema registry
//! client, the schema registry cache, and the in-memory bus and database used
//! by tests and single-process local runs.
//!
//! ## Adapters
//!
//! - **Kafka**: `rdkafka` stream consumer split into per-partition queues
//!   with manual offset commits
//! - **Schema Registry**: HTTP client fetching field lists by wire-envelope
//!   schema id, plus the process-local version cache with single-flight
//!   fetches
//! - **Memory Bus**: durable-subject semantics (cursor, pending set,
//!   ack-deadline redelivery) and a TTL-enforcing KV store
//! - **Memory Database**: batch-insert target with scripted failure injection

/// In-memory durable message bus
pub mod bus_memory;

/// In-memory batch-insert database
pub mod db_memory;

/// HTTP client for the remote schema registry
pub mod registry_http;

/// Process-local schema version cache
pub mod schema_cache;

/// Apache Kafka consumer adapter
pub mod source_kafka;

/// In-memory consumer adapter
pub mod source_memory;

pub use bus_memory::MemoryBus;
pub use db_memory::MemoryDatabase;
pub use registry_http::HttpSchemaRegistry;
pub use schema_cache::SchemaCache;
pub use source_kafka::KafkaSource;
pub use source_memory::MemorySource;
