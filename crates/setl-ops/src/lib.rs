//! # SETL Ops - Pipeline Operators
//!
//! This crate provides the operator implementations of the SETL streaming
//! pipeline runtime and the supervisor that wires and runs them.
//!
//! ## Operators
//!
//! - **Ingestor**: per-partition Kafka consume loop with schema validation,
//!   windowed deduplication, and at-least-once publishing
//! - **Transformer**: per-record expression evaluation under a new declared
//!   schema version
//! - **Filter**: boolean predicate, forward-or-drop
//! - **Temporal Join**: two-sided, TTL-windowed inner join with a single
//!   owner task
//! - **Sink**: size- and age-bounded batch inserts with bounded retry and
//!   poison-pill isolation
//!
//! ## Glue
//!
//! - **Expression language**: the embedded language shared by transformer
//!   and filter
//! - **DLQ / Signal channels**: durable error capture and control-plane
//!   notifications
//! - **Pipeline supervisor**: startup validation, task spawning, two-phase
//!   cooperative stop
//!
//! Operators communicate exclusively through durable subjects on the message
//! bus; there is no shared mutable structure across component boundaries.

/// Windowed deduplication store
pub mod dedup;

/// DLQ and signal channel publishers
pub mod dlq;

/// Record expression language
pub mod expr;

/// Predicate filter operator
pub mod filter;

/// Kafka ingestion operator
pub mod ingestor;

/// Temporal join operator
pub mod join;

/// Sink column mapping and compatibility matrix
pub mod mapping;

/// Pipeline supervisor
pub mod pipeline;

/// Bus retry helper
mod retry;

/// Batching database sink
pub mod sink;

/// Expression transformer operator
pub mod transform;

pub use dedup::DedupStore;
pub use dlq::ErrorChannels;
pub use expr::Program;
pub use filter::Filter;
pub use ingestor::Ingestor;
pub use join::JoinOperator;
pub use mapping::SinkMapping;
pub use pipeline::{Pipeline, RunningPipeline};
pub use sink::Sink;
pub use transform::Transformer;
