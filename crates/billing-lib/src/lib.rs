//! Billing pipeline library
//!
//! This crate provides the core functionality for:
//! - Instance state tracking with optimistic concurrency
//! - Lifecycle (START/STOP) event handling
//! - Resource-type writers for nodes, container instances, tasks and pods
//! - Sync reconciliation against collector snapshots
//! - Utilization aggregation
//! - Unallocated and idle cost aggregation
//! - Health checks and observability

pub mod billing;
pub mod error;
pub mod health;
pub mod ingest;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod sink;
pub mod store;
pub mod sync;
pub mod utilization;
pub mod writers;

pub use error::{LookupError, PipelineError, StoreError, UtilizationError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use ingest::{decode_line, decode_lines, Event, EventEnvelope};
pub use models::*;
pub use observability::{PipelineMetrics, StructuredLogger};
pub use pipeline::{BatchPipeline, BatchPipelineBuilder, BatchReport, PipelineConfig};
pub use store::{InMemoryInstanceStore, InstanceStore};
