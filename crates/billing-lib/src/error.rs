//! Error types for the billing pipeline

use crate::models::InstanceState;

/// Errors returned by an instance store implementation
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The record changed between read and conditional update
    #[error(
        "concurrent conflict on {account_id}/{instance_id}: expected {expected_state} at version {expected_version}"
    )]
    ConcurrentConflict {
        account_id: String,
        instance_id: String,
        expected_state: InstanceState,
        expected_version: u64,
    },

    /// The backing store could not be reached
    #[error("instance store unavailable: {0}")]
    Unavailable(String),
}

/// Data-shape violations in aggregated utilization messages
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UtilizationError {
    #[error("unknown utilization series {metric_name}/{statistic}")]
    UnknownSeries {
        metric_name: String,
        statistic: String,
    },

    #[error("utilization series {0} missing")]
    MissingSeries(&'static str),

    #[error("utilization series {0} delivered more than once")]
    DuplicateSeries(&'static str),

    #[error("utilization series {series} not aligned: {reason}")]
    MisalignedSeries { series: &'static str, reason: String },
}

/// Errors surfaced by a pipeline run
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Utilization(#[from] UtilizationError),

    #[error("failed to decode event: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("sink write failed: {0}")]
    Sink(String),

    #[error("partition task failed: {0}")]
    Task(String),

    #[error("invalid pipeline configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether the error must abort the whole batch instead of a single item
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Store(StoreError::Unavailable(_))
                | PipelineError::Sink(_)
                | PipelineError::Task(_)
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Failure of the service-linkage collaborator. Never fatal for a write.
#[derive(Debug, Clone, thiserror::Error)]
#[error("service linkage lookup failed: {0}")]
pub struct LookupError(pub String);
