//! Utilization aggregation
//!
//! Two flavours:
//! - aggregated: cluster/service level rows reassembled from four
//!   independently delivered series (cpu avg/max, memory avg/max) on
//!   hourly buckets
//! - granular: per-node and per-pod rows at collector cadence, pod rows
//!   summed over their containers

mod aggregated;
mod granular;

pub use aggregated::{
    aggregate_utilization, AggregatedUtilization, MetricSeries, SeriesKind,
    DEFAULT_COARSE_BUCKET_SECS,
};
pub use granular::{
    node_utilization, pod_utilization, ContainerUsage, NodeUtilizationMetric,
    PodUtilizationMetric,
};
