//! Billing aggregation
//!
//! Works on the per-instance billing rows of one batch:
//! - node level: unallocated and actual idle cost per parent instance, after
//!   subtracting child and system cost
//! - cluster level: one `CLUSTER_UNALLOCATED` row per cluster with the cost
//!   no child accounts for
//! - usage: active seconds of an instance inside a billing interval

mod cluster;
mod unallocated;
pub mod usage;


pub use cluster::ClusterUnallocatedAggregator;
pub use unallocated::{clamp_costs, CostBreakdown, UnallocatedCostAggregator};

use crate::error::StoreError;
use crate::models::BillingRecord;
use crate::observability::StructuredLogger;
use crate::store::InstanceStore;
use std::sync::Arc;

/// Runs the node-level and cluster-level aggregators over one batch
pub struct BillingAggregator {
    unallocated: UnallocatedCostAggregator,
    cluster: ClusterUnallocatedAggregator,
}

impl BillingAggregator {
    pub fn new(store: Arc<dyn InstanceStore>, logger: StructuredLogger) -> Self {
        Self {
            unallocated: UnallocatedCostAggregator::new(store, logger.clone()),
            cluster: ClusterUnallocatedAggregator::new(logger),
        }
    }

    /// Node rows with unallocated/actual idle cost, followed by cluster rows
    pub async fn aggregate(&self, entries: &[BillingRecord]) -> Result<Vec<BillingRecord>, StoreError> {
        let mut rows = self.unallocated.aggregate(entries).await?;
        rows.extend(self.cluster.aggregate(entries));
        Ok(rows)
    }
}
