//! Cluster-level unallocated cost
//!
//! Parent entries add to a cluster's total cost and child entries to its
//! utilized cost. The difference is the cluster's headroom, emitted as one
//! `CLUSTER_UNALLOCATED` row with no idle cost.

use crate::models::{BillingRecord, ClusterCostData, CostRole, InstanceType};
use crate::observability::{PipelineMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Instance name carried on cluster unallocated rows
pub const CLUSTER_UNALLOCATED_NAME: &str = "Unallocated";

pub struct ClusterUnallocatedAggregator {
    logger: StructuredLogger,
    metrics: PipelineMetrics,
}

impl ClusterUnallocatedAggregator {
    pub fn new(logger: StructuredLogger) -> Self {
        Self {
            logger,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Per-cluster cost accumulators for one batch, ordered by cluster.
    ///
    /// Entries for different buckets of the same cluster accumulate separately.
    pub fn accumulate(&self, entries: &[BillingRecord]) -> Vec<ClusterCostData> {
        let mut clusters: BTreeMap<(String, String, DateTime<Utc>), ClusterCostData> = BTreeMap::new();

        for entry in entries {
            let role = entry.instance_type.cost_role();
            if !matches!(role, CostRole::Parent | CostRole::Child) {
                continue;
            }

            let data = clusters
                .entry((
                    entry.account_id.clone(),
                    entry.cluster_id.clone(),
                    entry.start_timestamp,
                ))
                .or_insert_with(|| ClusterCostData {
                    account_id: entry.account_id.clone(),
                    cluster_id: entry.cluster_id.clone(),
                    cluster_name: entry.cluster_name.clone(),
                    setting_id: entry.setting_id.clone(),
                    total_cost: 0.0,
                    utilized_cost: 0.0,
                    start_time: entry.start_timestamp,
                    end_time: entry.end_timestamp,
                });

            if data.cluster_name.is_empty() {
                data.cluster_name = entry.cluster_name.clone();
            }
            if data.setting_id.is_empty() {
                data.setting_id = entry.setting_id.clone();
            }
            data.end_time = data.end_time.max(entry.end_timestamp);

            match role {
                CostRole::Parent => data.total_cost += entry.billing_amount,
                _ => data.utilized_cost += entry.billing_amount,
            }
        }

        clusters.into_values().collect()
    }

    /// One `CLUSTER_UNALLOCATED` row per cluster and bucket
    pub fn aggregate(&self, entries: &[BillingRecord]) -> Vec<BillingRecord> {
        self.accumulate(entries)
            .into_iter()
            .map(|data| self.to_record(data))
            .collect()
    }

    fn to_record(&self, data: ClusterCostData) -> BillingRecord {
        let mut unallocated = data.total_cost - data.utilized_cost;
        if unallocated < 0.0 {
            self.logger.log_cost_clamped(
                "cluster_unallocated",
                &data.account_id,
                &data.cluster_id,
                &data.cluster_id,
                data.start_time,
                unallocated,
                0.0,
                0.0,
            );
            self.metrics.inc_cost_clamps("cluster_unallocated");
            unallocated = 0.0;
        }

        let mut row = BillingRecord::empty(
            data.account_id,
            data.cluster_id.clone(),
            data.cluster_id,
            InstanceType::ClusterUnallocated,
            data.start_time,
            data.end_time,
        );
        row.instance_name = CLUSTER_UNALLOCATED_NAME.to_string();
        row.cluster_name = data.cluster_name;
        row.setting_id = data.setting_id;
        row.billing_amount = unallocated;
        row.unallocated_cost = unallocated;
        row.usage_duration_seconds = (data.end_time - data.start_time).num_seconds() as f64;
        row
    }
}
