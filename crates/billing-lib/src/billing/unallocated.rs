//! Node-level unallocated and actual idle cost
//!
//! ```text
//! unallocated = node cost      - sum(child cost)      - node system cost
//! actual idle = node idle cost - unallocated
//! ```
//!
//! computed for the total, cpu and memory components.

use crate::error::StoreError;
use crate::models::{BillingRecord, CostRole};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::store::InstanceStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Total, cpu and memory components of one cost figure
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostBreakdown {
    pub total: f64,
    pub cpu: f64,
    pub memory: f64,
}

impl CostBreakdown {
    pub fn new(total: f64, cpu: f64, memory: f64) -> Self {
        Self { total, cpu, memory }
    }

    fn add(&mut self, other: CostBreakdown) {
        self.total += other.total;
        self.cpu += other.cpu;
        self.memory += other.memory;
    }

    fn minus(self, other: CostBreakdown) -> CostBreakdown {
        CostBreakdown {
            total: self.total - other.total,
            cpu: self.cpu - other.cpu,
            memory: self.memory - other.memory,
        }
    }

    fn has_negative(&self) -> bool {
        self.total < 0.0 || self.cpu < 0.0 || self.memory < 0.0
    }
}

/// Zero all three components if any is negative.
///
/// Returns the clamped value and whether clamping happened.
pub fn clamp_costs(costs: CostBreakdown) -> (CostBreakdown, bool) {
    if costs.has_negative() {
        (CostBreakdown::default(), true)
    } else {
        (costs, false)
    }
}

fn billing_of(entry: &BillingRecord) -> CostBreakdown {
    CostBreakdown::new(
        entry.billing_amount,
        entry.cpu_billing_amount,
        entry.memory_billing_amount,
    )
}

fn system_of(entry: &BillingRecord) -> CostBreakdown {
    CostBreakdown::new(entry.system_cost, entry.cpu_system_cost, entry.memory_system_cost)
}

fn idle_of(entry: &BillingRecord) -> CostBreakdown {
    CostBreakdown::new(entry.idle_cost, entry.cpu_idle_cost, entry.memory_idle_cost)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ParentKey {
    account_id: String,
    cluster_id: String,
    parent_id: String,
    start: DateTime<Utc>,
}

/// Computes unallocated and actual idle cost for parent instances
pub struct UnallocatedCostAggregator {
    store: Arc<dyn InstanceStore>,
    logger: StructuredLogger,
    metrics: PipelineMetrics,
}

impl UnallocatedCostAggregator {
    pub fn new(store: Arc<dyn InstanceStore>, logger: StructuredLogger) -> Self {
        Self {
            store,
            logger,
            metrics: PipelineMetrics::new(),
        }
    }

    /// One output row per parent entry in `entries`.
    ///
    /// Children are matched to parents by parent instance id. A parent without
    /// matching children is retried by its instance name, since some
    /// collectors report the parent by name.
    pub async fn aggregate(&self, entries: &[BillingRecord]) -> Result<Vec<BillingRecord>, StoreError> {
        let mut child_costs: HashMap<ParentKey, CostBreakdown> = HashMap::new();
        for entry in entries {
            if entry.instance_type.cost_role() != CostRole::Child {
                continue;
            }
            let Some(parent_id) = entry.parent_instance_id.as_ref() else {
                debug!(
                    account_id = %entry.account_id,
                    cluster_id = %entry.cluster_id,
                    instance_id = %entry.instance_id,
                    "Child cost entry without parent, not attributed"
                );
                continue;
            };
            let key = ParentKey {
                account_id: entry.account_id.clone(),
                cluster_id: entry.cluster_id.clone(),
                parent_id: parent_id.clone(),
                start: entry.start_timestamp,
            };
            child_costs.entry(key).or_default().add(billing_of(entry));
        }

        let mut rows = Vec::new();
        for parent in entries
            .iter()
            .filter(|e| e.instance_type.cost_role() == CostRole::Parent)
        {
            let children = self.children_for(parent, &child_costs).await?;
            rows.push(self.apply(parent, children));
        }

        Ok(rows)
    }

    async fn children_for(
        &self,
        parent: &BillingRecord,
        child_costs: &HashMap<ParentKey, CostBreakdown>,
    ) -> Result<CostBreakdown, StoreError> {
        let mut key = ParentKey {
            account_id: parent.account_id.clone(),
            cluster_id: parent.cluster_id.clone(),
            parent_id: parent.instance_id.clone(),
            start: parent.start_timestamp,
        };
        if let Some(costs) = child_costs.get(&key) {
            return Ok(*costs);
        }

        let name = if parent.instance_name.is_empty() {
            self.store
                .fetch(&parent.account_id, &parent.instance_id)
                .await?
                .map(|record| record.instance_name)
        } else {
            Some(parent.instance_name.clone())
        };

        match name {
            Some(name) if name != parent.instance_id => {
                key.parent_id = name;
                Ok(child_costs.get(&key).copied().unwrap_or_default())
            }
            _ => Ok(CostBreakdown::default()),
        }
    }

    fn apply(&self, parent: &BillingRecord, children: CostBreakdown) -> BillingRecord {
        let raw_unallocated = billing_of(parent).minus(children).minus(system_of(parent));
        let (unallocated, clamped) = clamp_costs(raw_unallocated);
        if clamped {
            self.logger.log_cost_clamped(
                "unallocated",
                &parent.account_id,
                &parent.cluster_id,
                &parent.instance_id,
                parent.start_timestamp,
                raw_unallocated.total,
                raw_unallocated.cpu,
                raw_unallocated.memory,
            );
            self.metrics.inc_cost_clamps("unallocated");
        }

        let raw_idle = idle_of(parent).minus(unallocated);
        let (actual_idle, clamped) = clamp_costs(raw_idle);
        if clamped {
            self.logger.log_cost_clamped(
                "actual_idle",
                &parent.account_id,
                &parent.cluster_id,
                &parent.instance_id,
                parent.start_timestamp,
                raw_idle.total,
                raw_idle.cpu,
                raw_idle.memory,
            );
            self.metrics.inc_cost_clamps("actual_idle");
        }

        let mut row = parent.clone();
        row.unallocated_cost = unallocated.total;
        row.cpu_unallocated_cost = unallocated.cpu;
        row.memory_unallocated_cost = unallocated.memory;
        row.actual_idle_cost = actual_idle.total;
        row.cpu_actual_idle_cost = actual_idle.cpu;
        row.memory_actual_idle_cost = actual_idle.memory;
        row
    }
}
