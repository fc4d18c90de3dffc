//! Drift correction against sync snapshots

use super::SyncSnapshot;
use crate::error::StoreError;
use crate::lifecycle::{LifecycleEventHandler, LifecycleOutcome};
use crate::models::{LifecycleEvent, LifecycleEventType};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::store::InstanceStore;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of reconciling one snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Ids the store believed active at the snapshot time
    pub believed_active: usize,
    /// Ids reported by the snapshot
    pub snapshot_active: usize,
    /// Ids a synthetic STOP was issued for, sorted
    pub stop_issued: Vec<String>,
    /// Ids whose synthetic STOP actually changed state
    pub stopped: Vec<String>,
}

/// Compares snapshots with the store and stops instances that vanished
pub struct SyncReconciler {
    store: Arc<dyn InstanceStore>,
    lifecycle: Arc<LifecycleEventHandler>,
    logger: StructuredLogger,
    metrics: PipelineMetrics,
}

impl SyncReconciler {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        lifecycle: Arc<LifecycleEventHandler>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            store,
            lifecycle,
            logger,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Reconcile one snapshot.
    ///
    /// Safe to repeat: a second run against the same snapshot finds the
    /// affected records already stopped and changes nothing.
    pub async fn reconcile(
        &self,
        account_id: &str,
        snapshot: &(dyn SyncSnapshot + Sync),
    ) -> Result<ReconcileReport, StoreError> {
        let cluster_id = snapshot.cluster_id();
        let as_of = snapshot.last_processed_timestamp();

        let believed_active = self
            .store
            .fetch_active_at_time(account_id, snapshot.setting_id(), cluster_id, as_of)
            .await?;
        let snapshot_active = snapshot.active_instance_ids();

        let mut inactive: Vec<String> = believed_active
            .difference(&snapshot_active)
            .cloned()
            .collect();
        inactive.sort();

        let mut report = ReconcileReport {
            believed_active: believed_active.len(),
            snapshot_active: snapshot_active.len(),
            ..Default::default()
        };

        for instance_id in inactive {
            self.logger
                .log_synthetic_stop(account_id, cluster_id, &instance_id, as_of);
            self.metrics.inc_synthetic_stops();

            let event = LifecycleEvent {
                account_id: account_id.to_string(),
                instance_id: instance_id.clone(),
                cluster_id: cluster_id.to_string(),
                event_type: LifecycleEventType::Stop,
                timestamp: as_of,
            };

            let outcome = self.lifecycle.handle(&event).await?;
            if matches!(outcome, LifecycleOutcome::Applied(_)) {
                report.stopped.push(instance_id.clone());
            } else {
                debug!(
                    account_id = %account_id,
                    cluster_id = %cluster_id,
                    instance_id = %instance_id,
                    outcome = ?outcome,
                    "Synthetic STOP had no effect"
                );
            }
            report.stop_issued.push(instance_id);
        }

        info!(
            account_id = %account_id,
            cluster_id = %cluster_id,
            as_of = %as_of,
            believed_active = report.believed_active,
            snapshot_active = report.snapshot_active,
            stop_issued = report.stop_issued.len(),
            "Reconciled sync snapshot"
        );

        Ok(report)
    }
}
