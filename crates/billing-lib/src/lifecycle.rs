//! Lifecycle event handling
//!
//! Applies START/STOP events to instance records. This is the only code path
//! that changes `instance_state`:
//!
//! ```text
//! INITIALIZING --START--> RUNNING --STOP--> STOPPED
//! ```
//!
//! Events arriving out of order are dropped when the running record started
//! after the event's timestamp. Events whose source state is not current are
//! ignored.

use crate::error::StoreError;
use crate::models::{instance_id_from_arn, InstanceState, LifecycleEvent};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::store::InstanceStore;
use std::sync::Arc;
use tracing::debug;

/// Default number of re-reads after a conditional update conflict
pub const DEFAULT_MAX_CONFLICT_RETRIES: usize = 3;

/// What happened to a lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The record moved to the contained state
    Applied(InstanceState),
    /// The running record started after the event, dropped as out of order
    Stale,
    /// No record exists for the instance yet
    NotFound,
    /// The record is not in the event's source state (already transitioned or replayed)
    NotApplicable(InstanceState),
}

/// Applies lifecycle events through conditional store updates
pub struct LifecycleEventHandler {
    store: Arc<dyn InstanceStore>,
    logger: StructuredLogger,
    metrics: PipelineMetrics,
    max_conflict_retries: usize,
}

impl LifecycleEventHandler {
    pub fn new(store: Arc<dyn InstanceStore>, logger: StructuredLogger) -> Self {
        Self {
            store,
            logger,
            metrics: PipelineMetrics::new(),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    /// Set how many times a conflicting update is re-evaluated
    pub fn with_max_conflict_retries(mut self, retries: usize) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Apply one lifecycle event
    pub async fn handle(&self, event: &LifecycleEvent) -> Result<LifecycleOutcome, StoreError> {
        let instance_id = instance_id_from_arn(&event.instance_id);
        let source = event.event_type.source_state();
        let target = event.event_type.target_state();

        let mut attempt = 0;
        loop {
            let Some(record) = self.store.fetch(&event.account_id, instance_id).await? else {
                debug!(
                    account_id = %event.account_id,
                    cluster_id = %event.cluster_id,
                    instance_id = %instance_id,
                    event_type = ?event.event_type,
                    "No instance record for lifecycle event, ignoring"
                );
                return Ok(LifecycleOutcome::NotFound);
            };

            if record.instance_state == InstanceState::Running {
                if let Some(started) = record.usage_start_time {
                    if started > event.timestamp {
                        self.logger.log_stale_event(
                            &event.account_id,
                            &event.cluster_id,
                            instance_id,
                            &format!("{:?}", event.event_type),
                            event.timestamp,
                            started,
                        );
                        self.metrics.inc_stale_events();
                        return Ok(LifecycleOutcome::Stale);
                    }
                }
            }

            if record.instance_state != source {
                debug!(
                    account_id = %event.account_id,
                    cluster_id = %event.cluster_id,
                    instance_id = %instance_id,
                    event_type = ?event.event_type,
                    current_state = %record.instance_state,
                    "Record not in source state for lifecycle event, ignoring"
                );
                return Ok(LifecycleOutcome::NotApplicable(record.instance_state));
            }

            match self.store.update_state(&record, event.timestamp, target).await {
                Ok(updated) => {
                    debug!(
                        account_id = %event.account_id,
                        cluster_id = %event.cluster_id,
                        instance_id = %instance_id,
                        state = %updated.instance_state,
                        "Applied lifecycle transition"
                    );
                    return Ok(LifecycleOutcome::Applied(updated.instance_state));
                }
                Err(StoreError::ConcurrentConflict { .. }) if attempt < self.max_conflict_retries => {
                    attempt += 1;
                    debug!(
                        instance_id = %instance_id,
                        attempt = attempt,
                        "Concurrent update on instance record, re-evaluating"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
