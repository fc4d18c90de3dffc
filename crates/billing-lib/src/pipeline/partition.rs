//! Sequential processing of one (account, instance) partition

use super::BatchReport;
use crate::error::StoreError;
use crate::ingest::{Event, EventEnvelope};
use crate::lifecycle::{LifecycleEventHandler, LifecycleOutcome};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::writers::{
    write_container_instance_info, write_node_info, write_pod_info, write_task_info,
    WriteOutcome, WriterContext,
};
use std::sync::Arc;

#[derive(Clone)]
pub(super) struct PartitionWorker {
    writers: WriterContext,
    lifecycle: Arc<LifecycleEventHandler>,
    logger: StructuredLogger,
    metrics: PipelineMetrics,
}

impl PartitionWorker {
    pub(super) fn new(
        writers: WriterContext,
        lifecycle: Arc<LifecycleEventHandler>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            writers,
            lifecycle,
            logger,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Apply the partition's envelopes in order.
    ///
    /// Returns early only when the store is unavailable.
    pub(super) async fn run(&self, envelopes: Vec<EventEnvelope>) -> Result<BatchReport, StoreError> {
        let mut report = BatchReport::default();

        for envelope in &envelopes {
            let kind = envelope.event.kind();
            match self.apply(envelope, &mut report).await {
                Ok(()) => self.metrics.inc_events_processed(kind),
                Err(e @ StoreError::Unavailable(_)) => return Err(e),
                Err(e) => {
                    report.failed += 1;
                    self.metrics.inc_events_failed(kind);
                    self.logger.log_event_failed(
                        kind,
                        &envelope.account_id,
                        envelope.event.instance_id().unwrap_or_default(),
                        &e.to_string(),
                    );
                }
            }
        }

        Ok(report)
    }

    async fn apply(&self, envelope: &EventEnvelope, report: &mut BatchReport) -> Result<(), StoreError> {
        let account_id = envelope.account_id.as_str();

        let written = match &envelope.event {
            Event::NodeInfo(info) => write_node_info(&self.writers, account_id, info).await?,
            Event::ContainerInstanceInfo(info) => {
                write_container_instance_info(&self.writers, account_id, info).await?
            }
            Event::TaskInfo(info) => write_task_info(&self.writers, account_id, info).await?,
            Event::PodInfo(info) => write_pod_info(&self.writers, account_id, info).await?,
            Event::Lifecycle(_) => {
                let Some(event) = envelope.lifecycle_event() else {
                    return Ok(());
                };
                match self.lifecycle.handle(&event).await? {
                    LifecycleOutcome::Applied(_) => report.transitions += 1,
                    LifecycleOutcome::Stale => report.stale += 1,
                    LifecycleOutcome::NotFound | LifecycleOutcome::NotApplicable(_) => {
                        report.ignored += 1
                    }
                }
                return Ok(());
            }
            _ => return Ok(()),
        };

        match written {
            WriteOutcome::Created => report.created += 1,
            WriteOutcome::AlreadyActive => report.duplicates += 1,
        }
        Ok(())
    }
}
