//! Feeds decoded envelopes through the pipeline in fixed-size batches

use billing_lib::{
    health::{components, HealthRegistry},
    BatchPipeline, BatchReport, EventEnvelope, PipelineError, StoreError,
};
use serde::Serialize;
use tracing::info;

/// Totals over all batches of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub batches: usize,
    pub events: usize,
    pub failed: usize,
    pub billing_rows: usize,
    pub utilization_rows: usize,
    pub granular_rows: usize,
}

impl RunSummary {
    fn add(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.events += report.events;
        self.failed += report.failed;
        self.billing_rows += report.billing_rows;
        self.utilization_rows += report.utilization_rows;
        self.granular_rows += report.granular_rows;
    }
}

/// Process `envelopes` in batches of `batch_size`.
///
/// Stops at the first batch that fails as a whole and marks the failing
/// component unhealthy.
pub async fn run_batches(
    pipeline: &BatchPipeline,
    health: &HealthRegistry,
    envelopes: Vec<EventEnvelope>,
    batch_size: usize,
) -> Result<RunSummary, PipelineError> {
    let mut summary = RunSummary::default();
    let mut remaining = envelopes.into_iter().peekable();

    while remaining.peek().is_some() {
        let batch: Vec<EventEnvelope> = remaining.by_ref().take(batch_size.max(1)).collect();

        match pipeline.process_batch(batch).await {
            Ok(report) => {
                health.set_healthy(components::STORE).await;
                health.set_healthy(components::SINK).await;
                health.record_batch(report.events, report.failed).await;
                summary.add(&report);
            }
            Err(e) => {
                let component = match &e {
                    PipelineError::Store(StoreError::Unavailable(_)) => components::STORE,
                    PipelineError::Sink(_) => components::SINK,
                    _ => components::PIPELINE,
                };
                health.set_unhealthy(component, e.to_string()).await;
                return Err(e);
            }
        }
    }

    info!(
        batches = summary.batches,
        events = summary.events,
        failed = summary.failed,
        billing_rows = summary.billing_rows,
        "Input drained"
    );
    Ok(summary)
}
