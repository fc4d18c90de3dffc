//! Batch pipeline
//!
//! Runs one batch of decoded envelopes through the stages in order:
//!
//! 1. resource-info and lifecycle events, partitioned by (account, instance);
//!    order is preserved inside a partition. Partitions run in dependency
//!    waves (nodes and EC2 hosts, then container instances and pods, then
//!    tasks) so a child's writer always sees its parent from the same batch.
//!    Partitions inside one wave run concurrently
//! 2. sync snapshots, sequentially
//! 3. utilization messages, one sink write per flavour
//! 4. billing batches, node-level then cluster-level, one sink write
//!
//! Item-level failures are logged, counted and skipped. An unavailable store
//! or a failed sink write aborts the batch.

mod partition;

#[cfg(test)]
mod tests;

use self::partition::PartitionWorker;
use crate::billing::BillingAggregator;
use crate::error::{PipelineError, Result, StoreError};
use crate::ingest::{Event, EventEnvelope};
use crate::lifecycle::{LifecycleEventHandler, DEFAULT_MAX_CONFLICT_RETRIES};
use crate::models::{BillingRecord, GranularUtilization, UtilizationSample};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::sink::{BillingSink, UtilizationSink};
use crate::store::InstanceStore;
use crate::sync::{EcsSyncSnapshot, K8sSyncSnapshot, SyncReconciler, SyncSnapshot};
use crate::utilization::{
    aggregate_utilization, node_utilization, pod_utilization, AggregatedUtilization,
    DEFAULT_COARSE_BUCKET_SECS,
};
use crate::writers::{NoServiceLinkage, ServiceLinkageLookup, WriterContext};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Default number of partitions processed at once
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Partitions processed concurrently
    pub max_concurrency: usize,
    /// Width of aggregated utilization buckets
    pub coarse_bucket: chrono::Duration,
    /// Re-reads after a lifecycle update conflict
    pub max_conflict_retries: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            coarse_bucket: chrono::Duration::seconds(DEFAULT_COARSE_BUCKET_SECS),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }
}

/// Counts for one processed batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub events: usize,
    /// Records created by writers
    pub created: usize,
    /// Writer events for instances that were already active
    pub duplicates: usize,
    /// Lifecycle events that changed state
    pub transitions: usize,
    /// Lifecycle events dropped as out of order
    pub stale: usize,
    /// Lifecycle events with no record or in the wrong source state
    pub ignored: usize,
    pub synthetic_stops: usize,
    pub utilization_rows: usize,
    pub granular_rows: usize,
    pub billing_rows: usize,
    /// Items skipped after a recoverable failure
    pub failed: usize,
}

impl BatchReport {
    fn merge(&mut self, other: &BatchReport) {
        self.created += other.created;
        self.duplicates += other.duplicates;
        self.transitions += other.transitions;
        self.stale += other.stale;
        self.ignored += other.ignored;
        self.failed += other.failed;
    }
}

enum PendingSnapshot {
    Ecs(EcsSyncSnapshot),
    K8s(K8sSyncSnapshot),
}

impl PendingSnapshot {
    fn as_snapshot(&self) -> &(dyn SyncSnapshot + Sync) {
        match self {
            PendingSnapshot::Ecs(snapshot) => snapshot,
            PendingSnapshot::K8s(snapshot) => snapshot,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            PendingSnapshot::Ecs(_) => "ecs_sync",
            PendingSnapshot::K8s(_) => "k8s_sync",
        }
    }
}

/// Wave a partition runs in; parents are written in earlier waves than
/// the records that look them up
fn dependency_wave(event: &Event) -> usize {
    match event {
        Event::ContainerInstanceInfo(_) | Event::PodInfo(_) => 1,
        Event::TaskInfo(_) => 2,
        _ => 0,
    }
}

/// Envelopes of one batch sorted by stage
#[derive(Default)]
struct StagedBatch {
    /// (wave, envelopes) per (account, instance) partition
    partitions: Vec<(usize, Vec<EventEnvelope>)>,
    snapshots: Vec<(String, PendingSnapshot)>,
    aggregated: Vec<(String, AggregatedUtilization)>,
    granular: Vec<GranularUtilization>,
    billing: Vec<BillingRecord>,
}

impl StagedBatch {
    fn stage(envelopes: Vec<EventEnvelope>) -> Self {
        let mut staged = StagedBatch::default();
        let mut partition_index: HashMap<(String, String), usize> = HashMap::new();

        for envelope in envelopes {
            let partition_key = envelope
                .event
                .instance_id()
                .map(|id| (envelope.account_id.clone(), id.to_string()));

            if let Some(key) = partition_key {
                let partitions = &mut staged.partitions;
                let idx = *partition_index.entry(key).or_insert_with(|| {
                    partitions.push((0, Vec::new()));
                    partitions.len() - 1
                });
                let (wave, events) = &mut partitions[idx];
                *wave = (*wave).max(dependency_wave(&envelope.event));
                events.push(envelope);
                continue;
            }

            let account_id = envelope.account_id;
            match envelope.event {
                Event::EcsSync(snapshot) => staged
                    .snapshots
                    .push((account_id, PendingSnapshot::Ecs(snapshot))),
                Event::K8sSync(snapshot) => staged
                    .snapshots
                    .push((account_id, PendingSnapshot::K8s(snapshot))),
                Event::AggregatedUtilization(message) => staged.aggregated.push((account_id, message)),
                Event::NodeUtilization(metric) => {
                    staged.granular.push(node_utilization(&account_id, &metric))
                }
                Event::PodUtilization(metric) => {
                    staged.granular.push(pod_utilization(&account_id, &metric))
                }
                Event::BillingBatch(batch) => staged.billing.extend(batch.records),
                // Partitioned above
                Event::NodeInfo(_)
                | Event::ContainerInstanceInfo(_)
                | Event::TaskInfo(_)
                | Event::PodInfo(_)
                | Event::Lifecycle(_) => {}
            }
        }

        staged
    }

    /// Partitions grouped by wave, earliest wave first
    fn waves(partitions: Vec<(usize, Vec<EventEnvelope>)>) -> Vec<Vec<Vec<EventEnvelope>>> {
        let mut waves: BTreeMap<usize, Vec<Vec<EventEnvelope>>> = BTreeMap::new();
        for (wave, events) in partitions {
            waves.entry(wave).or_default().push(events);
        }
        waves.into_values().collect()
    }
}

/// Processes event batches against an instance store
pub struct BatchPipeline {
    store: Arc<dyn InstanceStore>,
    worker: PartitionWorker,
    reconciler: SyncReconciler,
    billing: BillingAggregator,
    billing_sink: Arc<dyn BillingSink>,
    utilization_sink: Arc<dyn UtilizationSink>,
    config: PipelineConfig,
    logger: StructuredLogger,
    metrics: PipelineMetrics,
}

impl BatchPipeline {
    pub fn builder() -> BatchPipelineBuilder {
        BatchPipelineBuilder::new()
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process one batch; see the module docs for stage order
    pub async fn process_batch(&self, envelopes: Vec<EventEnvelope>) -> Result<BatchReport> {
        let started = Instant::now();
        let mut report = BatchReport {
            events: envelopes.len(),
            ..Default::default()
        };

        let staged = StagedBatch::stage(envelopes);

        if let Err(e) = self.run_stages(staged, &mut report).await {
            error!(
                events = report.events,
                error = %e,
                "Aborting batch"
            );
            return Err(e);
        }

        let elapsed = started.elapsed();
        self.metrics.observe_batch_latency(elapsed.as_secs_f64());
        self.logger
            .log_batch_complete(report.events, report.failed, elapsed.as_millis());
        Ok(report)
    }

    async fn run_stages(&self, staged: StagedBatch, report: &mut BatchReport) -> Result<()> {
        self.run_partitions(staged.partitions, report).await?;
        self.run_sync(&staged.snapshots, report).await?;
        self.run_utilization(&staged.aggregated, &staged.granular, report)
            .await?;
        self.run_billing(&staged.billing, report).await
    }

    async fn run_partitions(
        &self,
        partitions: Vec<(usize, Vec<EventEnvelope>)>,
        report: &mut BatchReport,
    ) -> Result<()> {
        for wave in StagedBatch::waves(partitions) {
            self.run_wave(wave, report).await?;
        }
        Ok(())
    }

    async fn run_wave(&self, partitions: Vec<Vec<EventEnvelope>>, report: &mut BatchReport) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tasks = JoinSet::new();

        for partition in partitions {
            let worker = self.worker.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Task(e.to_string()))?;
                worker.run(partition).await.map_err(PipelineError::from)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(PipelineError::Task(e.to_string())),
            };
            match result {
                Ok(partial) => report.merge(&partial),
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    async fn run_sync(&self, snapshots: &[(String, PendingSnapshot)], report: &mut BatchReport) -> Result<()> {
        for (account_id, snapshot) in snapshots {
            match self.reconciler.reconcile(account_id, snapshot.as_snapshot()).await {
                Ok(reconciled) => {
                    report.synthetic_stops += reconciled.stop_issued.len();
                    report.transitions += reconciled.stopped.len();
                    self.metrics.inc_events_processed(snapshot.kind());
                }
                Err(e @ StoreError::Unavailable(_)) => return Err(e.into()),
                Err(e) => {
                    report.failed += 1;
                    self.metrics.inc_events_failed(snapshot.kind());
                    self.logger.log_event_failed(
                        snapshot.kind(),
                        account_id,
                        snapshot.as_snapshot().cluster_id(),
                        &e.to_string(),
                    );
                }
            }
        }
        Ok(())
    }

    async fn run_utilization(
        &self,
        aggregated: &[(String, AggregatedUtilization)],
        granular: &[GranularUtilization],
        report: &mut BatchReport,
    ) -> Result<()> {
        let mut samples: Vec<UtilizationSample> = Vec::new();
        for (account_id, message) in aggregated {
            match aggregate_utilization(account_id, message, self.config.coarse_bucket) {
                Ok(rows) => {
                    samples.extend(rows);
                    self.metrics.inc_events_processed("aggregated_utilization");
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics.inc_events_failed("aggregated_utilization");
                    self.logger.log_event_failed(
                        "aggregated_utilization",
                        account_id,
                        &message.instance_id,
                        &e.to_string(),
                    );
                }
            }
        }

        if !samples.is_empty() {
            self.utilization_sink.write_aggregated(&samples).await?;
            self.metrics.add_rows_written("utilization", samples.len());
            report.utilization_rows = samples.len();
        }

        if !granular.is_empty() {
            self.utilization_sink.write_granular(granular).await?;
            self.metrics.add_rows_written("granular_utilization", granular.len());
            report.granular_rows = granular.len();
        }

        Ok(())
    }

    async fn run_billing(&self, entries: &[BillingRecord], report: &mut BatchReport) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let rows = self.billing.aggregate(entries).await?;
        if !rows.is_empty() {
            self.billing_sink.write_billing(&rows).await?;
            self.metrics.add_rows_written("billing", rows.len());
        }
        self.metrics.inc_events_processed("billing_batch");
        report.billing_rows = rows.len();

        info!(
            entries = entries.len(),
            rows = rows.len(),
            "Billing aggregation complete"
        );
        Ok(())
    }
}

/// Builder for [`BatchPipeline`]
pub struct BatchPipelineBuilder {
    store: Option<Arc<dyn InstanceStore>>,
    service_lookup: Arc<dyn ServiceLinkageLookup>,
    billing_sink: Option<Arc<dyn BillingSink>>,
    utilization_sink: Option<Arc<dyn UtilizationSink>>,
    config: PipelineConfig,
    worker_name: String,
}

impl BatchPipelineBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            service_lookup: Arc::new(NoServiceLinkage),
            billing_sink: None,
            utilization_sink: None,
            config: PipelineConfig::default(),
            worker_name: "billing-worker".to_string(),
        }
    }

    pub fn store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn service_lookup(mut self, lookup: Arc<dyn ServiceLinkageLookup>) -> Self {
        self.service_lookup = lookup;
        self
    }

    pub fn billing_sink(mut self, sink: Arc<dyn BillingSink>) -> Self {
        self.billing_sink = Some(sink);
        self
    }

    pub fn utilization_sink(mut self, sink: Arc<dyn UtilizationSink>) -> Self {
        self.utilization_sink = Some(sink);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    pub fn coarse_bucket(mut self, bucket: chrono::Duration) -> Self {
        self.config.coarse_bucket = bucket;
        self
    }

    pub fn max_conflict_retries(mut self, retries: usize) -> Self {
        self.config.max_conflict_retries = retries;
        self
    }

    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn build(self) -> Result<BatchPipeline> {
        let store = self
            .store
            .ok_or_else(|| PipelineError::Config("store is required".to_string()))?;
        let billing_sink = self
            .billing_sink
            .ok_or_else(|| PipelineError::Config("billing sink is required".to_string()))?;
        let utilization_sink = self
            .utilization_sink
            .ok_or_else(|| PipelineError::Config("utilization sink is required".to_string()))?;
        if self.config.max_concurrency == 0 {
            return Err(PipelineError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.config.coarse_bucket <= chrono::Duration::zero() {
            return Err(PipelineError::Config(
                "coarse_bucket must be positive".to_string(),
            ));
        }

        let logger = StructuredLogger::new(self.worker_name);
        let lifecycle = Arc::new(
            LifecycleEventHandler::new(store.clone(), logger.clone())
                .with_max_conflict_retries(self.config.max_conflict_retries),
        );
        let writers = WriterContext::new(store.clone(), self.service_lookup, logger.clone());

        Ok(BatchPipeline {
            worker: PartitionWorker::new(writers, lifecycle.clone(), logger.clone()),
            reconciler: SyncReconciler::new(store.clone(), lifecycle, logger.clone()),
            billing: BillingAggregator::new(store.clone(), logger.clone()),
            store,
            billing_sink,
            utilization_sink,
            config: self.config,
            logger,
            metrics: PipelineMetrics::new(),
        })
    }
}

impl Default for BatchPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
