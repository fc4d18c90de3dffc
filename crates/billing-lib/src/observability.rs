//! Observability infrastructure for the billing pipeline
//!
//! Provides:
//! - Prometheus metrics (batch latency, event outcomes, clamp anomalies, rows written)
//! - Structured JSON logging with tracing for every recovered error path

use chrono::{DateTime, Utc};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Histogram buckets for batch latency (in seconds)
const BATCH_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    batch_latency_seconds: Histogram,
    events_processed: IntCounterVec,
    events_failed: IntCounterVec,
    stale_events_dropped: IntCounter,
    synthetic_stops: IntCounter,
    cost_clamps: IntCounterVec,
    rows_written: IntCounterVec,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            batch_latency_seconds: register_histogram!(
                "billing_pipeline_batch_latency_seconds",
                "Time spent processing one event batch",
                BATCH_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register batch_latency_seconds"),

            events_processed: register_int_counter_vec!(
                "billing_pipeline_events_processed_total",
                "Events processed, by event kind",
                &["kind"]
            )
            .expect("Failed to register events_processed"),

            events_failed: register_int_counter_vec!(
                "billing_pipeline_events_failed_total",
                "Events skipped after an item-level failure, by event kind",
                &["kind"]
            )
            .expect("Failed to register events_failed"),

            stale_events_dropped: register_int_counter!(
                "billing_pipeline_stale_events_dropped_total",
                "Lifecycle events dropped as stale or duplicate deliveries"
            )
            .expect("Failed to register stale_events_dropped"),

            synthetic_stops: register_int_counter!(
                "billing_pipeline_synthetic_stops_total",
                "STOP events synthesized by sync reconciliation"
            )
            .expect("Failed to register synthetic_stops"),

            cost_clamps: register_int_counter_vec!(
                "billing_pipeline_cost_clamps_total",
                "Negative cost values clamped to zero, by cost kind",
                &["kind"]
            )
            .expect("Failed to register cost_clamps"),

            rows_written: register_int_counter_vec!(
                "billing_pipeline_rows_written_total",
                "Aggregate rows written, by sink",
                &["sink"]
            )
            .expect("Failed to register rows_written"),
        }
    }
}

/// Pipeline metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_batch_latency(&self, duration_secs: f64) {
        self.inner().batch_latency_seconds.observe(duration_secs);
    }

    pub fn inc_events_processed(&self, kind: &str) {
        self.inner().events_processed.with_label_values(&[kind]).inc();
    }

    pub fn inc_events_failed(&self, kind: &str) {
        self.inner().events_failed.with_label_values(&[kind]).inc();
    }

    pub fn inc_stale_events(&self) {
        self.inner().stale_events_dropped.inc();
    }

    pub fn inc_synthetic_stops(&self) {
        self.inner().synthetic_stops.inc();
    }

    pub fn inc_cost_clamps(&self, kind: &str) {
        self.inner().cost_clamps.with_label_values(&[kind]).inc();
    }

    pub fn add_rows_written(&self, sink: &str, rows: usize) {
        self.inner()
            .rows_written
            .with_label_values(&[sink])
            .inc_by(rows as u64);
    }
}

/// Structured logger for pipeline events
///
/// Every recovered error path logs the correlating ids (account, cluster,
/// instance, time) so billing gaps can be traced back to their cause.
#[derive(Clone)]
pub struct StructuredLogger {
    worker_name: String,
}

impl StructuredLogger {
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
        }
    }

    /// Log a lifecycle event dropped as an out-of-order or duplicate delivery
    pub fn log_stale_event(
        &self,
        account_id: &str,
        cluster_id: &str,
        instance_id: &str,
        event_type: &str,
        event_time: DateTime<Utc>,
        usage_start_time: DateTime<Utc>,
    ) {
        info!(
            event = "stale_event_dropped",
            worker = %self.worker_name,
            account_id = %account_id,
            cluster_id = %cluster_id,
            instance_id = %instance_id,
            event_type = %event_type,
            event_time = %event_time,
            usage_start_time = %usage_start_time,
            "Dropping lifecycle event older than current usage start"
        );
    }

    /// Log a negative cost that was clamped to zero
    #[allow(clippy::too_many_arguments)]
    pub fn log_cost_clamped(
        &self,
        kind: &str,
        account_id: &str,
        cluster_id: &str,
        instance_id: &str,
        start_time: DateTime<Utc>,
        total: f64,
        cpu: f64,
        memory: f64,
    ) {
        warn!(
            event = "cost_clamped",
            worker = %self.worker_name,
            kind = %kind,
            account_id = %account_id,
            cluster_id = %cluster_id,
            instance_id = %instance_id,
            start_time = %start_time,
            total = total,
            cpu = cpu,
            memory = memory,
            "Negative cost after subtraction, clamping to zero"
        );
    }

    /// Log a STOP synthesized by sync reconciliation
    pub fn log_synthetic_stop(
        &self,
        account_id: &str,
        cluster_id: &str,
        instance_id: &str,
        stop_time: DateTime<Utc>,
    ) {
        info!(
            event = "synthetic_stop_issued",
            worker = %self.worker_name,
            account_id = %account_id,
            cluster_id = %cluster_id,
            instance_id = %instance_id,
            stop_time = %stop_time,
            "Instance missing from sync snapshot, issuing STOP"
        );
    }

    /// Log a resource whose parent record could not be found
    pub fn log_parent_unresolved(
        &self,
        account_id: &str,
        cluster_id: &str,
        instance_id: &str,
        parent_ref: &str,
    ) {
        warn!(
            event = "parent_unresolved",
            worker = %self.worker_name,
            account_id = %account_id,
            cluster_id = %cluster_id,
            instance_id = %instance_id,
            parent_ref = %parent_ref,
            "Parent instance not found, creating record without parent enrichment"
        );
    }

    /// Log an event skipped after an item-level failure
    pub fn log_event_failed(&self, kind: &str, account_id: &str, key: &str, error: &str) {
        warn!(
            event = "event_failed",
            worker = %self.worker_name,
            kind = %kind,
            account_id = %account_id,
            key = %key,
            error = %error,
            "Skipping event after failure"
        );
    }

    /// Log completion of one batch
    pub fn log_batch_complete(&self, events: usize, failed: usize, elapsed_ms: u128) {
        if failed > 0 {
            warn!(
                event = "batch_complete",
                worker = %self.worker_name,
                events = events,
                failed = failed,
                elapsed_ms = elapsed_ms,
                "Batch complete with skipped events"
            );
        } else {
            debug!(
                event = "batch_complete",
                worker = %self.worker_name,
                events = events,
                elapsed_ms = elapsed_ms,
                "Batch complete"
            );
        }
    }

    /// Log worker startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "worker_started",
            worker = %self.worker_name,
            version = %version,
            "Billing batch worker started"
        );
    }

    /// Log worker shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "worker_shutdown",
            worker = %self.worker_name,
            reason = %reason,
            "Billing batch worker shutting down"
        );
    }
}
