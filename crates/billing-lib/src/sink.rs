//! Output sinks for aggregated rows
//!
//! Sinks receive one write per batch and flavour. `MemorySink` keeps rows in
//! memory for tests and embedding; `JsonLinesSink` appends one JSON object
//! per line to files in an output directory.

use crate::error::{PipelineError, Result};
use crate::models::{BillingRecord, GranularUtilization, UtilizationSample};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const BILLING_FILE: &str = "billing.jsonl";
pub const UTILIZATION_FILE: &str = "utilization.jsonl";
pub const GRANULAR_UTILIZATION_FILE: &str = "granular_utilization.jsonl";

#[async_trait]
pub trait BillingSink: Send + Sync {
    async fn write_billing(&self, rows: &[BillingRecord]) -> Result<()>;
}

#[async_trait]
pub trait UtilizationSink: Send + Sync {
    async fn write_aggregated(&self, rows: &[UtilizationSample]) -> Result<()>;

    async fn write_granular(&self, rows: &[GranularUtilization]) -> Result<()>;
}

/// In-memory sink
#[derive(Debug, Default)]
pub struct MemorySink {
    billing: Mutex<Vec<BillingRecord>>,
    aggregated: Mutex<Vec<UtilizationSample>>,
    granular: Mutex<Vec<GranularUtilization>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn billing_rows(&self) -> Result<Vec<BillingRecord>> {
        Ok(lock(&self.billing)?.clone())
    }

    pub fn aggregated_rows(&self) -> Result<Vec<UtilizationSample>> {
        Ok(lock(&self.aggregated)?.clone())
    }

    pub fn granular_rows(&self) -> Result<Vec<GranularUtilization>> {
        Ok(lock(&self.granular)?.clone())
    }
}

fn lock<T>(target: &Mutex<Vec<T>>) -> Result<MutexGuard<'_, Vec<T>>> {
    target
        .lock()
        .map_err(|_| PipelineError::Sink("memory sink lock poisoned".to_string()))
}

fn append<T: Clone>(target: &Mutex<Vec<T>>, rows: &[T]) -> Result<()> {
    lock(target)?.extend_from_slice(rows);
    Ok(())
}

#[async_trait]
impl BillingSink for MemorySink {
    async fn write_billing(&self, rows: &[BillingRecord]) -> Result<()> {
        append(&self.billing, rows)
    }
}

#[async_trait]
impl UtilizationSink for MemorySink {
    async fn write_aggregated(&self, rows: &[UtilizationSample]) -> Result<()> {
        append(&self.aggregated, rows)
    }

    async fn write_granular(&self, rows: &[GranularUtilization]) -> Result<()> {
        append(&self.granular, rows)
    }
}

/// Appends rows as JSON lines under an output directory
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    output_dir: PathBuf,
}

impl JsonLinesSink {
    /// Create the sink, creating `output_dir` if needed
    pub async fn create(output_dir: impl AsRef<Path>) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| PipelineError::Sink(format!("create {}: {}", output_dir.display(), e)))?;
        Ok(Self { output_dir })
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.output_dir.join(file_name)
    }

    async fn append_rows<T: Serialize + Sync>(&self, file_name: &str, rows: &[T]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut buf, row)
                .map_err(|e| PipelineError::Sink(format!("encode row: {}", e)))?;
            buf.push(b'\n');
        }

        let path = self.path_for(file_name);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| PipelineError::Sink(format!("open {}: {}", path.display(), e)))?;
        file.write_all(&buf)
            .await
            .map_err(|e| PipelineError::Sink(format!("write {}: {}", path.display(), e)))?;
        file.flush()
            .await
            .map_err(|e| PipelineError::Sink(format!("flush {}: {}", path.display(), e)))?;

        debug!(path = %path.display(), rows = rows.len(), "Appended rows");
        Ok(())
    }
}

#[async_trait]
impl BillingSink for JsonLinesSink {
    async fn write_billing(&self, rows: &[BillingRecord]) -> Result<()> {
        self.append_rows(BILLING_FILE, rows).await
    }
}

#[async_trait]
impl UtilizationSink for JsonLinesSink {
    async fn write_aggregated(&self, rows: &[UtilizationSample]) -> Result<()> {
        self.append_rows(UTILIZATION_FILE, rows).await
    }

    async fn write_granular(&self, rows: &[GranularUtilization]) -> Result<()> {
        self.append_rows(GRANULAR_UTILIZATION_FILE, rows).await
    }
}
