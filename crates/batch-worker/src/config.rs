//! Worker configuration

use anyhow::Result;
use billing_lib::pipeline::{PipelineConfig, DEFAULT_MAX_CONCURRENCY};
use billing_lib::lifecycle::DEFAULT_MAX_CONFLICT_RETRIES;
use billing_lib::utilization::DEFAULT_COARSE_BUCKET_SECS;
use serde::Deserialize;

/// Worker configuration, read from `BILLING_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Name attached to every log line
    #[serde(default = "default_worker_name")]
    pub worker_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// JSON-lines event file; stdin when unset
    #[serde(default)]
    pub input_path: Option<String>,

    /// Directory for billing and utilization output
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Envelopes per pipeline batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_coarse_bucket_secs")]
    pub coarse_bucket_secs: i64,

    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: usize,

    /// Keep serving health and metrics after the input is drained
    #[serde(default)]
    pub serve_after_run: bool,
}

fn default_worker_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "billing-worker".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_output_dir() -> String {
    "./output".to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_coarse_bucket_secs() -> i64 {
    DEFAULT_COARSE_BUCKET_SECS
}

fn default_max_conflict_retries() -> usize {
    DEFAULT_MAX_CONFLICT_RETRIES
}

impl WorkerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("BILLING"))
            .build()?;

        Self::from_config(config)
    }

    pub fn from_config(config: config::Config) -> Result<Self> {
        let parsed: WorkerConfig = config.try_deserialize()?;
        if parsed.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if parsed.coarse_bucket_secs <= 0 {
            anyhow::bail!(
                "coarse_bucket_secs must be positive, got {}",
                parsed.coarse_bucket_secs
            );
        }
        Ok(parsed)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_concurrency: self.max_concurrency,
            coarse_bucket: chrono::Duration::seconds(self.coarse_bucket_secs),
            max_conflict_retries: self.max_conflict_retries,
        }
    }
}
