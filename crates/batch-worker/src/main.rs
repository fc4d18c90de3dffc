//! Billing batch worker
//!
//! Reads JSON-lines event envelopes, runs them through the billing pipeline
//! in batches and appends the resulting rows to JSON-lines files.

use anyhow::{Context, Result};
use batch_worker::{api, config::WorkerConfig, runner};
use billing_lib::{
    decode_lines,
    health::{components, HealthRegistry},
    observability::{PipelineMetrics, StructuredLogger},
    sink::JsonLinesSink,
    BatchPipeline, InMemoryInstanceStore,
};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

async fn read_input(path: Option<&str>) -> Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("reading input file {}", path)),
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("reading stdin")?;
            Ok(buf)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = WorkerConfig::load()?;
    info!(
        worker_name = %config.worker_name,
        batch_size = config.batch_size,
        max_concurrency = config.max_concurrency,
        "Worker configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::STORE).await;
    health_registry.register(components::PIPELINE).await;
    health_registry.register(components::SINK).await;

    let metrics = PipelineMetrics::new();
    let logger = StructuredLogger::new(&config.worker_name);
    logger.log_startup(WORKER_VERSION);

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let sink = Arc::new(JsonLinesSink::create(&config.output_dir).await?);
    let pipeline = BatchPipeline::builder()
        .store(Arc::new(InMemoryInstanceStore::new()))
        .billing_sink(sink.clone())
        .utilization_sink(sink)
        .config(config.pipeline_config())
        .worker_name(config.worker_name.clone())
        .build()?;

    health_registry.set_ready(true).await;

    let input = read_input(config.input_path.as_deref()).await?;
    let envelopes = decode_lines(input.as_slice())?;
    info!(envelopes = envelopes.len(), "Input decoded");

    let outcome =
        runner::run_batches(&pipeline, &health_registry, envelopes, config.batch_size).await;
    if let Err(e) = &outcome {
        error!(error = %e, "Batch run aborted");
    }

    if config.serve_after_run {
        tokio::signal::ctrl_c().await?;
        logger.log_shutdown("SIGINT received");
    } else {
        logger.log_shutdown("input drained");
    }
    api_handle.abort();

    outcome?;
    Ok(())
}
