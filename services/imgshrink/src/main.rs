//! imgshrink
//!
//! Compresses one image through a metered remote API using a pool of keys:
//! 1. Loads config and API keys
//! 2. Runs the task through the pipeline, rotating keys on auth/quota errors
//! 3. Writes the result and logs the pool state

mod cli;
mod config;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use key_pool::Pool;
use pipeline::{Orchestrator, OrchestratorConfig, PipelineEvent};
use transport::{ApiClient, HttpTransport};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = cli::Args::parse();

    // Install before any metric is recorded
    let prometheus = if args.metrics {
        Some(metrics::install_recorder()?)
    } else {
        None
    };

    let config_path = Config::resolve_path(args.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        endpoint = %config.api.endpoint,
        keys = config.keys.len(),
        monthly_limit = config.pool.monthly_limit,
        timeout_secs = config.api.timeout_secs,
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.api.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    let transport = HttpTransport::new(http)
        .with_chunk_size(config.api.chunk_size)
        .with_usage_header(&config.api.usage_header)
        .context("invalid usage_header")?;

    let pool = Arc::new(Pool::new(config.keys, config.pool.monthly_limit)?);
    let orchestrator = Orchestrator::new(
        ApiClient::new(Arc::new(transport), config.api.endpoint),
        pool.clone(),
        OrchestratorConfig {
            retry_base: Duration::from_millis(config.api.retry_base_ms),
            ..OrchestratorConfig::default()
        },
    );

    let logger = tokio::spawn(log_events(orchestrator.subscribe()));

    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            ctrl_c_token.cancel();
        }
    });

    let result = orchestrator.run(args.task(), &token).await;

    // Closing the channel ends the logger once it has drained.
    drop(orchestrator);
    if let Err(e) = logger.await {
        warn!(error = %e, "event logger panicked");
    }

    let snapshot = pool.snapshot().await;
    let rendered =
        serde_json::to_string(&snapshot).context("failed to serialize pool snapshot")?;
    info!(status = snapshot.status, pool = %rendered, "pool state");

    if let Some(handle) = prometheus {
        print!("{}", handle.render());
    }

    let result = result.context("compression failed")?;
    tokio::fs::write(&args.output, &result.buffer)
        .await
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    info!(
        output = %args.output.display(),
        compressed_size = result.compressed_size,
        saved_bytes = result.saved_bytes,
        saved_percent = %format!("{:.1}", result.saved_percent),
        "output written"
    );
    Ok(())
}

/// Log pipeline events until the orchestrator is dropped.
async fn log_events(mut events: broadcast::Receiver<PipelineEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::Start {
            task_id,
            source,
            description,
            original_size,
            plan,
        } => info!(%task_id, source = source.label(), %description, original_size = ?original_size, plan, "start"),
        PipelineEvent::Selecting {
            task_id,
            attempt,
            max_attempts,
        } => debug!(%task_id, attempt, max_attempts, "selecting credential"),
        PipelineEvent::Progress {
            task_id,
            stage,
            progress,
            message,
        } => debug!(%task_id, %stage, progress = %format!("{:.0}%", progress * 100.0), %message, "progress"),
        PipelineEvent::QuotaUpdate {
            task_id,
            index,
            used,
            remaining,
            limit,
        } => info!(%task_id, credential = index, used, remaining, limit, "quota"),
        PipelineEvent::KeyError {
            task_id,
            index,
            kind,
            message,
        } => warn!(%task_id, credential = index, kind = kind.label(), %message, "credential disabled"),
        PipelineEvent::Success {
            task_id,
            compressed_size,
            saved_percent,
            attempts,
            ..
        } => info!(%task_id, compressed_size, saved_percent, attempts, "success"),
        PipelineEvent::Error {
            task_id,
            kind,
            message,
            status,
            ..
        } => error!(%task_id, kind = kind.map(|k| k.label()), status = ?status, %message, "failed"),
    }
}
