//! `load-probe`: pushes a synthetic batch through the retry + concurrency-limit
//! stack and prints the final manager status as JSON.
//!
//! ```text
//! load-probe --max-concurrency 4 --operations 40 --failure-rate 0.3
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::future::join_all;
use resilience_core::{OperationFailure, RetryPolicy};
use resilience_runtime::{
    resilient_service_from_registry, ConcurrencyConfig, ResilienceConfig, ResilienceRegistry,
};
use tower::ServiceExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "load-probe", about = "Exercise the concurrency limit and retry stack")]
struct CliArgs {
    /// Operations allowed to run at once.
    #[arg(long, env = "RESILIENCE_MAX_CONCURRENCY", default_value_t = 4)]
    max_concurrency: usize,

    /// How long an operation may wait for a permit.
    #[arg(long, env = "RESILIENCE_QUEUE_TIMEOUT_MS", default_value_t = 60_000)]
    queue_timeout_ms: u64,

    /// Number of synthetic operations in the batch.
    #[arg(long, default_value_t = 20)]
    operations: usize,

    /// Simulated work per attempt.
    #[arg(long, default_value_t = 50)]
    operation_ms: u64,

    /// Probability in [0, 1] that an attempt fails with a retryable 503.
    #[arg(long, default_value_t = 0.2)]
    failure_rate: f64,

    #[arg(long, env = "RESILIENCE_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    #[arg(long, env = "RESILIENCE_BASE_DELAY_MS", default_value_t = 100)]
    base_delay_ms: u64,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.json_logs)?;

    let config = ResilienceConfig {
        concurrency: ConcurrencyConfig {
            max_concurrency: args.max_concurrency,
            queue_timeout_ms: args.queue_timeout_ms,
            enable_metrics: true,
        },
        retry: RetryPolicy {
            max_attempts: args.max_attempts,
            base_delay_ms: args.base_delay_ms,
            ..RetryPolicy::default()
        },
    };
    let registry = ResilienceRegistry::configure(&config).context("invalid configuration")?;
    registry.init_all().await?;

    let work = Duration::from_millis(args.operation_ms);
    let failure_rate = args.failure_rate.clamp(0.0, 1.0);
    let backend = tower::service_fn(move |id: usize| async move {
        tokio::time::sleep(work).await;
        if rand::random::<f64>() < failure_rate {
            Err(anyhow::Error::new(
                OperationFailure::new(format!("operation {id} unavailable")).with_status(503),
            ))
        } else {
            Ok(id)
        }
    });
    let service = resilient_service_from_registry::<_, anyhow::Error>(backend, &registry)
        .context("registry is missing resilience components")?;

    tracing::info!(
        operations = args.operations,
        max_concurrency = args.max_concurrency,
        failure_rate,
        "starting load probe"
    );
    let results = join_all((0..args.operations).map(|id| service.clone().oneshot(id))).await;
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    tracing::info!(
        succeeded,
        failed = results.len() - succeeded,
        "load probe finished"
    );

    let manager = registry
        .concurrency_manager()
        .context("registry is missing the concurrency manager")?;
    println!("{}", serde_json::to_string_pretty(&manager.status())?);

    registry.shutdown_all().await
}

/// Installs the global subscriber. Logs go to stderr so stdout carries only
/// the status document.
fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}
