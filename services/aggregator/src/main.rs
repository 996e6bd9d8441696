use aggregator::config::ServiceConfig;
use aggregator::{service, SERVICE_VERSION};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(version = SERVICE_VERSION, "Starting aggregator");

    let mut running = service::start(config).await?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
        }
        stopped = running.stopped_unexpectedly() => match stopped {
            service::Unexpected::Ingestion => tracing::error!("Ingestion stopped unexpectedly"),
            service::Unexpected::Pipelines => tracing::error!("Every pipeline has halted"),
        },
    }

    let report = running.shutdown().await;
    for (name, value) in &report.metrics {
        tracing::info!(metric = %name, value, "Final metric");
    }
    tracing::info!(
        stopped = report.pipelines.stopped.len(),
        halted = report.pipelines.halted.len(),
        last_offset = ?report.last_offset,
        "Aggregator stopped"
    );

    if let Some(err) = report.ingestion_error {
        anyhow::bail!("ingestion failed: {err}");
    }
    if report.pipelines.all_halted() {
        anyhow::bail!("all delivery pipelines halted");
    }
    Ok(())
}
