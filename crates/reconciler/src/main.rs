use std::sync::Arc;

use anyhow::Context;

use stockflow_infra::config::ReconcilerConfig;
use stockflow_reconciler::services::{build_services, prune_markers_periodically};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockflow_observability::init();

    let config = ReconcilerConfig::from_env().context("invalid reconciler configuration")?;
    let services = Arc::new(build_services(&config).await?);

    let worker = services
        .start(config.worker_config())
        .context("failed to start reconciliation worker")?;

    let pruner = tokio::spawn(prune_markers_periodically(
        Arc::clone(&services),
        config.marker_retention,
        config.marker_prune_interval,
    ));

    tracing::info!(
        mode = services.mode(),
        consumer = %config.consumer_name,
        shards = config.shards,
        "reconciler running"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    pruner.abort();

    let stats = tokio::task::spawn_blocking(move || worker.shutdown())
        .await
        .context("worker shutdown panicked")?;

    tracing::info!(
        received = stats.received,
        acked = stats.acked,
        redelivered = stats.redelivered,
        dead_lettered = stats.dead_lettered,
        "reconciler stopped"
    );
    Ok(())
}
