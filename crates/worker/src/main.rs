mod observability;
mod runner;
mod scheduler;

use procstats_infra::services::{StatsBackends, StatsServices};
use procstats_infra::{config::AppConfig, logging::init_tracing};
use tokio::sync::watch;
use tracing::info;

use crate::runner::{JobRunner, RunnerSettings};
use crate::scheduler::{ReconcileScheduler, SchedulerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config, "procstats-worker")?;
    if let Err(err) = observability::init_metrics(config.worker_metrics_port) {
        tracing::warn!(error = %err, "metrics exporter not installed");
    }

    let backends = StatsBackends::connect(&config).await?;
    let services = StatsServices::build(&backends, &config)?;

    let runner = JobRunner::new(
        backends.queue.clone(),
        services.recorder.clone(),
        services.reconciliation.clone(),
        RunnerSettings::from_config(&config),
    );
    runner.recover().await?;

    let scheduler = ReconcileScheduler::new(
        backends.queue.clone(),
        backends.store.clone(),
        backends.documents.clone(),
        services.reconciliation.calendar(),
        config.job_defaults(),
        SchedulerSettings::from_config(&config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { runner.run(shutdown).await })
    };
    let scheduler_task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    info!(data_backend = %config.data_backend, "worker started");
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for task in [runner_task, scheduler_task] {
        if let Err(err) = task.await {
            tracing::error!(error = %err, "worker task panicked");
        }
    }
    info!("worker shutdown");
    Ok(())
}
