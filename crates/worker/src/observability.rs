use std::net::SocketAddr;

use anyhow::Result;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use procstats_domain::ports::jobs::QueueSnapshot;

const JOBS_PROCESSED_TOTAL: &str = "procstats_worker_jobs_processed_total";
const JOBS_PROCESSING_DURATION_MS: &str = "procstats_worker_job_processing_duration_ms";
const JOBS_SCHEDULED_TOTAL: &str = "procstats_worker_jobs_scheduled_total";
const QUEUE_READY_GAUGE: &str = "procstats_worker_queue_ready_total";
const QUEUE_DELAYED_GAUGE: &str = "procstats_worker_queue_delayed_total";
const QUEUE_PROCESSING_GAUGE: &str = "procstats_worker_queue_processing_total";
const QUEUE_LAG_GAUGE: &str = "procstats_worker_queue_lag_ms";
const RECONCILIATIONS_TOTAL: &str = "procstats_reconciliations_total";

/// Serves the Prometheus scrape endpoint on `port`; `0` installs no exporter.
pub fn init_metrics(port: u16) -> Result<()> {
    if port == 0 {
        return Ok(());
    }
    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .install()?;
    tracing::info!(port, "worker metrics exporter listening");
    Ok(())
}

pub fn register_job_processed(job_type: &str, result: &'static str, duration_ms: f64) {
    counter!(
        JOBS_PROCESSED_TOTAL,
        "job_type" => job_type.to_string(),
        "result" => result
    )
    .increment(1);

    histogram!(
        JOBS_PROCESSING_DURATION_MS,
        "job_type" => job_type.to_string()
    )
    .record(duration_ms);
}

pub fn register_jobs_scheduled(count: usize) {
    counter!(JOBS_SCHEDULED_TOTAL).increment(count as u64);
}

pub fn register_reconciliation(verified: bool, corrected: bool) {
    let outcome = match (verified, corrected) {
        (true, false) => "clean",
        (true, true) => "seeded",
        (false, true) => "corrected",
        (false, false) => "uncorrected",
    };
    counter!(
        RECONCILIATIONS_TOTAL,
        "audit_type" => "scheduled",
        "outcome" => outcome
    )
    .increment(1);
}

pub fn set_queue_snapshot(snapshot: &QueueSnapshot, now_ms: i64) {
    gauge!(QUEUE_READY_GAUGE).set(snapshot.ready as f64);
    gauge!(QUEUE_DELAYED_GAUGE).set(snapshot.delayed as f64);
    gauge!(QUEUE_PROCESSING_GAUGE).set(snapshot.processing as f64);
    let lag_ms = snapshot
        .oldest_delayed_ms
        .map_or(0, |run_at_ms| now_ms.saturating_sub(run_at_ms));
    gauge!(QUEUE_LAG_GAUGE).set(lag_ms.max(0) as f64);
}
