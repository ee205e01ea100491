use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use procstats_domain::reconciliation::ReconciliationReport;
use procstats_domain::recording::{DailyWriteStatus, HourlyWriteStatus, RecordOutcome};

const HTTP_REQUESTS_TOTAL: &str = "procstats_api_http_requests_total";
const HTTP_REQUEST_DURATION_SECONDS: &str = "procstats_api_http_request_duration_seconds";
const HTTP_REQUEST_ERRORS_TOTAL: &str = "procstats_api_http_errors_total";
const DAILY_WRITES_TOTAL: &str = "procstats_daily_writes_total";
const HOURLY_WRITES_TOTAL: &str = "procstats_hourly_writes_total";
const RECONCILIATIONS_TOTAL: &str = "procstats_reconciliations_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

pub fn register_http_request(method: &str, route: &str, status: StatusCode, elapsed: Duration) {
    let status_code = status.as_u16().to_string();
    let result = if status.is_server_error() {
        "error"
    } else {
        "success"
    };

    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status_code.clone(),
        "result" => result
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status_code.clone()
    )
    .record(elapsed.as_secs_f64());

    if status.is_server_error() {
        counter!(
            HTTP_REQUEST_ERRORS_TOTAL,
            "method" => method.to_string(),
            "route" => route.to_string(),
            "status" => status_code
        )
        .increment(1);
    }
}

/// Daily writes are labelled by the path that landed them, or by why they did not land.
pub fn register_record_outcome(outcome: &RecordOutcome) {
    let path = match &outcome.daily {
        DailyWriteStatus::Applied { path, .. } => path.as_str(),
        DailyWriteStatus::Deferred { .. } => "deferred",
        DailyWriteStatus::LoggedForReplay { .. } => "logged_for_replay",
        DailyWriteStatus::Rejected { .. } => "rejected",
    };
    counter!(DAILY_WRITES_TOTAL, "path" => path).increment(1);

    let result = match outcome.hourly {
        HourlyWriteStatus::Applied => "applied",
        HourlyWriteStatus::Skipped { .. } => "skipped",
    };
    counter!(HOURLY_WRITES_TOTAL, "result" => result).increment(1);
}

pub fn register_reconciliation(audit_type: &'static str, report: &ReconciliationReport) {
    let outcome = match (report.verified, report.corrected) {
        (true, false) => "clean",
        (true, true) => "seeded",
        (false, true) => "corrected",
        (false, false) => "uncorrected",
    };
    counter!(
        RECONCILIATIONS_TOTAL,
        "audit_type" => audit_type,
        "outcome" => outcome
    )
    .increment(1);
}
