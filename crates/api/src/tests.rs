use axum::body::{Body, to_bytes};
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode};
use procstats_domain::ports::documents::{DocumentRecord, DocumentStatus};
use procstats_domain::ports::reconciliation::{ReconciliationLog, ReconciliationQuery};
use procstats_infra::config::AppConfig;
use procstats_infra::services::{MemoryHandles, StatsBackends};
use serde_json::{Value, json};
use time::macros::datetime;
use tower_util::ServiceExt;

use crate::observability;
use crate::routes;
use crate::state::AppState;

fn test_app() -> (axum::Router, MemoryHandles) {
    let handles = MemoryHandles::default();
    let backends = StatsBackends::from_memory(&handles);
    let state = AppState::from_backends(AppConfig::for_tests(), &backends).expect("state");
    (routes::router(state), handles)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&body).expect("json")
}

fn result_event(document_id: &str, city_code: &str, result_type: &str, duration: f64) -> Value {
    json!({
        "document_id": document_id,
        "city_code": city_code,
        "result_type": result_type,
        "processing_duration_seconds": duration,
        "processed_at": "2025-01-10T08:15:00Z"
    })
}

async fn record(app: &axum::Router, event: Value) -> Value {
    let response = app
        .clone()
        .oneshot(json_request("POST", "/v1/stats/results", event))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    body_json(response).await
}

fn document(document_id: &str, status: DocumentStatus, auto_approved: bool) -> DocumentRecord {
    DocumentRecord {
        document_id: document_id.to_string(),
        city_code: "TPE".to_string(),
        status,
        auto_approved,
        processing_duration_seconds: Some(20.0),
        processed_at: datetime!(2025-01-10 09:00 UTC),
    }
}

#[tokio::test]
async fn health_reports_environment() {
    let (app, _) = test_app();
    let response = app.oneshot(get_request("/health")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["environment"], "test");
}

#[tokio::test]
async fn ready_checks_the_backend() {
    let (app, _) = test_app();
    let response = app.oneshot(get_request("/ready")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["backend"], "memory");
}

#[tokio::test]
async fn recorded_results_are_aggregated_per_day() {
    let (app, _) = test_app();

    let outcome = record(&app, result_event("doc-1", "TPE", "AUTO_APPROVED", 30.0)).await;
    assert_eq!(outcome["daily"]["status"], "applied");
    assert_eq!(outcome["hourly"]["status"], "applied");
    assert_eq!(outcome["date"], "2025-01-10");
    record(&app, result_event("doc-2", "TPE", "FAILED", 10.0)).await;
    record(&app, result_event("doc-3", "KHH", "MANUAL_REVIEWED", 50.0)).await;

    let response = app
        .clone()
        .oneshot(get_request(
            "/v1/stats/aggregate?start=2025-01-10&end=2025-01-10&granularity=day&cities=TPE",
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["granularity"], "day");
    assert_eq!(body["totals"]["total_processed"], 2);
    assert_eq!(body["metrics"]["success_rate"], 50.0);
    let periods = body["periods"].as_array().expect("periods");
    assert_eq!(periods.len(), 1);
    assert_eq!(periods[0]["period"], "2025-01-10");
    assert_eq!(periods[0]["min_processing_time_seconds"], 10.0);
    assert_eq!(periods[0]["max_processing_time_seconds"], 30.0);

    let response = app
        .oneshot(get_request(
            "/v1/stats/aggregate?start=2025-01-10&end=2025-01-10",
        ))
        .await
        .expect("response");
    let body = body_json(response).await;
    assert_eq!(body["totals"]["total_processed"], 3);
}

#[tokio::test]
async fn invalid_result_body_is_rejected() {
    let (app, _) = test_app();
    let response = app
        .oneshot(json_request(
            "POST",
            "/v1/stats/results",
            result_event("doc-1", "", "AUTO_APPROVED", 1.0),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn unknown_granularity_is_a_validation_error() {
    let (app, _) = test_app();
    let response = app
        .oneshot(get_request(
            "/v1/stats/aggregate?start=2025-01-01&end=2025-01-31&granularity=decade",
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn inverted_range_is_a_validation_error() {
    let (app, _) = test_app();
    let response = app
        .oneshot(get_request("/v1/stats/summary?start=2025-02-01&end=2025-01-01"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn summary_compares_against_previous_period() {
    let (app, _) = test_app();
    record(&app, result_event("doc-1", "TPE", "AUTO_APPROVED", 30.0)).await;
    record(&app, result_event("doc-2", "TPE", "AUTO_APPROVED", 30.0)).await;

    let response = app
        .oneshot(get_request(
            "/v1/stats/summary?start=2025-01-10&end=2025-01-10&cities=TPE,KHH",
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["previous_range"]["start"], "2025-01-09");
    assert_eq!(body["overall"]["current"]["total_processed"], 2);
    assert_eq!(body["overall"]["previous"]["total_processed"], 0);
    assert_eq!(body["overall"]["change"]["total_processed"], 100.0);
    let cities: Vec<&str> = body["cities"]
        .as_array()
        .expect("cities")
        .iter()
        .filter_map(|row| row["city_code"].as_str())
        .collect();
    assert_eq!(cities, vec!["KHH", "TPE"]);
}

#[tokio::test]
async fn manual_reconciliation_corrects_drift_and_is_listed() {
    let (app, handles) = test_app();
    record(&app, result_event("doc-1", "TPE", "AUTO_APPROVED", 20.0)).await;
    handles
        .documents
        .extend([
            document("doc-1", DocumentStatus::Completed, true),
            document("doc-2", DocumentStatus::Completed, false),
            document("doc-3", DocumentStatus::Failed, false),
            document("doc-4", DocumentStatus::Processing, false),
        ])
        .await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/stats/reconciliations")
        .header("content-type", "application/json")
        .header("x-actor-id", "ops-alice")
        .body(Body::from(
            json!({ "city_code": "TPE", "date": "2025-01-10" }).to_string(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    assert_eq!(report["verified"], false);
    assert_eq!(report["corrected"], true);
    let fields: Vec<&str> = report["discrepancies"]
        .as_array()
        .expect("discrepancies")
        .iter()
        .filter_map(|item| item["field"].as_str())
        .collect();
    assert!(fields.contains(&"total_processed"));
    assert!(fields.contains(&"failed"));

    let response = app
        .clone()
        .oneshot(get_request(
            "/v1/stats/aggregate?start=2025-01-10&end=2025-01-10&cities=TPE",
        ))
        .await
        .expect("response");
    let body = body_json(response).await;
    assert_eq!(body["totals"]["total_processed"], 3);
    assert_eq!(body["totals"]["failed"], 1);

    let response = app
        .oneshot(get_request("/v1/stats/reconciliations?city_code=TPE"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let records = body_json(response).await;
    let records = records.as_array().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["audit_id"], report["audit_log_id"]);
    assert_eq!(records[0]["executed_by"], "ops-alice");
    assert_eq!(records[0]["audit_type"], "manual");
}

#[tokio::test]
async fn range_reconciliation_reports_each_day() {
    let (app, _) = test_app();
    let response = app
        .oneshot(json_request(
            "POST",
            "/v1/stats/reconciliations/range",
            json!({ "city_code": "TPE", "start": "2025-01-01", "end": "2025-01-03" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["reports"].as_array().expect("reports").len(), 3);
}

#[tokio::test]
async fn future_reconciliation_is_rejected() {
    let (app, _) = test_app();
    let response = app
        .oneshot(json_request(
            "POST",
            "/v1/stats/reconciliations",
            json!({ "city_code": "TPE", "date": "2999-01-01" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn store_outage_maps_to_unavailable() {
    let (app, handles) = test_app();
    handles.store.set_unavailable(true);

    let response = app
        .clone()
        .oneshot(get_request(
            "/v1/stats/aggregate?start=2025-01-10&end=2025-01-10",
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "temporarily_unavailable");

    let outcome = record(&app, result_event("doc-1", "TPE", "ESCALATED", 5.0)).await;
    assert_eq!(outcome["daily"]["status"], "deferred");
    assert_eq!(handles.queue.pending_jobs().len(), 1);
}

#[tokio::test]
async fn correlation_id_is_echoed() {
    let (app, _) = test_app();
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .header("x-correlation-id", "corr-123")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(
        response
            .headers()
            .get("x-correlation-id")
            .and_then(|value| value.to_str().ok()),
        Some("corr-123")
    );
    assert!(response.headers().get("x-request-id").is_some());
}

#[tokio::test]
async fn oversized_actor_is_rejected_before_reconciling() {
    let (app, handles) = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/stats/reconciliations")
        .header("content-type", "application/json")
        .header("x-actor-id", "a".repeat(65))
        .body(Body::from(
            json!({ "city_code": "TPE", "date": "2025-01-10" }).to_string(),
        ))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let records = handles
        .audit
        .list(&ReconciliationQuery {
            limit: 10,
            ..ReconciliationQuery::default()
        })
        .await
        .expect("audit list");
    assert!(records.is_empty());
}

#[tokio::test]
async fn metrics_endpoint_is_exposed() {
    let _ = observability::init_metrics();
    let (app, _) = test_app();
    record(&app, result_event("doc-1", "TPE", "AUTO_APPROVED", 3.0)).await;

    let response = app
        .oneshot(get_request("/metrics"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("text/plain"))
    );
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = String::from_utf8(body.to_vec()).expect("metrics body");
    assert!(body.contains("procstats_api_http_requests_total"));
    assert!(body.contains("procstats_daily_writes_total"));
}
