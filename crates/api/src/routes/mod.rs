use axum::extract::{Extension, Query, State};
use axum::{
    Json, Router,
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use procstats_domain::{
    aggregation::{AggregatedStats, CitySummary},
    ports::reconciliation::ReconciliationQuery,
    reconciliation::{AuditType, ReconciliationRecord, ReconciliationReport},
    recording::RecordOutcome,
    stats::{CityFilter, DateRange, Granularity, ProcessingResultEvent, ResultType},
};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use validator::Validate;

use crate::middleware::RequestContext;
use crate::{
    error::ApiError, middleware as app_middleware, observability, state::AppState, validation,
};

const MAX_FILTER_CITIES: usize = 200;

pub fn router(state: AppState) -> Router {
    let stats = Router::new()
        .route("/v1/stats/results", post(record_result))
        .route("/v1/stats/aggregate", get(aggregate))
        .route("/v1/stats/summary", get(summary))
        .route(
            "/v1/stats/reconciliations",
            post(reconcile_day).get(list_reconciliations),
        )
        .route("/v1/stats/reconciliations/range", post(reconcile_range));

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .merge(stats)
        .layer(middleware::from_fn(app_middleware::route_metrics))
        .layer(app_middleware::timeout_layer(state.config.request_timeout_ms))
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn(app_middleware::request_context));

    if !state.config.is_test() {
        app = app.layer(app_middleware::rate_limit_layer(
            state.config.rate_limit_per_second,
            state.config.rate_limit_burst,
        ));
    }

    app.with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
    })
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    backend: &'static str,
}

async fn ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>, ApiError> {
    state.db.health_check().await.map_err(|err| {
        tracing::warn!(error = %err, backend = state.db.name(), "readiness check failed");
        ApiError::Unavailable(err.to_string())
    })?;
    Ok(Json(ReadyResponse {
        status: "ready",
        backend: state.db.name(),
    }))
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => ApiError::Unavailable("metrics recorder not installed".into()).into_response(),
    }
}

#[derive(Debug, Deserialize, Validate)]
struct RecordResultRequest {
    #[validate(length(min = 1, max = 128))]
    document_id: String,
    #[validate(length(min = 1, max = 32))]
    city_code: String,
    result_type: ResultType,
    processing_duration_seconds: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    processed_at: OffsetDateTime,
}

impl From<RecordResultRequest> for ProcessingResultEvent {
    fn from(request: RecordResultRequest) -> Self {
        Self {
            document_id: request.document_id,
            city_code: request.city_code,
            result_type: request.result_type,
            processing_duration_seconds: request.processing_duration_seconds,
            processed_at: request.processed_at,
        }
    }
}

async fn record_result(
    State(state): State<AppState>,
    Json(payload): Json<RecordResultRequest>,
) -> Result<(StatusCode, Json<RecordOutcome>), ApiError> {
    validation::validate(&payload)?;
    let event = ProcessingResultEvent::from(payload);
    let outcome = state.recorder.record_processing_result(&event).await;
    observability::register_record_outcome(&outcome);
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

#[derive(Debug, Deserialize)]
struct AggregateQuery {
    start: String,
    end: String,
    granularity: Option<String>,
    cities: Option<String>,
}

async fn aggregate(
    State(state): State<AppState>,
    Query(query): Query<AggregateQuery>,
) -> Result<Json<AggregatedStats>, ApiError> {
    let range = parse_range(&query.start, &query.end)?;
    let granularity = query
        .granularity
        .as_deref()
        .unwrap_or("day")
        .parse::<Granularity>()?;
    let filter = parse_city_filter(query.cities.as_deref())?;
    let stats = state
        .aggregation
        .get_aggregated_stats(&filter, &range, granularity)
        .await?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    start: String,
    end: String,
    cities: Option<String>,
}

async fn summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<CitySummary>, ApiError> {
    let range = parse_range(&query.start, &query.end)?;
    let filter = parse_city_filter(query.cities.as_deref())?;
    let summary = state.aggregation.get_city_summary(&filter, &range).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize, Validate)]
struct ReconcileDayRequest {
    #[validate(length(min = 1, max = 32))]
    city_code: String,
    date: String,
}

async fn reconcile_day(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Json(payload): Json<ReconcileDayRequest>,
) -> Result<Json<ReconciliationReport>, ApiError> {
    validation::validate(&payload)?;
    let date = parse_date("date", &payload.date)?;
    tracing::info!(
        city_code = %payload.city_code,
        %date,
        actor = %context.actor,
        correlation_id = %context.correlation_id,
        "manual reconciliation requested"
    );
    let report = state
        .reconciliation
        .verify_and_reconcile(&payload.city_code, date, AuditType::Manual, &context.actor)
        .await?;
    observability::register_reconciliation(AuditType::Manual.as_str(), &report);
    Ok(Json(report))
}

#[derive(Debug, Deserialize, Validate)]
struct ReconcileRangeRequest {
    #[validate(length(min = 1, max = 32))]
    city_code: String,
    start: String,
    end: String,
}

#[derive(Serialize)]
struct ReconcileRangeResponse {
    city_code: String,
    start: Date,
    end: Date,
    reports: Vec<ReconciliationReport>,
}

async fn reconcile_range(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    Json(payload): Json<ReconcileRangeRequest>,
) -> Result<Json<ReconcileRangeResponse>, ApiError> {
    validation::validate(&payload)?;
    let range = parse_range(&payload.start, &payload.end)?;
    let reports = state
        .reconciliation
        .verify_range(
            &payload.city_code,
            range.start,
            range.end,
            AuditType::Manual,
            &context.actor,
        )
        .await?;
    for report in &reports {
        observability::register_reconciliation(AuditType::Manual.as_str(), report);
    }
    Ok(Json(ReconcileRangeResponse {
        city_code: payload.city_code,
        start: range.start,
        end: range.end,
        reports,
    }))
}

#[derive(Debug, Deserialize)]
struct ReconciliationListQuery {
    city_code: Option<String>,
    start: Option<String>,
    end: Option<String>,
    limit: Option<usize>,
}

async fn list_reconciliations(
    State(state): State<AppState>,
    Query(query): Query<ReconciliationListQuery>,
) -> Result<Json<Vec<ReconciliationRecord>>, ApiError> {
    let query = ReconciliationQuery {
        city_code: query
            .city_code
            .map(|city| city.trim().to_string())
            .filter(|city| !city.is_empty()),
        start: query
            .start
            .as_deref()
            .map(|value| parse_date("start", value))
            .transpose()?,
        end: query
            .end
            .as_deref()
            .map(|value| parse_date("end", value))
            .transpose()?,
        limit: query.limit.unwrap_or_default(),
    };
    let records = state.reconciliation.list_records(&query).await?;
    Ok(Json(records))
}

fn parse_date(field: &str, value: &str) -> Result<Date, ApiError> {
    Date::parse(value.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|err| ApiError::Validation(format!("invalid {field} '{value}': {err}")))
}

fn parse_range(start: &str, end: &str) -> Result<DateRange, ApiError> {
    let start = parse_date("start", start)?;
    let end = parse_date("end", end)?;
    Ok(DateRange::new(start, end)?)
}

/// Absent or blank means every city.
fn parse_city_filter(cities: Option<&str>) -> Result<CityFilter, ApiError> {
    let Some(raw) = cities.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(CityFilter::All);
    };
    let cities: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|city| !city.is_empty())
        .collect();
    if cities.len() > MAX_FILTER_CITIES {
        return Err(ApiError::Validation(format!(
            "at most {MAX_FILTER_CITIES} cities per request"
        )));
    }
    Ok(CityFilter::only(cities))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn blank_city_filter_means_all() {
        assert_eq!(parse_city_filter(None).unwrap(), CityFilter::All);
        assert_eq!(parse_city_filter(Some("  ")).unwrap(), CityFilter::All);
        assert_eq!(
            parse_city_filter(Some("TPE, KHH,,")).unwrap(),
            CityFilter::only(["TPE", "KHH"])
        );
    }

    #[test]
    fn dates_are_calendar_days() {
        assert_eq!(parse_date("date", "2025-01-31").unwrap(), date!(2025 - 01 - 31));
        assert!(parse_date("date", "2025-02-30").is_err());
        assert!(parse_date("date", "31/01/2025").is_err());
    }
}
