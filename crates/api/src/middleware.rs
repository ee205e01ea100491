//! Per-request plumbing: caller context, request ids, spans, limits and
//! route metrics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::middleware::NoOpMiddleware;
use procstats_domain::util::uuid_v7_without_dashes;
use tower_governor::GovernorLayer;
use tower_governor::governor::{GovernorConfig, GovernorConfigBuilder};
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{Span, info_span};

use crate::error::ApiError;
use crate::observability;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const ACTOR_ID_HEADER: &str = "x-actor-id";
const DEFAULT_ACTOR: &str = "operator";
const MAX_ACTOR_LEN: usize = 64;
const MAX_CORRELATION_ID_LEN: usize = 128;
const UNMATCHED_ROUTE: &str = "unmatched";

/// Who is calling and under which correlation id. Present on every request
/// that reaches a handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestContext {
    pub correlation_id: String,
    pub actor: String,
}

impl RequestContext {
    /// A missing correlation id is generated; a missing or blank actor
    /// becomes `operator`.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let correlation_id = match header_text(headers, CORRELATION_ID_HEADER, "correlation id")? {
            None => uuid_v7_without_dashes(),
            Some(value) if value.is_empty() || value.len() > MAX_CORRELATION_ID_LEN => {
                return Err(ApiError::Validation("invalid correlation id".into()));
            }
            Some(value) => value.to_string(),
        };
        let actor = match header_text(headers, ACTOR_ID_HEADER, "actor id")?.map(str::trim) {
            None | Some("") => DEFAULT_ACTOR.to_string(),
            Some(actor) if actor.len() > MAX_ACTOR_LEN => {
                return Err(ApiError::Validation("actor id too long".into()));
            }
            Some(actor) => actor.to_string(),
        };
        Ok(Self {
            correlation_id,
            actor,
        })
    }
}

fn header_text<'a>(
    headers: &'a HeaderMap,
    name: &str,
    label: &str,
) -> Result<Option<&'a str>, ApiError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| ApiError::Validation(format!("invalid {label}")))
        })
        .transpose()
}

/// Resolves the [`RequestContext`] and echoes the correlation id back.
pub async fn request_context(mut req: Request<Body>, next: Next) -> Response {
    let context = match RequestContext::from_headers(req.headers()) {
        Ok(context) => context,
        Err(err) => return err.into_response(),
    };
    let echoed = HeaderValue::from_str(&context.correlation_id).ok();
    req.extensions_mut().insert(context);

    let mut response = next.run(req).await;
    if let Some(value) = echoed {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

/// Dashless UUIDv7, the same shape as job and correlation ids.
#[derive(Clone, Copy)]
pub struct CompactRequestId;

impl MakeRequestId for CompactRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&uuid_v7_without_dashes())
            .ok()
            .map(RequestId::new)
    }
}

pub fn set_request_id_layer() -> SetRequestIdLayer<CompactRequestId> {
    SetRequestIdLayer::x_request_id(CompactRequestId)
}

pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::x_request_id()
}

type SpanFn = fn(&Request<Body>) -> Span;

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, SpanFn> {
    TraceLayer::new_for_http().make_span_with(http_span as SpanFn)
}

fn http_span(req: &Request<Body>) -> Span {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .unwrap_or("-");
    let (correlation_id, actor) = req
        .extensions()
        .get::<RequestContext>()
        .map(|context| (context.correlation_id.as_str(), context.actor.as_str()))
        .unwrap_or(("-", "-"));
    info_span!(
        "http_request",
        method = %req.method(),
        route = route_label(req),
        request_id,
        correlation_id,
        actor
    )
}

pub fn timeout_layer(timeout_ms: u64) -> TimeoutLayer {
    TimeoutLayer::new(Duration::from_millis(timeout_ms.max(1)))
}

/// Per-peer-IP token bucket.
pub fn rate_limit_layer(
    per_second: u64,
    burst: u32,
) -> GovernorLayer<PeerIpKeyExtractor, NoOpMiddleware> {
    let config = GovernorConfigBuilder::default()
        .per_second(per_second.max(1))
        .burst_size(burst.max(1))
        .finish();
    let config = config.unwrap_or_else(|| {
        tracing::warn!(per_second, burst, "rate limit settings rejected; using defaults");
        GovernorConfig::default()
    });
    GovernorLayer {
        config: Arc::new(config),
    }
}

/// Records latency per matched route template. Unmatched paths share one label.
pub async fn route_metrics(req: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let route = route_label(&req).to_string();
    let response = next.run(req).await;
    observability::register_http_request(
        method.as_str(),
        &route,
        response.status(),
        started.elapsed(),
    );
    response
}

fn route_label<B>(req: &Request<B>) -> &str {
    req.extensions()
        .get::<MatchedPath>()
        .map(MatchedPath::as_str)
        .unwrap_or(UNMATCHED_ROUTE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_defaults_actor_and_generates_correlation() {
        let context = RequestContext::from_headers(&HeaderMap::new()).unwrap();
        assert_eq!(context.actor, "operator");
        assert_eq!(context.correlation_id.len(), 32);

        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_ID_HEADER, " ops-alice ".parse().unwrap());
        headers.insert(CORRELATION_ID_HEADER, "corr-123".parse().unwrap());
        let context = RequestContext::from_headers(&headers).unwrap();
        assert_eq!(context.actor, "ops-alice");
        assert_eq!(context.correlation_id, "corr-123");
    }

    #[test]
    fn oversized_ids_are_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_ID_HEADER, "a".repeat(MAX_ACTOR_LEN + 1).parse().unwrap());
        assert!(RequestContext::from_headers(&headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(CORRELATION_ID_HEADER, "".parse().unwrap());
        assert!(RequestContext::from_headers(&headers).is_err());
    }
}
