//! HTTP read surface.
//!
//! - `GET /users/:owner_id/natal-chart` - the caller's own chart
//! - `GET /health` - provider readiness
//! - `GET /metrics` - Prometheus text, when a recorder is installed
//!
//! Authentication happens upstream; the authorizer forwards the caller's
//! identity in the `x-authenticated-user` header.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, instrument};

use crate::chart::ChartEngine;
use crate::ephemeris::Readiness;
use crate::store::ChartGateway;
use crate::ChartError;

pub const CALLER_HEADER: &str = "x-authenticated-user";

pub const METRICS_PATH: &str = "/metrics";

#[derive(Clone)]
pub struct ApiState {
    pub engine: ChartEngine,
    pub gateway: ChartGateway,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: ApiState) -> Router {
    let metrics_route = match &state.metrics {
        Some(handle) => Router::new()
            .route(METRICS_PATH, get(render_metrics))
            .with_state(handle.clone()),
        None => Router::new(),
    };

    Router::new()
        .route("/users/:owner_id/natal-chart", get(get_natal_chart))
        .route("/health", get(health))
        .with_state(Arc::new(state))
        .merge(metrics_route)
        .fallback(fallback)
}

impl IntoResponse for ChartError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChartError::MissingOwner => StatusCode::BAD_REQUEST,
            ChartError::Forbidden => StatusCode::FORBIDDEN,
            ChartError::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "chart request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn caller(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(CALLER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// GET /users/:owner_id/natal-chart
#[instrument(skip(state, headers))]
async fn get_natal_chart(
    State(state): State<Arc<ApiState>>,
    Path(owner_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    match state.gateway.get(&owner_id, caller(&headers)).await {
        Ok(chart) => (StatusCode::OK, Json(chart)).into_response(),
        Err(err) => err.into_response(),
    }
}

/// An empty owner segment (`/users//natal-chart`) never reaches the chart
/// route; it is still a missing owner, not an unknown path.
async fn fallback(uri: Uri) -> Response {
    let blank_owner = uri
        .path()
        .strip_prefix("/users/")
        .and_then(|rest| rest.strip_suffix("/natal-chart"))
        .is_some_and(|owner| owner.trim_matches('/').trim().is_empty());
    if blank_owner {
        return ChartError::MissingOwner.into_response();
    }
    (StatusCode::NOT_FOUND, Json(json!({ "error": "no such route" }))).into_response()
}

/// GET /metrics
async fn render_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    provider: &'static str,
    readiness: Readiness,
}

/// GET /health
async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let provider = state.engine.provider();
    let readiness = provider.readiness();
    let status = if readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            provider: provider.name(),
            readiness,
        }),
    )
}
