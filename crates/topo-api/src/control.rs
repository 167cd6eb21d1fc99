//! Control-plane handlers: reconciler operations, routing lookups and
//! the discovery/metrics surfaces.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use topo_metrics::{StatusReport, render_http_sd, render_prometheus};
use topo_proxy::RouteError;
use topo_scheduler::ControllerError;

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response, store_error};

fn controller_error(e: &ControllerError) -> Response {
    match e {
        ControllerError::WorkloadNotFound(_) => error_response(&e.to_string(), StatusCode::NOT_FOUND),
        ControllerError::State(inner) => store_error(inner),
        _ => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

// ── Reconciler ─────────────────────────────────────────────────

/// GET /api/v1/workloads/{name}/plan
pub async fn plan(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.reconciler.plan(&name) {
        Ok(actions) => ApiResponse::ok(actions).into_response(),
        Err(e) => controller_error(&e),
    }
}

/// POST /api/v1/workloads/{name}/retry
pub async fn retry(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.reconciler.retry(&name).await {
        Ok(()) => {
            info!(workload = %name, "retry requested");
            (StatusCode::ACCEPTED, ApiResponse::ok("retry scheduled")).into_response()
        }
        Err(e) => controller_error(&e),
    }
}

#[derive(Serialize)]
struct Purged {
    workload: String,
    deleted: u32,
}

/// POST /api/v1/volumes/{workload}/purge
pub async fn purge_volumes(State(state): State<ApiState>, Path(workload): Path<String>) -> Response {
    match state.reconciler.purge_volumes(&workload).await {
        Ok(deleted) => ApiResponse::ok(Purged { workload, deleted }).into_response(),
        Err(e) => controller_error(&e),
    }
}

// ── Routing ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RouteQuery {
    pub host: String,
    #[serde(default = "root_path")]
    pub path: String,
}

fn root_path() -> String {
    "/".to_string()
}

/// GET /api/v1/route?host=&path=
pub async fn route(State(state): State<ApiState>, Query(q): Query<RouteQuery>) -> Response {
    match state.proxy.ingress().route(&q.host, &q.path) {
        Ok(route) => ApiResponse::ok(route).into_response(),
        Err(e @ RouteError::NotFound { .. }) => error_response(&e.to_string(), StatusCode::NOT_FOUND),
    }
}

/// GET /api/v1/registry
pub async fn registry_snapshot(State(state): State<ApiState>) -> Response {
    let snapshot = state.proxy.registry().snapshot();
    ApiResponse::ok(&*snapshot).into_response()
}

// ── Discovery & metrics ────────────────────────────────────────

/// GET /api/v1/scrape-targets
pub async fn scrape_targets(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.feed.current()).into_response()
}

/// GET /sd/targets
///
/// Bare JSON array, the shape Prometheus `http_sd_configs` expects.
pub async fn http_sd(State(state): State<ApiState>) -> Response {
    Json(render_http_sd(&state.feed.current())).into_response()
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> Response {
    let report = StatusReport::collect(&state.store, &state.feed).unwrap_or_else(|e| {
        warn!(error = %e, "collecting status for /metrics");
        StatusReport::default()
    });
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        render_prometheus(&report),
    )
        .into_response()
}
