//! REST API handlers for desired state and observed records.
//!
//! Each handler reads/writes via `StateStore` and returns JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::info;

use topo_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Map a store error onto a status code: rejected input is the caller's
/// fault, everything else is ours.
pub(crate) fn store_error(e: &StateError) -> Response {
    let status = match e {
        StateError::Invalid(_) | StateError::Manifest(_) => StatusCode::BAD_REQUEST,
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

fn found<T: Serialize>(result: StateResult<Option<T>>, what: &str) -> Response {
    match result {
        Ok(Some(value)) => ApiResponse::ok(value).into_response(),
        Ok(None) => error_response(&format!("{what} not found"), StatusCode::NOT_FOUND),
        Err(e) => store_error(&e),
    }
}

fn listed<T: Serialize>(result: StateResult<Vec<T>>) -> Response {
    match result {
        Ok(items) => ApiResponse::ok(items).into_response(),
        Err(e) => store_error(&e),
    }
}

// ── Apply ──────────────────────────────────────────────────────

/// Apply body: a single document or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum ApplyRequest {
    Many(Vec<Document>),
    One(Document),
}

#[derive(Debug, Serialize)]
pub struct Applied {
    pub kind: DocumentKind,
    pub name: String,
    pub outcome: ApplyOutcome,
}

/// POST /api/v1/apply
pub async fn apply(State(state): State<ApiState>, Json(req): Json<ApplyRequest>) -> Response {
    let docs = match req {
        ApplyRequest::Many(docs) => docs,
        ApplyRequest::One(doc) => vec![doc],
    };
    match state.store.apply_all(&docs) {
        Ok(results) => {
            let applied: Vec<Applied> = results
                .into_iter()
                .map(|(doc, outcome)| {
                    let key = doc.key();
                    Applied {
                        kind: key.kind,
                        name: key.name,
                        outcome,
                    }
                })
                .collect();
            info!(documents = applied.len(), "documents applied via API");
            ApiResponse::ok(applied).into_response()
        }
        Err(e) => store_error(&e),
    }
}

// ── Workloads ──────────────────────────────────────────────────

#[derive(Serialize)]
struct WorkloadView {
    spec: WorkloadSpec,
    status: Option<WorkloadStatus>,
}

/// GET /api/v1/workloads
pub async fn list_workloads(State(state): State<ApiState>) -> Response {
    listed(state.store.list_workloads())
}

/// GET /api/v1/workloads/{name}
pub async fn get_workload(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let view = state.store.get_workload(&name).and_then(|spec| {
        spec.map(|spec| {
            state
                .store
                .get_status(&name)
                .map(|status| WorkloadView { spec, status })
        })
        .transpose()
    });
    found(view, "workload")
}

/// DELETE /api/v1/workloads/{name}
///
/// Teardown runs asynchronously in the reconciler; members disappear
/// shortly after the response.
pub async fn delete_workload(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.store.delete_workload(&name) {
        Ok(true) => (StatusCode::ACCEPTED, ApiResponse::ok("teardown scheduled")).into_response(),
        Ok(false) => error_response("workload not found", StatusCode::NOT_FOUND),
        Err(e) => store_error(&e),
    }
}

/// GET /api/v1/workloads/{name}/members
pub async fn list_members(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    listed(state.store.list_members(&name))
}

/// GET /api/v1/workloads/{name}/volumes
pub async fn list_volumes(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    listed(state.store.list_volumes(&name))
}

/// GET /api/v1/workloads/{name}/status
pub async fn get_status(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    found(state.store.get_status(&name), "status")
}

/// GET /api/v1/members
pub async fn list_all_members(State(state): State<ApiState>) -> Response {
    listed(state.store.list_all_members())
}

/// GET /api/v1/volumes
pub async fn list_all_volumes(State(state): State<ApiState>) -> Response {
    listed(state.store.list_all_volumes())
}

/// GET /api/v1/status
pub async fn list_statuses(State(state): State<ApiState>) -> Response {
    listed(state.store.list_statuses())
}

// ── Services ───────────────────────────────────────────────────

#[derive(Serialize)]
struct ServiceDetail {
    #[serde(flatten)]
    record: ServiceRecord,
    addresses: Vec<String>,
}

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> Response {
    listed(state.store.list_services())
}

/// GET /api/v1/services/{name}
pub async fn get_service(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let detail = state.store.get_service(&name).map(|record| {
        record.map(|record| ServiceDetail {
            addresses: state.proxy.registry().resolve(&name).unwrap_or_default(),
            record,
        })
    });
    found(detail, "service")
}

/// DELETE /api/v1/services/{name}
pub async fn delete_service(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.store.delete_service(&name) {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => error_response("service not found", StatusCode::NOT_FOUND),
        Err(e) => store_error(&e),
    }
}

// ── Ingress ────────────────────────────────────────────────────

/// GET /api/v1/ingress
pub async fn list_ingress(State(state): State<ApiState>) -> Response {
    listed(state.store.list_ingress())
}

/// GET /api/v1/ingress/{name}
pub async fn get_ingress(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    found(state.store.get_ingress(&name), "ingress rule")
}

/// DELETE /api/v1/ingress/{name}
pub async fn delete_ingress(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.store.delete_ingress(&name) {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => error_response("ingress rule not found", StatusCode::NOT_FOUND),
        Err(e) => store_error(&e),
    }
}
