//! topo-api — REST API for topo.
//!
//! Provides axum route handlers over the resource store, the reconciler,
//! the service registry, the ingress router and the discovery feed.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/apply` | Apply one document or a list of documents |
//! | GET | `/api/v1/workloads` | List workloads |
//! | GET | `/api/v1/workloads/{name}` | Workload spec and status |
//! | DELETE | `/api/v1/workloads/{name}` | Delete a workload (teardown follows) |
//! | GET | `/api/v1/workloads/{name}/members` | Members of a workload |
//! | GET | `/api/v1/workloads/{name}/volumes` | Volumes of a workload |
//! | GET | `/api/v1/workloads/{name}/status` | Reconciliation status |
//! | GET | `/api/v1/workloads/{name}/plan` | Actions the next pass would take |
//! | POST | `/api/v1/workloads/{name}/retry` | Re-trigger a Degraded workload |
//! | GET | `/api/v1/members` | All members |
//! | GET | `/api/v1/volumes` | All volumes |
//! | POST | `/api/v1/volumes/{workload}/purge` | Delete released volumes |
//! | GET | `/api/v1/status` | Status of every workload |
//! | GET | `/api/v1/services` | List services |
//! | GET/DELETE | `/api/v1/services/{name}` | Service record and resolved addresses |
//! | GET | `/api/v1/ingress` | List ingress rules |
//! | GET/DELETE | `/api/v1/ingress/{name}` | One ingress rule |
//! | GET | `/api/v1/route?host=&path=` | Route a request |
//! | GET | `/api/v1/registry` | Registry snapshot |
//! | GET | `/api/v1/scrape-targets` | Current scrape targets |
//! | GET | `/sd/targets` | Prometheus HTTP service discovery |
//! | GET | `/metrics` | Prometheus exposition |

pub mod control;
pub mod handlers;

use axum::Router;
use axum::routing::{get, post};

use topo_metrics::DiscoveryFeed;
use topo_proxy::ProxySync;
use topo_scheduler::Reconciler;
use topo_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub reconciler: Reconciler,
    pub proxy: ProxySync,
    pub feed: DiscoveryFeed,
}

/// Build the complete API router (REST + discovery + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/apply", post(handlers::apply))
        .route("/workloads", get(handlers::list_workloads))
        .route(
            "/workloads/{name}",
            get(handlers::get_workload).delete(handlers::delete_workload),
        )
        .route("/workloads/{name}/members", get(handlers::list_members))
        .route("/workloads/{name}/volumes", get(handlers::list_volumes))
        .route("/workloads/{name}/status", get(handlers::get_status))
        .route("/workloads/{name}/plan", get(control::plan))
        .route("/workloads/{name}/retry", post(control::retry))
        .route("/members", get(handlers::list_all_members))
        .route("/volumes", get(handlers::list_all_volumes))
        .route("/volumes/{workload}/purge", post(control::purge_volumes))
        .route("/status", get(handlers::list_statuses))
        .route("/services", get(handlers::list_services))
        .route(
            "/services/{name}",
            get(handlers::get_service).delete(handlers::delete_service),
        )
        .route("/ingress", get(handlers::list_ingress))
        .route(
            "/ingress/{name}",
            get(handlers::get_ingress).delete(handlers::delete_ingress),
        )
        .route("/route", get(control::route))
        .route("/registry", get(control::registry_snapshot))
        .route("/scrape-targets", get(control::scrape_targets));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/sd/targets", get(control::http_sd))
        .route("/metrics", get(control::prometheus_metrics))
        .with_state(state)
}
