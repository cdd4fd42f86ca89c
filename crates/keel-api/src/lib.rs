//! keel-api — REST API for keel.
//!
//! Every terminal run, sync pass and scaling decision is queryable here,
//! along with the manifest repository and its history. Triggers, operator
//! cancellation, manual edits and manual sync go through the same
//! components the control loops use.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/runs?workload=&limit=` | List runs, newest first |
//! | GET | `/api/v1/runs/{id}` | Run detail |
//! | POST | `/api/v1/workloads/{workload}/revisions` | Trigger a revision |
//! | POST | `/api/v1/workloads/{workload}/cancel` | Cancel the active run |
//! | GET | `/api/v1/manifests` | Current manifests |
//! | GET | `/api/v1/manifests/{workload}` | Current manifest and version |
//! | PUT | `/api/v1/manifests/{workload}` | Compare-and-swap write; the artifact must exist |
//! | GET | `/api/v1/manifests/{workload}/history` | Every committed version |
//! | GET | `/api/v1/sync` | Status of every sync set |
//! | POST | `/api/v1/sync/{set}` | Request a manual sync |
//! | GET | `/api/v1/sync/{set}/records` | Sync history |
//! | GET | `/api/v1/scaling/{workload}/decisions` | Scaling decisions |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use keel_gateway::ArtifactStore;
use keel_pipeline::Dispatcher;
use keel_reconcile::Reconciler;
use keel_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    /// Manual manifest writes must reference an artifact held here.
    pub artifacts: Arc<dyn ArtifactStore>,
    pub dispatcher: Arc<Dispatcher>,
    /// Reconcilers by set name.
    pub reconcilers: Arc<BTreeMap<String, Arc<Reconciler>>>,
}

impl ApiState {
    pub fn new(
        store: StateStore,
        artifacts: Arc<dyn ArtifactStore>,
        dispatcher: Arc<Dispatcher>,
        reconcilers: impl IntoIterator<Item = Arc<Reconciler>>,
    ) -> Self {
        let reconcilers = reconcilers
            .into_iter()
            .map(|r| (r.set().name.clone(), r))
            .collect();
        Self {
            store,
            artifacts,
            dispatcher,
            reconcilers: Arc::new(reconcilers),
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/runs", get(handlers::list_runs))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/workloads/{workload}/revisions", post(handlers::trigger_revision))
        .route("/workloads/{workload}/cancel", post(handlers::cancel_run))
        .route("/manifests", get(handlers::list_manifests))
        .route(
            "/manifests/{workload}",
            get(handlers::get_manifest).put(handlers::put_manifest),
        )
        .route("/manifests/{workload}/history", get(handlers::manifest_history))
        .route("/sync", get(handlers::list_sync_sets))
        .route("/sync/{set}", post(handlers::request_sync))
        .route("/sync/{set}/records", get(handlers::list_sync_records))
        .route("/scaling/{workload}/decisions", get(handlers::list_scaling_decisions));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
