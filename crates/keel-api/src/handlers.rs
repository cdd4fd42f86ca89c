//! REST API handlers.
//!
//! Reads go straight to the `StateStore`; triggers and cancellation go
//! through the dispatcher, manual sync through the set's reconciler.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use keel_core::{KeelError, ManifestDocument};
use keel_gateway::GatewayError;
use keel_state::{RunId, StateError, SyncStatus};

use crate::ApiState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
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

fn keel_error(err: &KeelError) -> axum::response::Response {
    let status = match err {
        KeelError::NotFound(_) => StatusCode::NOT_FOUND,
        KeelError::Conflict { .. } => StatusCode::CONFLICT,
        KeelError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
        KeelError::Config(_) | KeelError::InvalidGraph(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&err.to_string(), status)
}

fn state_error(err: &StateError) -> axum::response::Response {
    let status = match err {
        StateError::Conflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&err.to_string(), status)
}

fn gateway_error(err: &GatewayError) -> axum::response::Response {
    let status = if err.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::BAD_GATEWAY
    };
    error_response(&err.to_string(), status)
}

/// `?limit=` shared by the history endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

fn limit(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

// ── Runs ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub workload: Option<String>,
    pub limit: Option<usize>,
}

/// GET /api/v1/runs
pub async fn list_runs(
    State(state): State<ApiState>,
    Query(query): Query<RunsQuery>,
) -> impl IntoResponse {
    match state
        .store
        .list_runs(query.workload.as_deref(), limit(query.limit))
    {
        Ok(runs) => ApiResponse::ok(runs).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/runs/{id}
pub async fn get_run(State(state): State<ApiState>, Path(id): Path<RunId>) -> impl IntoResponse {
    match state.store.get_run(id) {
        Ok(Some(run)) => ApiResponse::ok(run).into_response(),
        Ok(None) => error_response("run not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

/// Trigger request body.
#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub commit: String,
}

/// POST /api/v1/workloads/{workload}/revisions
pub async fn trigger_revision(
    State(state): State<ApiState>,
    Path(workload): Path<String>,
    Json(req): Json<TriggerRequest>,
) -> impl IntoResponse {
    if req.commit.trim().is_empty() {
        return error_response("commit must not be empty", StatusCode::BAD_REQUEST);
    }
    // A run without a manifest could never promote anything.
    match state.store.read_manifest(&workload) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(
                &format!("no manifest for workload {workload}"),
                StatusCode::NOT_FOUND,
            );
        }
        Err(e) => return state_error(&e),
    }

    match state.dispatcher.on_revision(&workload, req.commit.trim()) {
        Ok(run) => (StatusCode::ACCEPTED, ApiResponse::ok(run)).into_response(),
        Err(e) => keel_error(&e),
    }
}

#[derive(Debug, Serialize)]
struct Cancelled {
    workload: String,
    run_id: RunId,
}

/// POST /api/v1/workloads/{workload}/cancel
pub async fn cancel_run(
    State(state): State<ApiState>,
    Path(workload): Path<String>,
) -> impl IntoResponse {
    match state.dispatcher.cancel(&workload) {
        Some(run_id) => ApiResponse::ok(Cancelled { workload, run_id }).into_response(),
        None => error_response("no active run", StatusCode::NOT_FOUND),
    }
}

// ── Manifests ──────────────────────────────────────────────────

/// GET /api/v1/manifests
pub async fn list_manifests(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_manifests() {
        Ok(manifests) => ApiResponse::ok(manifests).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/manifests/{workload}
pub async fn get_manifest(
    State(state): State<ApiState>,
    Path(workload): Path<String>,
) -> impl IntoResponse {
    match state.store.read_manifest(&workload) {
        Ok(Some(manifest)) => ApiResponse::ok(manifest).into_response(),
        Ok(None) => error_response("manifest not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(&e),
    }
}

/// Manifest write body. `expected_version` is 0 to create.
#[derive(Debug, Deserialize)]
pub struct ManifestWrite {
    pub document: ManifestDocument,
    pub expected_version: u64,
    #[serde(default)]
    pub author: Option<String>,
}

#[derive(Debug, Serialize)]
struct Committed {
    workload: String,
    version: u64,
}

/// PUT /api/v1/manifests/{workload}
pub async fn put_manifest(
    State(state): State<ApiState>,
    Path(workload): Path<String>,
    Json(req): Json<ManifestWrite>,
) -> impl IntoResponse {
    if req.document.workload != workload {
        return error_response(
            &format!(
                "document is for workload {}, not {workload}",
                req.document.workload
            ),
            StatusCode::BAD_REQUEST,
        );
    }
    let artifact = &req.document.artifact;
    match state.artifacts.exists(&artifact.name, &artifact.tag).await {
        Ok(true) => {}
        Ok(false) => {
            return error_response(
                &format!("artifact {artifact} is not in the artifact store"),
                StatusCode::UNPROCESSABLE_ENTITY,
            );
        }
        Err(e) => return gateway_error(&e),
    }

    let author = req.author.as_deref().unwrap_or("api");
    match state.store.compare_and_swap_manifest(
        &req.document,
        req.expected_version,
        author,
        epoch_secs(),
    ) {
        Ok(version) => {
            info!(%workload, version, %author, "manifest written");
            ApiResponse::ok(Committed { workload, version }).into_response()
        }
        Err(e) => state_error(&e),
    }
}

/// GET /api/v1/manifests/{workload}/history
pub async fn manifest_history(
    State(state): State<ApiState>,
    Path(workload): Path<String>,
) -> impl IntoResponse {
    match state.store.manifest_history(&workload) {
        Ok(history) => ApiResponse::ok(history).into_response(),
        Err(e) => state_error(&e),
    }
}

// ── Sync ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SyncSetStatus {
    name: String,
    workloads: Vec<String>,
    auto_sync: bool,
    self_heal: bool,
    prune: bool,
    status: SyncStatus,
}

/// GET /api/v1/sync
pub async fn list_sync_sets(State(state): State<ApiState>) -> impl IntoResponse {
    let sets: Vec<SyncSetStatus> = state
        .reconcilers
        .values()
        .map(|r| {
            let set = r.set();
            SyncSetStatus {
                name: set.name.clone(),
                workloads: set.workloads.clone(),
                auto_sync: set.auto_sync,
                self_heal: set.self_heal,
                prune: set.prune,
                status: r.status(),
            }
        })
        .collect();
    ApiResponse::ok(sets)
}

/// POST /api/v1/sync/{set}
pub async fn request_sync(
    State(state): State<ApiState>,
    Path(set): Path<String>,
) -> impl IntoResponse {
    match state.reconcilers.get(&set) {
        Some(reconciler) => {
            reconciler.request_sync();
            (
                StatusCode::ACCEPTED,
                ApiResponse::ok(serde_json::json!({ "set": set, "status": "requested" })),
            )
                .into_response()
        }
        None => error_response("unknown sync set", StatusCode::NOT_FOUND),
    }
}

/// GET /api/v1/sync/{set}/records
pub async fn list_sync_records(
    State(state): State<ApiState>,
    Path(set): Path<String>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match state.store.list_sync_records(&set, limit(query.limit)) {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => state_error(&e),
    }
}

// ── Scaling ────────────────────────────────────────────────────

/// GET /api/v1/scaling/{workload}/decisions
pub async fn list_scaling_decisions(
    State(state): State<ApiState>,
    Path(workload): Path<String>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match state
        .store
        .list_scaling_decisions(&workload, limit(query.limit))
    {
        Ok(decisions) => ApiResponse::ok(decisions).into_response(),
        Err(e) => state_error(&e),
    }
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_caps() {
        assert_eq!(limit(None), DEFAULT_LIMIT);
        assert_eq!(limit(Some(0)), 1);
        assert_eq!(limit(Some(5_000)), MAX_LIMIT);
        assert_eq!(limit(Some(7)), 7);
    }

    #[test]
    fn errors_map_to_status_codes() {
        let conflict = state_error(&StateError::Conflict {
            expected: 5,
            actual: 6,
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let missing = keel_error(&KeelError::NotFound("run 9".into()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let stopping = keel_error(&KeelError::Cancelled("dispatcher is shutting down".into()));
        assert_eq!(stopping.status(), StatusCode::SERVICE_UNAVAILABLE);

        let broken = state_error(&StateError::Write("disk full".into()));
        assert_eq!(broken.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let registry_down = gateway_error(&GatewayError::Transient("timeout".into()));
        assert_eq!(registry_down.status(), StatusCode::SERVICE_UNAVAILABLE);
        let registry_broken = gateway_error(&GatewayError::Failed("bad index".into()));
        assert_eq!(registry_broken.status(), StatusCode::BAD_GATEWAY);
    }
}
