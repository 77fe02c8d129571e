//! REST API handlers.
//!
//! Reads go straight to the store. Mutations pass the write gate and are
//! submitted to the deployment engine, which persists the spec change and
//! its deployment record together.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use convoy_backup::BackupSummary;
use convoy_election::LeaderInfo;
use convoy_engine::{CoordinatorError, EngineError, FieldError, SpecChange};
use convoy_state::{
    AppSpec, DeploymentRecord, PathId, PodSpec, RunSpec, SpecKind, SpecVersion, StateResult,
    TaskRecord, TaskStatus,
};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<FieldError>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            details: Vec::new(),
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            details: Vec::new(),
        }),
    )
        .into_response()
}

#[derive(Serialize)]
struct NotServing {
    leader: Option<String>,
}

/// 503 naming whichever replica currently holds the lease.
fn not_serving(state: &ApiState) -> Response {
    let leader = match state.coordinator.election().current_leader() {
        Ok(leader) => leader.map(|l| l.address),
        Err(e) => {
            warn!(error = %e, "failed to read leader lease");
            None
        }
    };
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ApiResponse {
            success: false,
            data: Some(NotServing { leader }),
            error: Some("this replica is not the serving leader".to_string()),
            details: Vec::new(),
        }),
    )
        .into_response()
}

fn gate(state: &ApiState) -> Result<(), Response> {
    if state.coordinator.is_serving() {
        Ok(())
    } else {
        Err(not_serving(state))
    }
}

fn engine_error(state: &ApiState, e: &EngineError) -> Response {
    match e {
        EngineError::Validation(v) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ApiResponse::<()> {
                success: false,
                data: None,
                error: Some(v.to_string()),
                details: v.details.clone(),
            }),
        )
            .into_response(),
        EngineError::NotFound(_) => error_response(&e.to_string(), StatusCode::NOT_FOUND),
        EngineError::Conflict(_) => error_response(&e.to_string(), StatusCode::CONFLICT),
        EngineError::LeadershipLost(_) => not_serving(state),
        EngineError::Resource(_) | EngineError::State(_) => {
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn internal(e: impl std::fmt::Display) -> Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

fn rejected(rejection: JsonRejection) -> Response {
    let status = match rejection {
        JsonRejection::MissingJsonContentType(_) => rejection.status(),
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    error_response(&rejection.body_text(), status)
}

fn parse_id(raw: &str) -> Result<PathId, Response> {
    PathId::parse(raw).map_err(|e| error_response(&e.to_string(), StatusCode::UNPROCESSABLE_ENTITY))
}

fn decode(kind: SpecKind, value: Value) -> Result<RunSpec, Response> {
    let spec = match kind {
        SpecKind::App => serde_json::from_value::<AppSpec>(value).map(RunSpec::App),
        SpecKind::Pod => serde_json::from_value::<PodSpec>(value).map(RunSpec::Pod),
    };
    spec.map_err(|e| {
        error_response(
            &format!("invalid {kind} definition: {e}"),
            StatusCode::UNPROCESSABLE_ENTITY,
        )
    })
}

// ── Views ──────────────────────────────────────────────────────

/// A spec together with what is running for it.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpecView<T: Serialize> {
    #[serde(flatten)]
    spec: T,
    tasks_running: usize,
    tasks_staged: usize,
    tasks: Vec<TaskRecord>,
    deployments: Vec<DeploymentRef>,
}

#[derive(Serialize)]
struct DeploymentRef {
    id: String,
}

fn spec_view<T: Serialize>(state: &ApiState, id: &PathId, spec: T) -> StateResult<SpecView<T>> {
    let store = state.coordinator.engine().store();
    let tasks = store.tasks_for(id)?;
    let deployments = store
        .list_deployments()?
        .into_iter()
        .filter(|d| d.affected.contains(id))
        .map(|d| DeploymentRef { id: d.id })
        .collect();
    Ok(SpecView {
        spec,
        tasks_running: count(&tasks, TaskStatus::TaskRunning),
        tasks_staged: count(&tasks, TaskStatus::TaskStaging),
        tasks,
        deployments,
    })
}

fn count(tasks: &[TaskRecord], status: TaskStatus) -> usize {
    tasks.iter().filter(|t| t.status == status).count()
}

/// Returned for every accepted spec change.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Accepted {
    id: PathId,
    version: SpecVersion,
    deployment_id: String,
}

impl Accepted {
    fn new(id: PathId, record: &DeploymentRecord) -> Self {
        Self {
            id,
            version: record.sequence,
            deployment_id: record.id.clone(),
        }
    }
}

// ── Liveness and info ──────────────────────────────────────────

/// GET /ping
pub async fn ping(State(state): State<ApiState>) -> impl IntoResponse {
    if state.coordinator.is_serving() {
        (StatusCode::OK, "pong")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not serving")
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoView {
    replica_id: String,
    address: String,
    leader: Option<LeaderInfo>,
    elected: bool,
    serving: bool,
}

/// GET /v2/info
pub async fn get_info(State(state): State<ApiState>) -> impl IntoResponse {
    let election = state.coordinator.election();
    match election.current_leader() {
        Ok(leader) => ApiResponse::ok(InfoView {
            replica_id: election.replica_id().to_string(),
            address: election.address().to_string(),
            leader,
            elected: election.is_leader(),
            serving: state.coordinator.is_serving(),
        })
        .into_response(),
        Err(e) => internal(e),
    }
}

// ── Apps and pods ──────────────────────────────────────────────

/// GET /v2/apps
pub async fn list_apps(State(state): State<ApiState>) -> impl IntoResponse {
    let views = state
        .coordinator
        .engine()
        .store()
        .list_apps()
        .and_then(|apps| {
            apps.into_iter()
                .map(|app| {
                    let id = app.id.clone();
                    spec_view(&state, &id, app)
                })
                .collect::<StateResult<Vec<_>>>()
        });
    match views {
        Ok(views) => ApiResponse::ok(views).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /v2/pods
pub async fn list_pods(State(state): State<ApiState>) -> impl IntoResponse {
    let views = state
        .coordinator
        .engine()
        .store()
        .list_pods()
        .and_then(|pods| {
            pods.into_iter()
                .map(|pod| {
                    let id = pod.id.clone();
                    spec_view(&state, &id, pod)
                })
                .collect::<StateResult<Vec<_>>>()
        });
    match views {
        Ok(views) => ApiResponse::ok(views).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /v2/apps/{id}
pub async fn get_app(State(state): State<ApiState>, Path(raw): Path<String>) -> impl IntoResponse {
    get_spec(&state, SpecKind::App, &raw)
}

/// GET /v2/pods/{id}
pub async fn get_pod(State(state): State<ApiState>, Path(raw): Path<String>) -> impl IntoResponse {
    get_spec(&state, SpecKind::Pod, &raw)
}

fn get_spec(state: &ApiState, kind: SpecKind, raw: &str) -> Response {
    let not_found = || error_response(&format!("{kind} '{raw}' does not exist"), StatusCode::NOT_FOUND);
    let Ok(id) = PathId::parse(raw) else {
        return not_found();
    };
    let spec = match state.coordinator.engine().store().get_spec(kind, &id) {
        Ok(Some(spec)) => spec,
        Ok(None) => return not_found(),
        Err(e) => return internal(e),
    };
    let view = match spec {
        RunSpec::App(app) => spec_view(state, &id, app).map(|v| ApiResponse::ok(v).into_response()),
        RunSpec::Pod(pod) => spec_view(state, &id, pod).map(|v| ApiResponse::ok(v).into_response()),
    };
    view.unwrap_or_else(internal)
}

/// POST /v2/apps
pub async fn create_app(
    State(state): State<ApiState>,
    body: Result<Json<Value>, JsonRejection>,
) -> impl IntoResponse {
    create(&state, SpecKind::App, body)
}

/// POST /v2/pods
pub async fn create_pod(
    State(state): State<ApiState>,
    body: Result<Json<Value>, JsonRejection>,
) -> impl IntoResponse {
    create(&state, SpecKind::Pod, body)
}

fn create(
    state: &ApiState,
    kind: SpecKind,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, Response> {
    gate(state)?;
    let Json(value) = body.map_err(rejected)?;
    let spec = decode(kind, value)?;
    let id = spec.id().clone();
    let record = state
        .coordinator
        .engine()
        .submit(SpecChange::Create(spec))
        .map_err(|e| engine_error(state, &e))?;
    info!(%kind, %id, deployment = %record.id, "spec created");
    Ok((StatusCode::CREATED, ApiResponse::ok(Accepted::new(id, &record))).into_response())
}

/// PUT /v2/apps/{id}
pub async fn put_app(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> impl IntoResponse {
    put(&state, SpecKind::App, &raw, body)
}

/// PUT /v2/pods/{id}
pub async fn put_pod(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> impl IntoResponse {
    put(&state, SpecKind::Pod, &raw, body)
}

/// Create or replace. The path names the spec; a body `id`, when given,
/// must agree with it.
fn put(
    state: &ApiState,
    kind: SpecKind,
    raw: &str,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, Response> {
    gate(state)?;
    let id = parse_id(raw)?;
    let Json(mut value) = body.map_err(rejected)?;
    let Some(fields) = value.as_object_mut() else {
        return Err(error_response(
            "expected a JSON object",
            StatusCode::UNPROCESSABLE_ENTITY,
        ));
    };
    match fields.get("id").and_then(Value::as_str) {
        Some(body_id) if PathId::parse(body_id).ok().as_ref() != Some(&id) => {
            return Err(error_response(
                &format!("id '{body_id}' does not match path '{id}'"),
                StatusCode::UNPROCESSABLE_ENTITY,
            ));
        }
        Some(_) => {}
        None => {
            fields.insert("id".to_string(), Value::String(id.to_string()));
        }
    }

    let spec = decode(kind, value)?;
    let record = state
        .coordinator
        .engine()
        .submit(SpecChange::Put(spec))
        .map_err(|e| engine_error(state, &e))?;
    info!(%kind, %id, deployment = %record.id, trigger = ?record.trigger, "spec updated");
    Ok(ApiResponse::ok(Accepted::new(id, &record)).into_response())
}

/// DELETE /v2/apps/{id}
pub async fn delete_app(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
) -> impl IntoResponse {
    remove(&state, SpecKind::App, &raw)
}

/// DELETE /v2/pods/{id}
pub async fn delete_pod(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
) -> impl IntoResponse {
    remove(&state, SpecKind::Pod, &raw)
}

fn remove(state: &ApiState, kind: SpecKind, raw: &str) -> Result<Response, Response> {
    gate(state)?;
    let id = parse_id(raw)?;
    let record = state
        .coordinator
        .engine()
        .submit(SpecChange::Remove {
            kind,
            id: id.clone(),
        })
        .map_err(|e| engine_error(state, &e))?;
    info!(%kind, %id, deployment = %record.id, "spec removed");
    Ok(ApiResponse::ok(Accepted::new(id, &record)).into_response())
}

// ── Deployments ────────────────────────────────────────────────

/// GET /v2/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> impl IntoResponse {
    match state.coordinator.engine().list() {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => engine_error(&state, &e),
    }
}

/// GET /v2/deployments/{id}
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.engine().status(&id) {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => engine_error(&state, &e),
    }
}

/// DELETE /v2/deployments/{id}
pub async fn cancel_deployment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, Response> {
    gate(&state)?;
    match state.coordinator.engine().cancel(&id) {
        Ok(record) => Ok(ApiResponse::ok(record).into_response()),
        Err(e) => Err(engine_error(&state, &e)),
    }
}

// ── Leadership ─────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaderView {
    leader: String,
    replica_id: String,
    epoch: u64,
}

/// GET /v2/leader
pub async fn get_leader(State(state): State<ApiState>) -> impl IntoResponse {
    match state.coordinator.election().current_leader() {
        Ok(Some(leader)) => ApiResponse::ok(LeaderView {
            leader: leader.address,
            replica_id: leader.replica_id,
            epoch: leader.epoch,
        })
        .into_response(),
        Ok(None) => error_response("no leader elected", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

/// Query parameters of `DELETE /v2/leader`.
#[derive(Debug, Default, Deserialize)]
pub struct AbdicateParams {
    pub backup: Option<String>,
    pub restore: Option<String>,
}

#[derive(Serialize)]
struct Abdicated {
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    backup: Option<BackupSummary>,
}

/// DELETE /v2/leader
pub async fn abdicate(
    State(state): State<ApiState>,
    Query(params): Query<AbdicateParams>,
) -> impl IntoResponse {
    let result = state
        .coordinator
        .abdicate(params.backup.as_deref(), params.restore.as_deref())
        .await;
    match result {
        Ok(backup) => ApiResponse::ok(Abdicated {
            message: "Leadership abdicated",
            backup,
        })
        .into_response(),
        Err(CoordinatorError::NotServing) => not_serving(&state),
        Err(CoordinatorError::Engine(e)) => engine_error(&state, &e),
        Err(CoordinatorError::Backup(e)) if e.is_client_error() => {
            error_response(&e.to_string(), StatusCode::UNPROCESSABLE_ENTITY)
        }
        Err(e @ CoordinatorError::Backup(_)) => {
            warn!(error = %e, "abdication rejected");
            internal(e)
        }
        Err(e @ CoordinatorError::Election(_)) => {
            error_response(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
