//! REST surface over the workflow engine.
//!
//! Handlers translate requests into governance / orchestrator calls and map
//! every `WorkflowError` kind onto a stable HTTP status and `{error, code}`
//! body. The richer payloads travel on the event channel.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use crate::engine::EngineRegistry;
use crate::errors::{Result, WorkflowError};
use crate::events::EventBus;
use crate::gates::GateSpec;
use crate::orchestrator::{
    ProjectContext, architect, coder,
    planner::{self, SpecInput},
};
use crate::store::models::*;
use crate::store::workspace::Workspace;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub workspace: Arc<Workspace>,
    pub engines: Arc<EngineRegistry>,
    contexts: tokio::sync::Mutex<HashMap<i64, Arc<ProjectContext>>>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(workspace: Arc<Workspace>, engines: Arc<EngineRegistry>) -> Self {
        Self {
            workspace,
            engines,
            contexts: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        self.workspace.bus()
    }

    /// Per-project application context, built once and cached. The
    /// orchestrator never holds two projects in one context.
    pub async fn context(&self, project_id: i64) -> Result<Arc<ProjectContext>> {
        let mut contexts = self.contexts.lock().await;
        if let Some(ctx) = contexts.get(&project_id) {
            return Ok(ctx.clone());
        }
        let ctx = Arc::new(ProjectContext::build(
            &self.workspace,
            project_id,
            self.engines.clone(),
        )?);
        contexts.insert(project_id, ctx.clone());
        Ok(ctx)
    }

    pub async fn invalidate(&self, project_id: i64) {
        self.contexts.lock().await.remove(&project_id);
    }
}

// ── Error mapping ─────────────────────────────────────────────────────

pub struct ApiError(WorkflowError);

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
            WorkflowError::Conflict(_) => StatusCode::CONFLICT,
            WorkflowError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WorkflowError::Forbidden(_) => StatusCode::FORBIDDEN,
            WorkflowError::Preconditions(_) => StatusCode::PRECONDITION_FAILED,
            WorkflowError::EngineFailure(_) | WorkflowError::Parse(_) => StatusCode::BAD_GATEWAY,
            WorkflowError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            WorkflowError::Cancelled(_) => StatusCode::CONFLICT,
            WorkflowError::Storage(_) | WorkflowError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ── Request payloads ──────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub root_path: Option<String>,
    pub default_engine: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub default_engine: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    #[serde(flatten)]
    pub spec: TaskSpec,
}

#[derive(Deserialize)]
pub struct UpdateTaskRequest {
    #[serde(flatten)]
    pub delta: TaskDelta,
    pub via_change_request: Option<i64>,
}

#[derive(Deserialize)]
pub struct DecisionRequest {
    pub approver: String,
    pub notes: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateChangeRequestRequest {
    pub task_id: i64,
    pub payload: ChangeRequestPayload,
}

#[derive(Deserialize)]
pub struct GatesUpdateRequest {
    pub gates: Vec<GateSpec>,
}

#[derive(Deserialize)]
pub struct PlannerRequest {
    pub spec: Option<String>,
    pub spec_artifact_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct ArchitectRequest {
    pub task_id: i64,
}

#[derive(Deserialize)]
pub struct CoderRequest {
    /// Run one task when given, otherwise drain the coder loop.
    pub task_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct SelectOptionRequest {
    pub option_id: String,
    pub approver: String,
    pub notes: Option<String>,
}

#[derive(Deserialize)]
pub struct CommitRequest {
    #[serde(default)]
    pub files: Vec<String>,
    pub message: String,
}

#[derive(Deserialize)]
pub struct LimitsRequest {
    pub max_attempts: Option<i64>,
    pub timeout_seconds: Option<i64>,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct DiffQuery {
    #[serde(default)]
    pub cached: bool,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/:id",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/api/projects/:id/tasks", get(list_tasks).post(create_task))
        .route(
            "/api/projects/:id/tasks/:task_id",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/projects/:id/tasks/:task_id/versions", get(list_versions))
        .route("/api/projects/:id/tasks/:task_id/submit", post(submit_task))
        .route("/api/projects/:id/tasks/:task_id/approve", post(approve_task))
        .route("/api/projects/:id/tasks/:task_id/reject", post(reject_task))
        .route(
            "/api/projects/:id/tasks/:task_id/gates",
            get(get_gates).put(put_gates),
        )
        .route("/api/projects/:id/tasks/:task_id/split", post(split_task))
        .route("/api/projects/:id/tasks/:task_id/merge", post(merge_task))
        .route(
            "/api/projects/:id/change-requests",
            get(list_change_requests).post(create_change_request),
        )
        .route("/api/projects/:id/change-requests/:cr_id", get(get_change_request))
        .route(
            "/api/projects/:id/change-requests/:cr_id/submit",
            post(submit_change_request),
        )
        .route(
            "/api/projects/:id/change-requests/:cr_id/approve",
            post(approve_change_request),
        )
        .route(
            "/api/projects/:id/change-requests/:cr_id/reject",
            post(reject_change_request),
        )
        .route(
            "/api/projects/:id/change-requests/:cr_id/apply",
            post(apply_change_request),
        )
        .route("/api/projects/:id/artifacts", get(list_artifacts))
        .route("/api/projects/:id/artifacts/:artifact_id", get(get_artifact))
        .route(
            "/api/projects/:id/artifacts/:artifact_id/download",
            get(download_artifact),
        )
        .route("/api/projects/:id/runs", get(list_runs))
        .route("/api/projects/:id/runs/:run_id", get(get_run))
        .route("/api/projects/:id/phases/planner", post(run_planner_phase))
        .route("/api/projects/:id/phases/architect", post(run_architect_phase))
        .route("/api/projects/:id/phases/coder", post(run_coder_phase))
        .route("/api/projects/:id/select-option", post(select_option))
        .route("/api/projects/:id/vcs/status", get(vcs_status))
        .route("/api/projects/:id/vcs/init", post(vcs_init))
        .route("/api/projects/:id/vcs/commit", post(vcs_commit))
        .route("/api/projects/:id/vcs/diff", get(vcs_diff))
        .route("/api/projects/:id/control", get(get_control))
        .route("/api/projects/:id/control/pause", post(pause_project))
        .route("/api/projects/:id/control/continue", post(continue_project))
        .route("/api/projects/:id/control/limits", post(set_limits))
        .route("/api/projects/:id/events", get(list_events))
}

// ── Project handlers ──────────────────────────────────────────────────

async fn list_projects(State(state): State<SharedState>) -> ApiResult<Vec<Project>> {
    Ok(Json(state.workspace.list_projects()?))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<Project> {
    let root = req.root_path.as_deref().map(std::path::Path::new);
    let project = state.workspace.create_project(
        &req.name,
        root,
        req.default_engine.as_deref().unwrap_or("null"),
    )?;
    Ok(Json(project))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Project> {
    Ok(Json(state.workspace.get_project(id)?))
}

async fn update_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateProjectRequest>,
) -> ApiResult<Project> {
    let ctx = state.context(id).await?;
    let engine = req.default_engine.clone();
    let project = ctx
        .store
        .call(move |s| s.update_project(id, None, engine.as_deref(), None))
        .await?;
    ctx.bus.publish(
        crate::events::EventKind::ProjectUpdated,
        Some(id),
        serde_json::json!({"project_id": id, "default_engine": req.default_engine}),
    );
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state.invalidate(id).await;
    state.workspace.delete_project(id)?;
    Ok(Json(serde_json::json!({"deleted": id})))
}

// ── Task handlers ─────────────────────────────────────────────────────

async fn list_tasks(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<Task>> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.store.call(move |s| s.list_tasks(id, None)).await?))
}

async fn create_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<Task> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.governance.create_task(req.spec, None).await?))
}

async fn get_task(
    State(state): State<SharedState>,
    Path((id, task_id)): Path<(i64, i64)>,
) -> ApiResult<Task> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.store.call(move |s| s.get_task(task_id)).await?))
}

async fn update_task(
    State(state): State<SharedState>,
    Path((id, task_id)): Path<(i64, i64)>,
    Json(req): Json<UpdateTaskRequest>,
) -> ApiResult<Task> {
    let ctx = state.context(id).await?;
    Ok(Json(
        ctx.governance
            .update_task(task_id, req.delta, req.via_change_request)
            .await?,
    ))
}

async fn delete_task(
    State(state): State<SharedState>,
    Path((id, task_id)): Path<(i64, i64)>,
) -> ApiResult<serde_json::Value> {
    let ctx = state.context(id).await?;
    ctx.store.call(move |s| s.delete_task(task_id)).await?;
    ctx.bus.publish_task(
        crate::events::EventKind::TaskDeleted,
        id,
        task_id,
        serde_json::json!({"task_id": task_id}),
    );
    Ok(Json(serde_json::json!({"deleted": task_id})))
}

async fn list_versions(
    State(state): State<SharedState>,
    Path((id, task_id)): Path<(i64, i64)>,
) -> ApiResult<Vec<TaskVersion>> {
    let ctx = state.context(id).await?;
    Ok(Json(
        ctx.store.call(move |s| s.list_task_versions(task_id)).await?,
    ))
}

async fn submit_task(
    State(state): State<SharedState>,
    Path((id, task_id)): Path<(i64, i64)>,
) -> ApiResult<Task> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.governance.submit_for_approval(task_id).await?))
}

async fn approve_task(
    State(state): State<SharedState>,
    Path((id, task_id)): Path<(i64, i64)>,
    Json(req): Json<DecisionRequest>,
) -> ApiResult<Task> {
    let ctx = state.context(id).await?;
    Ok(Json(
        ctx.governance
            .approve_task(task_id, &req.approver, req.notes.as_deref())
            .await?,
    ))
}

async fn reject_task(
    State(state): State<SharedState>,
    Path((id, task_id)): Path<(i64, i64)>,
    Json(req): Json<DecisionRequest>,
) -> ApiResult<Task> {
    let ctx = state.context(id).await?;
    Ok(Json(
        ctx.governance
            .reject_task(task_id, &req.approver, req.notes.as_deref())
            .await?,
    ))
}

async fn get_gates(
    State(state): State<SharedState>,
    Path((id, task_id)): Path<(i64, i64)>,
) -> ApiResult<Vec<GateSpec>> {
    let ctx = state.context(id).await?;
    let version = ctx.store.call(move |s| s.active_version(task_id)).await?;
    Ok(Json(version.gates))
}

async fn put_gates(
    State(state): State<SharedState>,
    Path((id, task_id)): Path<(i64, i64)>,
    Json(req): Json<GatesUpdateRequest>,
) -> ApiResult<Task> {
    let ctx = state.context(id).await?;
    let delta = TaskDelta {
        gates: Some(req.gates),
        ..Default::default()
    };
    Ok(Json(ctx.governance.update_task(task_id, delta, None).await?))
}

async fn split_task(
    State(state): State<SharedState>,
    Path((id, task_id)): Path<(i64, i64)>,
) -> ApiResult<Vec<Task>> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.governance.split(task_id).await?))
}

async fn merge_task(
    State(state): State<SharedState>,
    Path((id, task_id)): Path<(i64, i64)>,
) -> ApiResult<Task> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.governance.merge(task_id).await?))
}

// ── Change request handlers ───────────────────────────────────────────

async fn list_change_requests(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<ChangeRequest>> {
    let ctx = state.context(id).await?;
    Ok(Json(
        ctx.store.call(move |s| s.list_change_requests(None, None)).await?,
    ))
}

async fn create_change_request(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<CreateChangeRequestRequest>,
) -> ApiResult<ChangeRequest> {
    let ctx = state.context(id).await?;
    Ok(Json(
        ctx.governance
            .create_change_request(req.task_id, req.payload)
            .await?,
    ))
}

async fn get_change_request(
    State(state): State<SharedState>,
    Path((id, cr_id)): Path<(i64, i64)>,
) -> ApiResult<ChangeRequest> {
    let ctx = state.context(id).await?;
    Ok(Json(
        ctx.store.call(move |s| s.get_change_request(cr_id)).await?,
    ))
}

async fn submit_change_request(
    State(state): State<SharedState>,
    Path((id, cr_id)): Path<(i64, i64)>,
) -> ApiResult<ChangeRequest> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.governance.submit_change_request(cr_id).await?))
}

async fn approve_change_request(
    State(state): State<SharedState>,
    Path((id, cr_id)): Path<(i64, i64)>,
    Json(req): Json<DecisionRequest>,
) -> ApiResult<ChangeRequest> {
    let ctx = state.context(id).await?;
    Ok(Json(
        ctx.governance
            .approve_change_request(cr_id, &req.approver, req.notes.as_deref())
            .await?,
    ))
}

async fn reject_change_request(
    State(state): State<SharedState>,
    Path((id, cr_id)): Path<(i64, i64)>,
    Json(req): Json<DecisionRequest>,
) -> ApiResult<ChangeRequest> {
    let ctx = state.context(id).await?;
    Ok(Json(
        ctx.governance
            .reject_change_request(cr_id, &req.approver, req.notes.as_deref())
            .await?,
    ))
}

async fn apply_change_request(
    State(state): State<SharedState>,
    Path((id, cr_id)): Path<(i64, i64)>,
) -> ApiResult<serde_json::Value> {
    let ctx = state.context(id).await?;
    let outcome = ctx.governance.apply_change_request(cr_id).await?;
    let body = match outcome {
        crate::governance::ApplyOutcome::Updated(task) => {
            serde_json::json!({"applied": "edit", "task": task})
        }
        crate::governance::ApplyOutcome::Split(tasks) => {
            serde_json::json!({"applied": "split", "tasks": tasks})
        }
        crate::governance::ApplyOutcome::Merged(task) => {
            serde_json::json!({"applied": "merge", "task": task})
        }
    };
    Ok(Json(body))
}

// ── Artifact handlers ─────────────────────────────────────────────────

async fn list_artifacts(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<Artifact>> {
    let ctx = state.context(id).await?;
    Ok(Json(
        ctx.store
            .call(move |s| s.list_artifacts(id, None, None))
            .await?,
    ))
}

async fn get_artifact(
    State(state): State<SharedState>,
    Path((id, artifact_id)): Path<(i64, i64)>,
) -> ApiResult<Artifact> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.artifacts.get(artifact_id).await?))
}

async fn download_artifact(
    State(state): State<SharedState>,
    Path((id, artifact_id)): Path<(i64, i64)>,
) -> std::result::Result<Response, ApiError> {
    let ctx = state.context(id).await?;
    let artifact = ctx.artifacts.get(artifact_id).await?;
    let bytes = ctx.artifacts.read(&artifact).await?;
    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

// ── Run handlers ──────────────────────────────────────────────────────

async fn list_runs(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<Run>> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.store.call(move |s| s.list_runs(id, None)).await?))
}

async fn get_run(
    State(state): State<SharedState>,
    Path((id, run_id)): Path<(i64, i64)>,
) -> ApiResult<Run> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.store.call(move |s| s.get_run(run_id)).await?))
}

// ── Phase handlers ────────────────────────────────────────────────────

async fn run_planner_phase(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<PlannerRequest>,
) -> ApiResult<serde_json::Value> {
    let ctx = state.context(id).await?;
    let input = match (req.spec, req.spec_artifact_id) {
        (Some(text), None) => SpecInput::Text(text),
        (None, Some(artifact_id)) => SpecInput::ArtifactId(artifact_id),
        _ => {
            return Err(WorkflowError::Validation(
                "provide exactly one of spec or spec_artifact_id".into(),
            )
            .into());
        }
    };
    let outcome = planner::run_planner(&ctx, input).await?;
    Ok(Json(serde_json::json!({
        "run": outcome.run,
        "tasks": outcome.tasks,
        "spec_artifact_id": outcome.spec_artifact.id,
        "plan_artifact_id": outcome.plan_artifact.id,
        "transcript_artifact_id": outcome.transcript.id,
    })))
}

async fn run_architect_phase(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<ArchitectRequest>,
) -> ApiResult<serde_json::Value> {
    let ctx = state.context(id).await?;
    let outcome = architect::run_architect(&ctx, req.task_id).await?;
    Ok(Json(serde_json::json!({
        "run": outcome.run,
        "options": outcome.architecture.options,
        "architecture_artifact_id": outcome.architecture_artifact.id,
        "adr_artifact_ids": outcome.adr_artifacts.iter().map(|a| a.id).collect::<Vec<_>>(),
    })))
}

async fn run_coder_phase(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<CoderRequest>,
) -> ApiResult<serde_json::Value> {
    let ctx = state.context(id).await?;
    match req.task_id {
        Some(task_id) => {
            let outcome = coder::run_coder_task(&ctx, task_id).await?;
            Ok(Json(serde_json::json!({
                "run": outcome.run,
                "task": outcome.task,
                "gates": outcome.gates,
                "committed": outcome.committed,
            })))
        }
        None => {
            let report = coder::run_coder_loop(&ctx).await?;
            let stopped = match report.stopped {
                coder::LoopStop::NoReady => "no_ready",
                coder::LoopStop::Paused => "paused",
            };
            let executed: Vec<serde_json::Value> = report
                .executed
                .iter()
                .map(|entry| {
                    serde_json::json!({
                        "task_id": entry.task_id,
                        "run_id": entry.run_id,
                        "completed": entry.completed,
                    })
                })
                .collect();
            Ok(Json(serde_json::json!({
                "executed": executed,
                "stopped": stopped,
            })))
        }
    }
}

async fn select_option(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<SelectOptionRequest>,
) -> ApiResult<Project> {
    let ctx = state.context(id).await?;
    Ok(Json(
        ctx.governance
            .select_architecture_option(&req.option_id, &req.approver, req.notes.as_deref())
            .await?,
    ))
}

// ── VCS handlers ──────────────────────────────────────────────────────

async fn vcs_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<crate::vcs::VcsStatus> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.vcs.status().await?))
}

async fn vcs_init(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    let ctx = state.context(id).await?;
    ctx.vcs.init().await?;
    Ok(Json(serde_json::json!({"initialized": true})))
}

async fn vcs_commit(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<CommitRequest>,
) -> ApiResult<serde_json::Value> {
    let ctx = state.context(id).await?;
    let sha = ctx.vcs.commit(&req.files, &req.message).await?;
    Ok(Json(serde_json::json!({"sha": sha})))
}

async fn vcs_diff(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<DiffQuery>,
) -> ApiResult<serde_json::Value> {
    let ctx = state.context(id).await?;
    let diff = ctx.vcs.diff(query.cached).await?;
    Ok(Json(serde_json::json!({"diff": diff})))
}

// ── Control handlers ──────────────────────────────────────────────────

async fn get_control(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<ControlState> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.governance.control_state().await?))
}

async fn pause_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<ControlState> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.governance.pause().await?))
}

async fn continue_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<ControlState> {
    let ctx = state.context(id).await?;
    Ok(Json(ctx.governance.resume().await?))
}

async fn set_limits(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<LimitsRequest>,
) -> ApiResult<ControlState> {
    let ctx = state.context(id).await?;
    Ok(Json(
        ctx.governance
            .set_limits(req.max_attempts, req.timeout_seconds)
            .await?,
    ))
}

async fn list_events(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Vec<EventRecord>> {
    let ctx = state.context(id).await?;
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    Ok(Json(
        ctx.store.call(move |s| s.list_events(id, limit)).await?,
    ))
}
