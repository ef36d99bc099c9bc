//! Phase orchestration: discrete, resumable runs of the Planner, Architect,
//! and Coder phases for one project.
//!
//! `ProjectContext` is the application context for a single project: its
//! store, sandbox, artifact store, governance, VCS adapter, and engine
//! registry, built once and passed explicitly. Nothing here is a global.

pub mod architect;
pub mod coder;
pub mod context;
pub mod parse;
pub mod planner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::artifacts::ArtifactStore;
use crate::config::ProjectConfig;
use crate::engine::{Engine, EngineRegistry, EngineSession, SessionRequest};
use crate::errors::{Result, WorkflowError};
use crate::events::{EventBus, EventKind};
use crate::governance::Governance;
use crate::sandbox::Sandbox;
use crate::store::StoreHandle;
use crate::store::models::{PhaseType, Project, Run, RunStatus};
use crate::store::workspace::Workspace;
use crate::vcs::VcsAdapter;

pub struct ProjectContext {
    pub project_id: i64,
    pub root: PathBuf,
    pub config: ProjectConfig,
    pub store: StoreHandle,
    pub bus: EventBus,
    pub artifacts: ArtifactStore,
    pub sandbox: Arc<Sandbox>,
    pub governance: Governance,
    pub vcs: VcsAdapter,
    pub engines: Arc<EngineRegistry>,
    /// Guards coder-loop scheduling decisions (never individual task work).
    pub(crate) coder_lock: tokio::sync::Mutex<()>,
}

impl ProjectContext {
    pub fn build(
        workspace: &Workspace,
        project_id: i64,
        engines: Arc<EngineRegistry>,
    ) -> Result<Self> {
        let store = workspace.store(project_id)?;
        let project = {
            let guard = store.lock_sync()?;
            guard.get_project(project_id)?
        };
        let root = PathBuf::from(&project.root_path);
        let config = ProjectConfig::load(&root)?;
        config.database.ensure_supported()?;

        let bus = workspace.bus().clone();
        let sandbox = Arc::new(Sandbox::from_config(
            &root,
            &config.sandbox,
            bus.clone(),
            project_id,
        )?);
        let artifacts = ArtifactStore::new(project_id, &root, store.clone(), bus.clone());
        let governance = Governance::new(project_id, store.clone(), bus.clone());
        let vcs = VcsAdapter::new(&root, bus.clone(), project_id)?;

        Ok(Self {
            project_id,
            root,
            config,
            store,
            bus,
            artifacts,
            sandbox,
            governance,
            vcs,
            engines,
            coder_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub async fn project(&self) -> Result<Project> {
        let project_id = self.project_id;
        self.store.call(move |s| s.get_project(project_id)).await
    }

    /// The engine currently selected for this project. The project row
    /// wins over the config file so an engine switch takes effect without
    /// editing foreman.toml.
    pub async fn current_engine(&self) -> Result<(String, Arc<dyn Engine>)> {
        let project = self.project().await?;
        let name = if project.default_engine.is_empty() {
            self.config.engine_name().to_string()
        } else {
            project.default_engine
        };
        let engine = self.engines.get(&name)?;
        Ok((name, engine))
    }

    /// Parent deadline for engine sessions, from control state.
    pub async fn session_timeout(&self) -> Result<Duration> {
        let control = self.governance.control_state().await?;
        Ok(Duration::from_secs(control.timeout_seconds.max(1) as u64))
    }
}

// ── Run bookkeeping ───────────────────────────────────────────────────

pub(crate) async fn begin_run(
    ctx: &ProjectContext,
    phase: PhaseType,
    task_id: Option<i64>,
    engine_name: &str,
) -> Result<Run> {
    let correlation = uuid::Uuid::new_v4().to_string();
    let project_id = ctx.project_id;
    let engine = engine_name.to_string();
    let correlation_for_store = correlation.clone();
    let run = ctx
        .store
        .call(move |s| s.create_run(project_id, task_id, &engine, phase, &correlation_for_store))
        .await?;

    ctx.bus.publish_correlated(
        EventKind::RunStarted,
        Some(ctx.project_id),
        task_id,
        &correlation,
        serde_json::json!({"run_id": run.id, "phase": phase, "engine": engine_name}),
    );
    ctx.bus.publish_correlated(
        EventKind::PhaseStarted,
        Some(ctx.project_id),
        task_id,
        &correlation,
        serde_json::json!({"run_id": run.id, "phase": phase}),
    );
    Ok(run)
}

pub(crate) async fn finish_run(
    ctx: &ProjectContext,
    run: &Run,
    status: RunStatus,
    error: Option<&str>,
    gates: Option<&crate::gates::GateReport>,
) -> Result<Run> {
    let run_id = run.id;
    let error_owned = error.map(|s| s.to_string());
    let gates_owned = gates.cloned();
    let finished = ctx
        .store
        .call(move |s| s.finish_run(run_id, status, error_owned.as_deref(), gates_owned.as_ref()))
        .await?;

    ctx.bus.publish_correlated(
        EventKind::RunEnded,
        Some(ctx.project_id),
        run.task_id,
        &run.correlation_id,
        serde_json::json!({"run_id": run.id, "status": status, "error": error}),
    );
    let phase_event = match status {
        RunStatus::Success => Some(EventKind::PhaseCompleted),
        RunStatus::Failure | RunStatus::Timeout => Some(EventKind::PhaseFailed),
        RunStatus::Cancelled | RunStatus::Running => None,
    };
    if let Some(kind) = phase_event {
        ctx.bus.publish_correlated(
            kind,
            Some(ctx.project_id),
            run.task_id,
            &run.correlation_id,
            serde_json::json!({"run_id": run.id, "phase": run.phase, "error": error}),
        );
    }
    Ok(finished)
}

pub(crate) fn run_status_for_error(err: &WorkflowError) -> RunStatus {
    match err {
        WorkflowError::Timeout { .. } => RunStatus::Timeout,
        WorkflowError::Cancelled(_) => RunStatus::Cancelled,
        _ => RunStatus::Failure,
    }
}

// ── Engine streaming ──────────────────────────────────────────────────

/// Drive an engine session to completion, forwarding chunks as `run_log`
/// events. Returns the accumulated transcript and the session outcome so
/// callers persist partial text even on failure.
pub(crate) async fn stream_session(
    ctx: &ProjectContext,
    run: &Run,
    engine: &Arc<dyn Engine>,
    prompt: String,
    timeout: Duration,
) -> Result<(String, Result<()>)> {
    let session = engine
        .start(SessionRequest {
            prompt,
            workdir: ctx.root.clone(),
            timeout,
        })
        .await?;
    Ok(pump_chunks(ctx, run, session).await)
}

pub(crate) async fn pump_chunks(
    ctx: &ProjectContext,
    run: &Run,
    mut session: EngineSession,
) -> (String, Result<()>) {
    let mut transcript = String::new();
    while let Some(chunk) = session.next_chunk().await {
        ctx.bus.publish_correlated(
            EventKind::RunLog,
            Some(ctx.project_id),
            run.task_id,
            &run.correlation_id,
            serde_json::json!({"stream": "engine", "chunk": chunk}),
        );
        transcript.push_str(&chunk);
    }
    let (rest, outcome) = session.collect().await;
    transcript.push_str(&rest);
    (transcript, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_classification() {
        assert_eq!(
            run_status_for_error(&WorkflowError::Timeout {
                what: "engine".into(),
                seconds: 1
            }),
            RunStatus::Timeout
        );
        assert_eq!(
            run_status_for_error(&WorkflowError::Cancelled("paused".into())),
            RunStatus::Cancelled
        );
        assert_eq!(
            run_status_for_error(&WorkflowError::EngineFailure("died".into())),
            RunStatus::Failure
        );
        assert_eq!(
            run_status_for_error(&WorkflowError::Parse("garbage".into())),
            RunStatus::Failure
        );
    }
}
