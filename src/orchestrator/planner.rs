//! Planner phase: turn a specification into governed PENDING tasks.

use crate::errors::{Result, WorkflowError};
use crate::store::models::{Artifact, ArtifactKind, PhaseType, Run, RunStatus, Task};

use super::context::ContextBundle;
use super::parse::parse_plan;
use super::{ProjectContext, begin_run, finish_run, run_status_for_error, stream_session};

const PLANNER_INSTRUCTION: &str = r#"You are a software engineering planner. Read the specification and decompose it into implementation tasks.

Respond with a single JSON object (surrounding prose is tolerated but discouraged) matching:
{
  "metadata": {"generated_at": "<iso8601>", "engine": "<your name>", "note": "optional"},
  "tasks": [
    {
      "title": "Short imperative title",
      "description": "What to build and how to know it is done",
      "priority": 5,
      "acceptance_criteria": ["observable outcomes"],
      "dependencies": [0]
    }
  ]
}

Rules:
- dependencies are 0-based indices into the tasks array.
- Higher priority means earlier execution.
- Every task must be independently implementable and verifiable.
- Do not invent work the specification does not ask for."#;

#[derive(Debug)]
pub enum SpecInput {
    Text(String),
    ArtifactId(i64),
}

#[derive(Debug)]
pub struct PlannerOutcome {
    pub run: Run,
    pub spec_artifact: Artifact,
    pub transcript: Artifact,
    pub plan_artifact: Artifact,
    pub tasks: Vec<Task>,
}

pub async fn run_planner(ctx: &ProjectContext, input: SpecInput) -> Result<PlannerOutcome> {
    let (spec_artifact, spec_text) = match input {
        SpecInput::Text(text) => {
            let artifact = ctx
                .artifacts
                .put_text(ArtifactKind::Spec, &text, None, None)
                .await?;
            (artifact, text)
        }
        SpecInput::ArtifactId(id) => {
            let artifact = ctx.artifacts.get(id).await?;
            if artifact.kind != ArtifactKind::Spec {
                return Err(WorkflowError::Validation(format!(
                    "artifact {id} is {}, not a spec",
                    artifact.kind
                )));
            }
            let text = ctx.artifacts.read_to_string(&artifact).await?;
            (artifact, text)
        }
    };

    let (engine_name, engine) = ctx.current_engine().await?;
    let timeout = ctx.session_timeout().await?;
    let run = begin_run(ctx, PhaseType::Planner, None, &engine_name).await?;

    let prompt = ContextBundle::new(PLANNER_INSTRUCTION)
        .section("Specification", &spec_text)
        .render();

    let streamed = stream_session(ctx, &run, &engine, prompt, timeout).await;
    let (text, outcome) = match streamed {
        Ok(parts) => parts,
        Err(err) => {
            finish_run(ctx, &run, run_status_for_error(&err), Some(&err.to_string()), None)
                .await?;
            return Err(err);
        }
    };

    // The transcript is persisted whatever happens next.
    let transcript = ctx
        .artifacts
        .put_text(ArtifactKind::Transcript, &text, None, Some(run.id))
        .await?;

    if let Err(err) = outcome {
        finish_run(ctx, &run, run_status_for_error(&err), Some(&err.to_string()), None).await?;
        return Err(err);
    }

    let plan = match parse_plan(&text) {
        Ok(plan) => plan,
        Err(err) => {
            finish_run(ctx, &run, RunStatus::Failure, Some("plan_parse"), None).await?;
            return Err(err);
        }
    };

    let tasks = ctx
        .governance
        .create_tasks_from_plan(plan.to_task_specs(), Some(PhaseType::Planner))
        .await?;

    let plan_artifact = ctx
        .artifacts
        .put_text(
            ArtifactKind::Plan,
            &serde_json::to_string_pretty(&plan)?,
            None,
            Some(run.id),
        )
        .await?;

    let project_id = ctx.project_id;
    ctx.store
        .call(move |s| s.update_project(project_id, Some(PhaseType::Planner), None, None))
        .await?;

    let run = finish_run(ctx, &run, RunStatus::Success, None, None).await?;
    tracing::info!(
        project = ctx.project_id,
        run = run.id,
        tasks = tasks.len(),
        "planner produced {} tasks",
        tasks.len()
    );

    Ok(PlannerOutcome {
        run,
        spec_artifact,
        transcript,
        plan_artifact,
        tasks,
    })
}
