//! Architect phase: design options, ADRs, and task refinement for one task.
//!
//! The engine sees the spec, the plan, and every prior ADR. Its output must
//! carry an architecture block; each ADR becomes its own artifact and task
//! refinements land as new task versions. The selected option is recorded
//! on the project only later, through an approval.

use crate::errors::Result;
use crate::store::models::{
    Artifact, ArtifactKind, PhaseType, Run, RunStatus, TaskDelta,
};

use super::context::ContextBundle;
use super::parse::{ArchitecturePayload, parse_architecture};
use super::{ProjectContext, begin_run, finish_run, run_status_for_error, stream_session};

const ARCHITECT_INSTRUCTION: &str = r##"You are a software architect. Study the specification, the plan, and any prior decision records, then design the implementation approach for the given task.

Respond with a single JSON object matching:
{
  "options": [
    {"id": "opt-1", "name": "Option name", "description": "...", "pros": ["..."], "cons": ["..."], "trade_offs": "summary"}
  ],
  "adrs": [
    {"name": "NNN-short-slug", "markdown": "# Title\n\nContext, decision, consequences."}
  ],
  "task_refinements": [
    {"task_id": 1, "deps": [2], "gates": [{"name": "tests", "command": "cargo", "args": ["test"], "pass_criteria": "exit_code_zero"}], "priority": 5, "files": ["src/auth.rs"]}
  ]
}

Rules:
- Offer at least two options with honest pros, cons, and trade-offs.
- One ADR per significant decision; keep each focused.
- Refinements may tighten dependencies, suggest gates, adjust priority, and
  name the files each task is expected to touch.
- Do not pick a winner; a human selects the option."##;

#[derive(Debug)]
pub struct ArchitectOutcome {
    pub run: Run,
    pub architecture: ArchitecturePayload,
    pub architecture_artifact: Artifact,
    pub adr_artifacts: Vec<Artifact>,
    pub transcript: Artifact,
}

pub async fn run_architect(ctx: &ProjectContext, task_id: i64) -> Result<ArchitectOutcome> {
    let store = &ctx.store;
    let task = store.call(move |s| s.get_task(task_id)).await?;
    let version = store.call(move |s| s.active_version(task_id)).await?;

    let project_id = ctx.project_id;
    let spec_text = match store
        .call(move |s| s.latest_artifact(project_id, ArtifactKind::Spec))
        .await?
    {
        Some(artifact) => Some(ctx.artifacts.read_to_string(&artifact).await?),
        None => None,
    };
    let plan_text = match store
        .call(move |s| s.latest_artifact(project_id, ArtifactKind::Plan))
        .await?
    {
        Some(artifact) => Some(ctx.artifacts.read_to_string(&artifact).await?),
        None => None,
    };
    let prior_adrs = store
        .call(move |s| s.list_artifacts(project_id, Some(ArtifactKind::Adr), None))
        .await?;
    let mut adr_text = String::new();
    for adr in &prior_adrs {
        adr_text.push_str(&ctx.artifacts.read_to_string(adr).await?);
        adr_text.push_str("\n\n---\n\n");
    }

    let task_section = format!(
        "Task {} (v{}): {}\n\n{}\n\nAcceptance criteria:\n{}",
        task.id,
        version.version_num,
        version.title,
        version.description,
        version
            .acceptance_criteria
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n"),
    );

    let prompt = ContextBundle::new(ARCHITECT_INSTRUCTION)
        .section_opt("Specification", spec_text.as_deref())
        .section_opt("Plan", plan_text.as_deref())
        .section_opt("Prior decision records", (!adr_text.is_empty()).then_some(adr_text.as_str()))
        .section("Task under design", &task_section)
        .render();
    ctx.artifacts
        .put_text(ArtifactKind::Other, &prompt, Some(task_id), None)
        .await?;

    let (engine_name, engine) = ctx.current_engine().await?;
    let timeout = ctx.session_timeout().await?;
    let run = begin_run(ctx, PhaseType::Architect, Some(task_id), &engine_name).await?;

    let streamed = stream_session(ctx, &run, &engine, prompt, timeout).await;
    let (text, outcome) = match streamed {
        Ok(parts) => parts,
        Err(err) => {
            finish_run(ctx, &run, run_status_for_error(&err), Some(&err.to_string()), None)
                .await?;
            return Err(err);
        }
    };
    let transcript = ctx
        .artifacts
        .put_text(ArtifactKind::Transcript, &text, Some(task_id), Some(run.id))
        .await?;
    if let Err(err) = outcome {
        finish_run(ctx, &run, run_status_for_error(&err), Some(&err.to_string()), None).await?;
        return Err(err);
    }

    let architecture = match parse_architecture(&text) {
        Ok(architecture) => architecture,
        Err(err) => {
            finish_run(ctx, &run, RunStatus::Failure, Some("architecture_parse"), None).await?;
            return Err(err);
        }
    };

    let mut adr_artifacts = Vec::with_capacity(architecture.adrs.len());
    for adr in &architecture.adrs {
        let body = format!("<!-- {} -->\n{}", adr.name, adr.markdown);
        adr_artifacts.push(
            ctx.artifacts
                .put_text(ArtifactKind::Adr, &body, Some(task_id), Some(run.id))
                .await?,
        );
    }

    let architecture_artifact = ctx
        .artifacts
        .put_text(
            ArtifactKind::Architecture,
            &serde_json::to_string_pretty(&architecture)?,
            Some(task_id),
            Some(run.id),
        )
        .await?;

    // Refinements create new versions in place; tasks already approved are
    // skipped, since only a change request may touch those. File hints ride
    // on task metadata, where the coder bundle picks them up.
    for refinement in &architecture.task_refinements {
        let delta = TaskDelta {
            depends_on: Some(refinement.deps.clone()),
            gates: (!refinement.gates.is_empty()).then(|| refinement.gates.clone()),
            priority: refinement.priority,
            ..Default::default()
        };
        if let Err(err) = ctx
            .governance
            .update_task(refinement.task_id, delta, None)
            .await
        {
            tracing::warn!(
                task = refinement.task_id,
                "skipping architect refinement: {err}"
            );
            continue;
        }
        if !refinement.files.is_empty() {
            let refined_task = refinement.task_id;
            let files = refinement.files.clone();
            store
                .call(move |s| {
                    s.merge_task_metadata(refined_task, &serde_json::json!({"file_hints": files}))
                })
                .await?;
        }
    }

    store
        .call(move |s| s.set_task_phase(task_id, PhaseType::Architect))
        .await?;
    store
        .call(move |s| s.update_project(project_id, Some(PhaseType::Architect), None, None))
        .await?;

    let run = finish_run(ctx, &run, RunStatus::Success, None, None).await?;
    Ok(ArchitectOutcome {
        run,
        architecture,
        architecture_artifact,
        adr_artifacts,
        transcript,
    })
}
