//! Coder phase: sandboxed implementation runs gated by human approval.
//!
//! Preconditions: the task is APPROVED, its dependencies are COMPLETED, and
//! the project is not paused. A run streams the engine under the sandbox,
//! executes the task's gates, and commits through the VCS adapter only when
//! every gate passes. Gate failure reverts the task to APPROVED until the
//! attempt budget is exhausted, which rejects it. Pause and engine switches
//! are honored at every suspension point: the session is aborted
//! gracefully, never killed silently.

use std::time::Duration;

use crate::errors::{Result, WorkflowError};
use crate::gates::{GateReport, GateRunner};
use crate::store::models::{
    ArtifactKind, PhaseType, Run, RunStatus, Task, TaskStatus, TaskVersion,
};

use super::context::{ContextBundle, SAFETY_RULES};
use super::parse::ArchitecturePayload;
use super::{ProjectContext, begin_run, finish_run, run_status_for_error};
use crate::events::EventKind;

const CODER_INSTRUCTION: &str = r#"You are an implementation engineer. Make the described task true in this working directory by creating and editing files.

Rules:
- Implement exactly the task below; satisfy every acceptance criterion.
- Quality gates run after you finish; your work is only committed when all of them pass."#;

/// How often the stream loop re-checks control state for pause and engine
/// switches.
const CONTROL_POLL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct CoderOutcome {
    pub run: Run,
    pub task: Task,
    pub gates: GateReport,
    /// Revision id when the run committed.
    pub committed: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    NoReady,
    Paused,
}

#[derive(Debug)]
pub struct LoopEntry {
    pub task_id: i64,
    pub run_id: i64,
    pub completed: bool,
}

#[derive(Debug)]
pub struct CoderLoopReport {
    pub executed: Vec<LoopEntry>,
    pub stopped: LoopStop,
}

enum SessionEnd {
    Finished(String, Result<()>),
    Paused(String),
    EngineSwitched(String),
}

// ── Commit message ────────────────────────────────────────────────────

/// `<type>(task-<id> v<version>): <title>` with a structured trailer.
pub fn commit_message(
    task: &Task,
    version: &TaskVersion,
    gates: &GateReport,
    approver: &str,
    run_id: i64,
) -> String {
    let commit_type = task.metadata_str("commit_type").unwrap_or("feat");
    format!(
        "{commit_type}(task-{} v{}): {}\n\n\
         Task-Id: {}\n\
         Phase: coder\n\
         Gates: {}\n\
         Approver: {}\n\
         Run-Id: {}\n",
        task.id,
        version.version_num,
        version.title,
        task.id,
        gates.tally(),
        approver,
        run_id,
    )
}

// ── Single-task run ───────────────────────────────────────────────────

pub async fn run_coder_task(ctx: &ProjectContext, task_id: i64) -> Result<CoderOutcome> {
    let control = ctx.governance.control_state().await?;
    if control.paused {
        return Err(WorkflowError::Preconditions("project is paused".into()));
    }

    let task = ctx.store.call(move |s| s.get_task(task_id)).await?;
    if task.status != TaskStatus::Approved {
        return Err(WorkflowError::Preconditions(format!(
            "coder requires an approved task; task {task_id} is {}",
            task.status
        )));
    }
    let version = ctx.store.call(move |s| s.active_version(task_id)).await?;
    for &dep in &version.depends_on {
        let dep_task = ctx.store.call(move |s| s.get_task(dep)).await?;
        if dep_task.status != TaskStatus::Completed {
            return Err(WorkflowError::Preconditions(format!(
                "dependency task {dep} is {}, not completed",
                dep_task.status
            )));
        }
    }
    let max_attempts = control.max_attempts;

    // The loop exists for engine switches: a switch aborts the session and
    // restarts from context assembly with the new engine.
    loop {
        let (engine_name, engine) = ctx.current_engine().await?;
        let run = begin_run(ctx, PhaseType::Coder, Some(task_id), &engine_name).await?;

        ctx.governance
            .set_status(task_id, TaskStatus::InProgress)
            .await?;
        let attempts = ctx.store.call(move |s| s.bump_attempts(task_id)).await?;
        let project_id = ctx.project_id;
        ctx.store
            .call(move |s| s.set_current_task(project_id, Some(task_id)))
            .await?;
        ctx.store
            .call(move |s| s.set_task_phase(task_id, PhaseType::Coder))
            .await?;
        ctx.store
            .call(move |s| s.update_project(project_id, Some(PhaseType::Coder), None, None))
            .await?;

        let prompt = build_coder_prompt(ctx, &task, &version).await?;
        ctx.artifacts
            .put_text(ArtifactKind::Other, &prompt, Some(task_id), Some(run.id))
            .await?;
        let timeout = ctx.session_timeout().await?;

        let session = match engine
            .start(crate::engine::SessionRequest {
                prompt,
                workdir: ctx.root.clone(),
                timeout,
            })
            .await
        {
            Ok(session) => session,
            Err(err) => {
                finish_run(ctx, &run, run_status_for_error(&err), Some(&err.to_string()), None)
                    .await?;
                revert_after_failure(ctx, task_id, attempts, max_attempts).await?;
                clear_current_task(ctx).await?;
                return Err(err);
            }
        };

        match pump_with_control(ctx, &run, session, &engine_name).await? {
            SessionEnd::Paused(partial) => {
                persist_transcript(ctx, task_id, run.id, &partial).await?;
                finish_run(ctx, &run, RunStatus::Cancelled, Some("paused"), None).await?;
                // A pause is an interruption, not a failed attempt.
                ctx.governance
                    .set_status(task_id, TaskStatus::Approved)
                    .await?;
                clear_current_task(ctx).await?;
                ctx.bus.publish_task(
                    EventKind::ExecutionPaused,
                    ctx.project_id,
                    task_id,
                    serde_json::json!({"run_id": run.id, "interrupted": true}),
                );
                return Err(WorkflowError::Cancelled(format!(
                    "coder run {} paused",
                    run.id
                )));
            }
            SessionEnd::EngineSwitched(partial) => {
                persist_transcript(ctx, task_id, run.id, &partial).await?;
                finish_run(ctx, &run, RunStatus::Cancelled, Some("engine_switch"), None).await?;
                ctx.governance
                    .set_status(task_id, TaskStatus::Approved)
                    .await?;
                tracing::info!(task = task_id, "engine switched; restarting coder phase");
                continue;
            }
            SessionEnd::Finished(text, outcome) => {
                persist_transcript(ctx, task_id, run.id, &text).await?;
                if let Err(err) = outcome {
                    finish_run(ctx, &run, run_status_for_error(&err), Some(&err.to_string()), None)
                        .await?;
                    revert_after_failure(ctx, task_id, attempts, max_attempts).await?;
                    clear_current_task(ctx).await?;
                    return Err(err);
                }

                let gates = run_task_gates(ctx, task_id, &version).await;
                if gates.all_passed() {
                    let committed = commit_task(ctx, &task, &version, &gates, run.id).await?;
                    ctx.governance
                        .set_status(task_id, TaskStatus::Completed)
                        .await?;
                    let run = finish_run(ctx, &run, RunStatus::Success, None, Some(&gates)).await?;
                    clear_current_task(ctx).await?;
                    let task = ctx.store.call(move |s| s.get_task(task_id)).await?;
                    return Ok(CoderOutcome {
                        run,
                        task,
                        gates,
                        committed,
                    });
                }

                let run =
                    finish_run(ctx, &run, RunStatus::Failure, Some("gates_failed"), Some(&gates))
                        .await?;
                revert_after_failure(ctx, task_id, attempts, max_attempts).await?;
                clear_current_task(ctx).await?;
                let task = ctx.store.call(move |s| s.get_task(task_id)).await?;
                return Ok(CoderOutcome {
                    run,
                    task,
                    gates,
                    committed: None,
                });
            }
        }
    }
}

// ── Coder loop ────────────────────────────────────────────────────────

/// Drain ready approved tasks: Selecting -> Executing -> Committing until
/// no task is ready or the project pauses. Scheduling decisions run under
/// the per-project control lock.
pub async fn run_coder_loop(ctx: &ProjectContext) -> Result<CoderLoopReport> {
    let _guard = ctx.coder_lock.lock().await;
    let mut executed = Vec::new();

    loop {
        let control = ctx.governance.control_state().await?;
        if control.paused {
            return Ok(CoderLoopReport {
                executed,
                stopped: LoopStop::Paused,
            });
        }

        let Some(task) = select_ready(ctx).await? else {
            return Ok(CoderLoopReport {
                executed,
                stopped: LoopStop::NoReady,
            });
        };

        match run_coder_task(ctx, task.id).await {
            Ok(outcome) => {
                executed.push(LoopEntry {
                    task_id: outcome.task.id,
                    run_id: outcome.run.id,
                    completed: outcome.task.status == TaskStatus::Completed,
                });
            }
            Err(WorkflowError::Cancelled(_)) => {
                return Ok(CoderLoopReport {
                    executed,
                    stopped: LoopStop::Paused,
                });
            }
            Err(err) => {
                // Attempts accounting already moved the task toward
                // rejection; log and keep draining.
                tracing::warn!(task = task.id, "coder run failed: {err}");
            }
        }

        if executed.len() > 500 {
            return Err(WorkflowError::Internal(
                "coder loop exceeded 500 runs without draining".into(),
            ));
        }
    }
}

/// Highest-priority approved task whose dependencies are all completed.
pub async fn select_ready(ctx: &ProjectContext) -> Result<Option<Task>> {
    let project_id = ctx.project_id;
    let approved = ctx
        .store
        .call(move |s| s.list_tasks(project_id, Some(TaskStatus::Approved)))
        .await?;

    'candidates: for task in approved {
        let task_id = task.id;
        let version = ctx.store.call(move |s| s.active_version(task_id)).await?;
        for &dep in &version.depends_on {
            let dep_task = ctx.store.call(move |s| s.get_task(dep)).await?;
            if dep_task.status != TaskStatus::Completed {
                continue 'candidates;
            }
        }
        return Ok(Some(task));
    }
    Ok(None)
}

// ── Internals ─────────────────────────────────────────────────────────

/// Stream the session while watching control state. Pause and engine
/// switches abort the session with the bounded grace the engine layer
/// provides.
async fn pump_with_control(
    ctx: &ProjectContext,
    run: &Run,
    mut session: crate::engine::EngineSession,
    engine_name: &str,
) -> Result<SessionEnd> {
    let mut transcript = String::new();
    let mut poll = tokio::time::interval(CONTROL_POLL);
    poll.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            chunk = session.next_chunk() => match chunk {
                Some(chunk) => {
                    ctx.bus.publish_correlated(
                        EventKind::RunLog,
                        Some(ctx.project_id),
                        run.task_id,
                        &run.correlation_id,
                        serde_json::json!({"stream": "engine", "chunk": chunk}),
                    );
                    transcript.push_str(&chunk);
                }
                None => {
                    let (rest, outcome) = session.collect().await;
                    transcript.push_str(&rest);
                    return Ok(SessionEnd::Finished(transcript, outcome));
                }
            },
            _ = poll.tick() => {
                let control = ctx.governance.control_state().await?;
                if control.paused {
                    session.stop().await;
                    return Ok(SessionEnd::Paused(transcript));
                }
                let project = ctx.project().await?;
                if project.default_engine != engine_name {
                    session.stop().await;
                    return Ok(SessionEnd::EngineSwitched(transcript));
                }
            }
        }
    }
}

async fn build_coder_prompt(
    ctx: &ProjectContext,
    task: &Task,
    version: &TaskVersion,
) -> Result<String> {
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

    // Selected architecture option, when a human has picked one.
    let project = ctx.project().await?;
    let architecture = match &project.selected_option {
        Some(option_id) => selected_option_text(ctx, option_id).await?,
        None => None,
    };

    // The most recent failed run's gate results tell the engine what went
    // wrong last time.
    let task_id = task.id;
    let project_id = ctx.project_id;
    let failures = ctx
        .store
        .call(move |s| s.list_runs(project_id, Some(task_id)))
        .await?
        .into_iter()
        .find(|run| run.status == RunStatus::Failure)
        .and_then(|run| run.gate_results)
        .map(|report| {
            report
                .results
                .iter()
                .filter(|r| !r.passed)
                .map(|r| {
                    format!(
                        "Gate {} failed (exit {}):\n{}\n{}",
                        r.name, r.exit_code, r.stdout, r.stderr
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n")
        });

    // Selected files: the architect's hints from task metadata when present,
    // otherwise a keyword match over the repository listing.
    let hints: Vec<String> = task
        .metadata
        .get("file_hints")
        .and_then(|v| v.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let task_text = format!("{} {}", version.title, version.description);
    let selected = super::context::select_files(&ctx.root, &hints, &task_text);
    let files_section = (!selected.is_empty()).then(|| {
        selected
            .iter()
            .map(|file| format!("- {file}"))
            .collect::<Vec<_>>()
            .join("\n")
    });

    Ok(ContextBundle::new(CODER_INSTRUCTION)
        .section("Safety rules", SAFETY_RULES)
        .section("Task", &task_section)
        .section_opt("Selected files", files_section.as_deref())
        .section_opt("Selected architecture", architecture.as_deref())
        .section_opt("Previous failures", failures.as_deref())
        .render())
}

async fn selected_option_text(ctx: &ProjectContext, option_id: &str) -> Result<Option<String>> {
    let project_id = ctx.project_id;
    let Some(artifact) = ctx
        .store
        .call(move |s| s.latest_artifact(project_id, ArtifactKind::Architecture))
        .await?
    else {
        return Ok(None);
    };
    let text = ctx.artifacts.read_to_string(&artifact).await?;
    let Ok(architecture) = serde_json::from_str::<ArchitecturePayload>(&text) else {
        return Ok(None);
    };
    Ok(architecture
        .options
        .iter()
        .find(|option| option.id == option_id)
        .map(|option| {
            format!(
                "{} ({})\n\n{}\n\nTrade-offs: {}",
                option.name, option.id, option.description, option.trade_offs
            )
        }))
}

async fn run_task_gates(ctx: &ProjectContext, task_id: i64, version: &TaskVersion) -> GateReport {
    if !ctx.config.gates.enabled || version.gates.is_empty() {
        return GateReport::empty();
    }
    GateRunner::new(
        &ctx.sandbox,
        Duration::from_secs(ctx.config.gates.timeout),
        ctx.config.gates.fail_on_error,
    )
    .for_task(ctx.project_id, Some(task_id))
    .run_gates(&version.gates)
    .await
}

async fn commit_task(
    ctx: &ProjectContext,
    task: &Task,
    version: &TaskVersion,
    gates: &GateReport,
    run_id: i64,
) -> Result<Option<String>> {
    ctx.vcs.init().await?;
    let status = ctx.vcs.status().await?;
    let mut files = status.staged;
    files.extend(status.unstaged);
    files.extend(status.untracked);
    // The control plane's own bookkeeping never goes into the repository.
    files.retain(|file| !file.starts_with(".foreman/"));
    files.sort();
    files.dedup();
    if files.is_empty() {
        return Ok(None);
    }

    let task_id = task.id;
    let approver = ctx
        .store
        .call(move |s| s.latest_approver(task_id))
        .await?
        .unwrap_or_else(|| "unknown".to_string());

    let message = commit_message(task, version, gates, &approver, run_id);
    let sha = ctx.vcs.commit(&files, &message).await?;
    Ok(Some(sha))
}

async fn revert_after_failure(
    ctx: &ProjectContext,
    task_id: i64,
    attempts: i64,
    max_attempts: i64,
) -> Result<()> {
    ctx.governance
        .set_status(task_id, TaskStatus::Approved)
        .await?;
    if attempts >= max_attempts {
        ctx.store
            .call(move |s| {
                s.merge_task_metadata(task_id, &serde_json::json!({"reason": "exhausted"}))
            })
            .await?;
        ctx.governance
            .set_status(task_id, TaskStatus::Rejected)
            .await?;
        tracing::warn!(task = task_id, attempts, "attempt budget exhausted");
    }
    Ok(())
}

async fn persist_transcript(
    ctx: &ProjectContext,
    task_id: i64,
    run_id: i64,
    text: &str,
) -> Result<()> {
    if text.is_empty() {
        return Ok(());
    }
    ctx.artifacts
        .put_text(ArtifactKind::Transcript, text, Some(task_id), Some(run_id))
        .await?;
    Ok(())
}

async fn clear_current_task(ctx: &ProjectContext) -> Result<()> {
    let project_id = ctx.project_id;
    ctx.store
        .call(move |s| s.set_current_task(project_id, None))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_fixture(id: i64, metadata: serde_json::Value) -> Task {
        Task {
            id,
            project_id: 1,
            title: "Add login".to_string(),
            description: String::new(),
            priority: 0,
            status: TaskStatus::Approved,
            current_phase: Some(PhaseType::Coder),
            attempts: 0,
            active_version_id: Some(1),
            metadata,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn version_fixture(task_id: i64, version_num: i64) -> TaskVersion {
        TaskVersion {
            id: 1,
            task_id,
            version_num,
            title: "Add login".to_string(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            depends_on: Vec::new(),
            gates: Vec::new(),
            phase: None,
            created_at: String::new(),
        }
    }

    fn report(passed: usize, total: usize) -> GateReport {
        let results = (0..total)
            .map(|i| crate::gates::GateResult {
                name: format!("gate-{i}"),
                passed: i < passed,
                exit_code: if i < passed { 0 } else { 1 },
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 1,
                error: None,
            })
            .collect::<Vec<_>>();
        let mut gates = GateReport::empty();
        gates.summary.total = total;
        gates.summary.passed = passed;
        gates.summary.all_passed = passed == total;
        gates.results = results;
        gates
    }

    #[test]
    fn commit_message_first_line_and_trailers() {
        let task = task_fixture(12, serde_json::json!({}));
        let version = version_fixture(12, 3);
        let message = commit_message(&task, &version, &report(2, 2), "alice", 77);

        let first = message.lines().next().unwrap();
        assert_eq!(first, "feat(task-12 v3): Add login");
        assert!(message.contains("Task-Id: 12"));
        assert!(message.contains("Phase: coder"));
        assert!(message.contains("Gates: 2/2 passed"));
        assert!(message.contains("Approver: alice"));
        assert!(message.contains("Run-Id: 77"));
    }

    #[test]
    fn commit_type_is_configurable_via_metadata() {
        let task = task_fixture(4, serde_json::json!({"commit_type": "fix"}));
        let version = version_fixture(4, 1);
        let message = commit_message(&task, &version, &report(1, 1), "bob", 5);
        assert!(message.starts_with("fix(task-4 v1): Add login"));
    }
}
