//! Quality gates: named checks whose pass criteria decide whether a coder
//! run may commit.
//!
//! Gates execute in declared order through the sandbox. A gate whose command
//! is not allowlisted reports `passed = false` with `error = "forbidden"`
//! and never spawns a process. A timeout is a gate failure, not a phase
//! failure.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::{CommandSpec, Sandbox};
use crate::errors::WorkflowError;
use crate::events::EventKind;

// ── Specs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PassCriteria {
    /// Pass iff the command exits 0. `exit_code_0` is accepted as a legacy
    /// spelling in configuration.
    #[serde(alias = "exit_code_0")]
    #[default]
    ExitCodeZero,
    /// Pass iff the captured output contains `expected` literally.
    OutputContains,
    /// Pass iff `expected`, as a regex, matches anywhere in the output.
    OutputMatches,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub pass_criteria: PassCriteria,
    /// Literal substring or regex, depending on the criteria.
    #[serde(default)]
    pub expected: Option<String>,
    /// Seconds; falls back to the project gate timeout when absent.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Also search stderr for `expected`. Exit-code gates ignore this.
    #[serde(default)]
    pub match_stderr: bool,
}

impl GateSpec {
    pub fn exit_code(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            pass_criteria: PassCriteria::ExitCodeZero,
            expected: None,
            timeout: None,
            match_stderr: false,
        }
    }
}

// ── Results ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSummary {
    pub total: usize,
    pub passed: usize,
    pub all_passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateReport {
    pub results: Vec<GateResult>,
    pub summary: GateSummary,
}

impl GateReport {
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            summary: GateSummary {
                total: 0,
                passed: 0,
                all_passed: true,
            },
        }
    }

    fn from_results(results: Vec<GateResult>) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        Self {
            results,
            summary: GateSummary {
                total,
                passed,
                all_passed: passed == total,
            },
        }
    }

    pub fn all_passed(&self) -> bool {
        self.summary.all_passed
    }

    /// `N/M passed`, as carried in commit trailers.
    pub fn tally(&self) -> String {
        format!("{}/{} passed", self.summary.passed, self.summary.total)
    }
}

// ── Runner ────────────────────────────────────────────────────────────

pub struct GateRunner<'a> {
    sandbox: &'a Sandbox,
    default_timeout: Duration,
    /// Stop at the first failing gate instead of running the full list.
    fail_fast: bool,
    project_id: i64,
    task_id: Option<i64>,
}

impl<'a> GateRunner<'a> {
    pub fn new(sandbox: &'a Sandbox, default_timeout: Duration, fail_fast: bool) -> Self {
        Self {
            sandbox,
            default_timeout,
            fail_fast,
            project_id: 0,
            task_id: None,
        }
    }

    pub fn for_task(mut self, project_id: i64, task_id: Option<i64>) -> Self {
        self.project_id = project_id;
        self.task_id = task_id;
        self
    }

    pub async fn run_gates(&self, gates: &[GateSpec]) -> GateReport {
        let mut results = Vec::with_capacity(gates.len());
        for gate in gates {
            let result = self.run_gate(gate).await;
            let failed = !result.passed;
            results.push(result);
            if failed && self.fail_fast {
                break;
            }
        }
        GateReport::from_results(results)
    }

    pub async fn run_gate(&self, gate: &GateSpec) -> GateResult {
        let started = std::time::Instant::now();

        // Disallowed commands never execute; the result records the refusal.
        if !self.sandbox.is_command_allowed(&gate.command) {
            let result = GateResult {
                name: gate.name.clone(),
                passed: false,
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
                error: Some("forbidden".to_string()),
            };
            self.publish_result(&result);
            return result;
        }

        let timeout = Duration::from_secs(gate.timeout.unwrap_or(self.default_timeout.as_secs()));
        let spec = CommandSpec::new(
            gate.command.clone(),
            &gate.args.iter().map(String::as_str).collect::<Vec<_>>(),
        )
        .with_timeout(timeout);

        let result = match self.sandbox.run(spec).await {
            Ok(output) => {
                let passed = evaluate(gate, output.exit_code, &output.stdout, &output.stderr);
                GateResult {
                    name: gate.name.clone(),
                    passed,
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    duration_ms: output.wall_time.as_millis() as u64,
                    error: None,
                }
            }
            Err(err @ WorkflowError::Timeout { .. }) => GateResult {
                name: gate.name.clone(),
                passed: false,
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: started.elapsed().as_millis() as u64,
                error: Some(format!("timeout: {err}")),
            },
            Err(err) => GateResult {
                name: gate.name.clone(),
                passed: false,
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: started.elapsed().as_millis() as u64,
                error: Some(err.to_string()),
            },
        };

        self.publish_result(&result);
        result
    }

    fn publish_result(&self, result: &GateResult) {
        if self.project_id == 0 {
            return;
        }
        let bus_payload = serde_json::json!({
            "gate": result.name,
            "passed": result.passed,
            "exit_code": result.exit_code,
            "task_id": self.task_id,
            "error": result.error,
        });
        let bus = |kind: EventKind| match self.task_id {
            Some(task_id) => {
                self.sandbox_bus()
                    .publish_task(kind, self.project_id, task_id, bus_payload.clone())
            }
            None => self
                .sandbox_bus()
                .publish(kind, Some(self.project_id), bus_payload.clone()),
        };
        bus(EventKind::GateExecuted);
        bus(if result.passed {
            EventKind::GatePassed
        } else {
            EventKind::GateFailed
        });
    }

    fn sandbox_bus(&self) -> &crate::events::EventBus {
        self.sandbox.bus()
    }
}

fn evaluate(gate: &GateSpec, exit_code: i32, stdout: &str, stderr: &str) -> bool {
    match gate.pass_criteria {
        PassCriteria::ExitCodeZero => exit_code == 0,
        PassCriteria::OutputContains => match &gate.expected {
            Some(expected) => {
                stdout.contains(expected) || (gate.match_stderr && stderr.contains(expected))
            }
            // Missing expectation falls back to the exit code.
            None => exit_code == 0,
        },
        PassCriteria::OutputMatches => match &gate.expected {
            Some(expected) => match regex::Regex::new(expected) {
                Ok(pattern) => {
                    pattern.is_match(stdout) || (gate.match_stderr && pattern.is_match(stderr))
                }
                // Invalid regex falls back to the exit code, as a gate
                // misconfiguration must not mask a failing command.
                Err(_) => exit_code == 0,
            },
            None => exit_code == 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxSettings;
    use crate::events::EventBus;
    use tempfile::tempdir;

    fn sandbox(dir: &std::path::Path) -> Sandbox {
        let settings = SandboxSettings {
            allowed_commands: Some(vec![
                "echo".to_string(),
                "true".to_string(),
                "false".to_string(),
                "sh".to_string(),
            ]),
            ..SandboxSettings::default()
        };
        Sandbox::from_config(dir, &settings, EventBus::default(), 1).unwrap()
    }

    fn gate(criteria: PassCriteria, expected: Option<&str>) -> GateSpec {
        GateSpec {
            name: "check".to_string(),
            command: "echo".to_string(),
            args: vec!["build finished OK".to_string()],
            pass_criteria: criteria,
            expected: expected.map(|s| s.to_string()),
            timeout: None,
            match_stderr: false,
        }
    }

    #[test]
    fn pass_criteria_parses_legacy_alias() {
        let parsed: PassCriteria = serde_json::from_str("\"exit_code_0\"").unwrap();
        assert_eq!(parsed, PassCriteria::ExitCodeZero);
        let canonical: PassCriteria = serde_json::from_str("\"exit_code_zero\"").unwrap();
        assert_eq!(canonical, PassCriteria::ExitCodeZero);
        // Canonical form is what we serialize.
        assert_eq!(
            serde_json::to_string(&PassCriteria::ExitCodeZero).unwrap(),
            "\"exit_code_zero\""
        );
    }

    #[test]
    fn evaluate_exit_code_zero() {
        let g = gate(PassCriteria::ExitCodeZero, None);
        assert!(evaluate(&g, 0, "", ""));
        assert!(!evaluate(&g, 1, "", ""));
    }

    #[test]
    fn evaluate_output_contains() {
        let g = gate(PassCriteria::OutputContains, Some("finished OK"));
        assert!(evaluate(&g, 1, "build finished OK", ""));
        assert!(!evaluate(&g, 0, "build failed", ""));
    }

    #[test]
    fn evaluate_output_contains_checks_stderr_only_when_configured() {
        let mut g = gate(PassCriteria::OutputContains, Some("warning"));
        assert!(!evaluate(&g, 0, "", "warning: deprecated"));
        g.match_stderr = true;
        assert!(evaluate(&g, 0, "", "warning: deprecated"));
    }

    #[test]
    fn evaluate_output_matches_regex_at_end_boundary() {
        let g = gate(PassCriteria::OutputMatches, Some(r"\d+ passed$"));
        assert!(evaluate(&g, 0, "12 passed", ""));
        assert!(!evaluate(&g, 0, "12 passed, 1 failed", ""));
    }

    #[test]
    fn evaluate_invalid_regex_falls_back_to_exit_code() {
        let g = gate(PassCriteria::OutputMatches, Some("[unclosed"));
        assert!(evaluate(&g, 0, "anything", ""));
        assert!(!evaluate(&g, 1, "anything", ""));
    }

    #[test]
    fn evaluate_missing_expected_falls_back_to_exit_code() {
        let g = gate(PassCriteria::OutputContains, None);
        assert!(evaluate(&g, 0, "", ""));
        assert!(!evaluate(&g, 2, "", ""));
    }

    #[tokio::test]
    async fn gate_passes_on_exit_zero() {
        let dir = tempdir().unwrap();
        let sb = sandbox(dir.path());
        let runner = GateRunner::new(&sb, Duration::from_secs(10), false);

        let result = runner
            .run_gate(&GateSpec::exit_code("truth", "true", &[]))
            .await;
        assert!(result.passed);
        assert_eq!(result.exit_code, 0);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn gate_fails_on_nonzero_exit() {
        let dir = tempdir().unwrap();
        let sb = sandbox(dir.path());
        let runner = GateRunner::new(&sb, Duration::from_secs(10), false);

        let result = runner
            .run_gate(&GateSpec::exit_code("lies", "false", &[]))
            .await;
        assert!(!result.passed);
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn forbidden_gate_reports_without_executing() {
        let dir = tempdir().unwrap();
        let sb = sandbox(dir.path());
        let runner = GateRunner::new(&sb, Duration::from_secs(10), false);

        let result = runner
            .run_gate(&GateSpec::exit_code("nope", "pytest", &[]))
            .await;
        assert!(!result.passed);
        assert_eq!(result.error.as_deref(), Some("forbidden"));
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn gate_timeout_is_a_gate_failure() {
        let dir = tempdir().unwrap();
        let settings = SandboxSettings {
            allowed_commands: Some(vec!["sleep".to_string()]),
            ..SandboxSettings::default()
        };
        let sb = Sandbox::from_config(dir.path(), &settings, EventBus::default(), 1).unwrap();
        let runner = GateRunner::new(&sb, Duration::from_secs(10), false);

        let spec = GateSpec {
            name: "slow".to_string(),
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            pass_criteria: PassCriteria::ExitCodeZero,
            expected: None,
            timeout: Some(1),
            match_stderr: false,
        };
        let result = runner.run_gate(&spec).await;
        assert!(!result.passed);
        assert!(result.error.as_deref().unwrap().starts_with("timeout"));
    }

    #[tokio::test]
    async fn run_gates_default_runs_all_and_reports_all() {
        let dir = tempdir().unwrap();
        let sb = sandbox(dir.path());
        let runner = GateRunner::new(&sb, Duration::from_secs(10), false);

        let report = runner
            .run_gates(&[
                GateSpec::exit_code("first", "false", &[]),
                GateSpec::exit_code("second", "true", &[]),
            ])
            .await;
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.passed, 1);
        assert!(!report.all_passed());
        assert_eq!(report.tally(), "1/2 passed");
    }

    #[tokio::test]
    async fn run_gates_fail_fast_short_circuits() {
        let dir = tempdir().unwrap();
        let sb = sandbox(dir.path());
        let runner = GateRunner::new(&sb, Duration::from_secs(10), true);

        let report = runner
            .run_gates(&[
                GateSpec::exit_code("first", "false", &[]),
                GateSpec::exit_code("never-runs", "true", &[]),
            ])
            .await;
        assert_eq!(report.results.len(), 1);
        assert!(!report.all_passed());
    }

    #[tokio::test]
    async fn empty_gate_list_is_all_passed() {
        let dir = tempdir().unwrap();
        let sb = sandbox(dir.path());
        let runner = GateRunner::new(&sb, Duration::from_secs(10), false);
        let report = runner.run_gates(&[]).await;
        assert!(report.all_passed());
        assert_eq!(report.tally(), "0/0 passed");
    }
}
