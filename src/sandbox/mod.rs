//! Sandbox: path allow/deny resolution plus command allow/deny execution.
//!
//! The facade couples the two services to the event bus: every violation
//! publishes a `security` event before the `Forbidden` error propagates,
//! and every run emits incremental `run_log` chunks and a final `run_ended`.

pub mod paths;
pub mod run;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use paths::PathResolver;
pub use run::{ChunkHook, CommandOutput, CommandRunner, CommandSpec, StreamSource};

use crate::config::SandboxSettings;
use crate::errors::{Result, WorkflowError};
use crate::events::{EventBus, EventKind};

pub struct Sandbox {
    resolver: PathResolver,
    runner: CommandRunner,
    bus: EventBus,
    project_id: i64,
}

impl Sandbox {
    pub fn from_config(
        root: &Path,
        settings: &SandboxSettings,
        bus: EventBus,
        project_id: i64,
    ) -> Result<Self> {
        let resolver = PathResolver::new(root, &settings.allowed_paths, &settings.blocked_paths)?;
        let runner = CommandRunner::new(
            settings.allowed_command_set(),
            settings.blocked_command_set(),
            Duration::from_secs(settings.command_timeout),
            root.join(".foreman/tmp"),
        );
        Ok(Self {
            resolver,
            runner,
            bus,
            project_id,
        })
    }

    /// A sandbox restricted to a fixed command set, sharing the project's
    /// path rules. Used by the VCS adapter, which may only ever run git.
    pub fn for_commands(
        root: &Path,
        commands: &[&str],
        timeout: Duration,
        bus: EventBus,
        project_id: i64,
    ) -> Result<Self> {
        let resolver = PathResolver::new(root, &["**/*".to_string()], &[])?;
        let runner = CommandRunner::new(
            Some(commands.iter().map(|s| s.to_string()).collect()),
            Default::default(),
            timeout,
            root.join(".foreman/tmp"),
        );
        Ok(Self {
            resolver,
            runner,
            bus,
            project_id,
        })
    }

    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn project_id(&self) -> i64 {
        self.project_id
    }

    pub fn is_command_allowed(&self, program: &str) -> bool {
        self.runner.is_allowed(program)
    }

    pub fn resolve_path(&self, requested: &Path) -> Result<PathBuf> {
        self.resolver.resolve(requested).inspect_err(|err| {
            if matches!(err, WorkflowError::Forbidden(_)) {
                self.security_event("path", &requested.display().to_string(), err);
            }
        })
    }

    pub async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let correlation = spec.correlation_id.clone();
        let program = spec.program.clone();

        let bus = self.bus.clone();
        let project_id = self.project_id;
        let hook_correlation = correlation.clone();
        let hook: ChunkHook = Arc::new(move |source: StreamSource, chunk: &str| {
            bus.publish_correlated(
                EventKind::RunLog,
                Some(project_id),
                None,
                hook_correlation.as_deref().unwrap_or(""),
                serde_json::json!({"stream": source.as_str(), "chunk": chunk}),
            );
        });

        let result = self.runner.run(&self.resolver, spec, Some(hook)).await;

        match &result {
            Ok(output) => {
                self.bus.publish_correlated(
                    EventKind::RunEnded,
                    Some(self.project_id),
                    None,
                    correlation.as_deref().unwrap_or(""),
                    serde_json::json!({
                        "command": program,
                        "exit_code": output.exit_code,
                        "wall_ms": output.wall_time.as_millis() as u64,
                    }),
                );
            }
            Err(err @ WorkflowError::Timeout { .. }) => {
                self.bus.publish_correlated(
                    EventKind::RunEnded,
                    Some(self.project_id),
                    None,
                    correlation.as_deref().unwrap_or(""),
                    serde_json::json!({
                        "command": program,
                        "status": "timeout",
                        "error": err.to_string(),
                    }),
                );
            }
            Err(err @ WorkflowError::Forbidden(_)) => {
                self.security_event("command", &program, err);
            }
            Err(_) => {}
        }

        result
    }

    fn security_event(&self, what: &str, subject: &str, err: &WorkflowError) {
        tracing::warn!(project = self.project_id, %subject, "sandbox violation: {err}");
        self.bus.publish(
            EventKind::Security,
            Some(self.project_id),
            serde_json::json!({
                "violation": what,
                "subject": subject,
                "error": err.to_string(),
            }),
        );
    }
}
