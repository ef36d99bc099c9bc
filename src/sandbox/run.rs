//! Allow/deny command execution with timeouts and captured streams.
//!
//! Commands are spawned directly as child processes (never through a shell),
//! with an environment built only from an explicit allowlist. Output is
//! captured into bounded in-memory buffers; overflow spills to a file under
//! the project's temp directory. On timeout the child receives SIGTERM,
//! then SIGKILL after a grace period. Exit codes that cannot be determined
//! (signal death) normalize to -1.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::errors::{Result, WorkflowError};
use crate::sandbox::paths::PathResolver;

/// Commands blocked regardless of project configuration.
pub const DEFAULT_BLOCKED_COMMANDS: &[&str] = &[
    "rm", "rmdir", "dd", "mkfs", "fdisk", "parted", "chmod", "chown", "chgrp", "sudo", "su",
    "wget", "curl", "nc", "netcat", "ssh", "scp", "sftp", "systemctl", "service", "reboot",
    "shutdown", "poweroff", "halt",
];

/// Ambient variables the child may inherit. Everything else is scrubbed.
pub(crate) const ENV_ALLOWLIST: &[&str] =
    &["PATH", "HOME", "LANG", "LC_ALL", "TERM", "TMPDIR", "USER"];

/// In-memory capture cap per stream; the remainder spills to disk.
const MAX_CAPTURE_BYTES: usize = 1 << 20;

/// How long a SIGTERM'd child gets before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Hook invoked with each captured chunk, for incremental `run_log` events.
pub type ChunkHook = Arc<dyn Fn(StreamSource, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory, relative to the project root. Defaults to the root.
    pub cwd: Option<PathBuf>,
    /// Explicit extra environment on top of the ambient allowlist.
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
    /// Ties `run_log`/`run_ended` events back to a run row.
    pub correlation_id: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: HashMap::new(),
            timeout: None,
            stdin: None,
            correlation_id: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub wall_time: Duration,
    /// Set when a stream exceeded the in-memory cap; the full stream is in
    /// the named spill file.
    pub stdout_overflow: Option<PathBuf>,
    pub stderr_overflow: Option<PathBuf>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct CommandRunner {
    allowed: Option<HashSet<String>>,
    blocked: HashSet<String>,
    default_timeout: Duration,
    spill_dir: PathBuf,
}

impl CommandRunner {
    pub fn new(
        allowed: Option<HashSet<String>>,
        extra_blocked: HashSet<String>,
        default_timeout: Duration,
        spill_dir: PathBuf,
    ) -> Self {
        let mut blocked: HashSet<String> = DEFAULT_BLOCKED_COMMANDS
            .iter()
            .map(|s| s.to_string())
            .collect();
        blocked.extend(extra_blocked);
        Self {
            allowed,
            blocked,
            default_timeout,
            spill_dir,
        }
    }

    /// Blocklist wins over the allowlist; without an allowlist only the
    /// blocklist applies.
    pub fn validate(&self, program: &str) -> Result<()> {
        let basename = program.rsplit('/').next().unwrap_or("").trim();
        if basename.is_empty() {
            return Err(WorkflowError::Validation("empty command".to_string()));
        }
        if self.blocked.contains(basename) {
            return Err(WorkflowError::Forbidden(format!(
                "command {basename:?} is blocked"
            )));
        }
        if let Some(allowed) = &self.allowed
            && !allowed.contains(basename)
        {
            return Err(WorkflowError::Forbidden(format!(
                "command {basename:?} is not in the allowlist"
            )));
        }
        Ok(())
    }

    pub fn is_allowed(&self, program: &str) -> bool {
        self.validate(program).is_ok()
    }

    pub async fn run(
        &self,
        resolver: &PathResolver,
        spec: CommandSpec,
        chunk_hook: Option<ChunkHook>,
    ) -> Result<CommandOutput> {
        self.validate(&spec.program)?;

        let cwd = match &spec.cwd {
            Some(dir) => resolver.resolve(dir)?,
            None => resolver.root().to_path_buf(),
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&cwd)
            .env_clear()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            WorkflowError::Storage(format!("failed to spawn {}: {e}", spec.program))
        })?;

        if let Some(input) = spec.stdin.clone()
            && let Some(mut stdin) = child.stdin.take()
        {
            tokio::spawn(async move {
                let _ = stdin.write_all(input.as_bytes()).await;
                // Dropping the handle closes the pipe.
            });
        }

        let stdout_task = self.capture(
            child.stdout.take(),
            StreamSource::Stdout,
            chunk_hook.clone(),
        );
        let stderr_task = self.capture(child.stderr.take(), StreamSource::Stderr, chunk_hook);

        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(timeout) => {
                terminate(&mut child).await;
                return Err(WorkflowError::Timeout {
                    what: format!("command {}", spec.program),
                    seconds: timeout.as_secs(),
                });
            }
        };

        let (stdout, stdout_overflow) = stdout_task
            .await
            .map_err(|e| WorkflowError::Internal(format!("stdout capture task failed: {e}")))?;
        let (stderr, stderr_overflow) = stderr_task
            .await
            .map_err(|e| WorkflowError::Internal(format!("stderr capture task failed: {e}")))?;

        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
            wall_time: start.elapsed(),
            stdout_overflow,
            stderr_overflow,
        })
    }

    /// Drain one stream into a bounded buffer, spilling the full stream to
    /// disk once the cap is exceeded. Returns the (possibly truncated)
    /// lossy-decoded text and the spill path if one was created.
    fn capture<R>(
        &self,
        reader: Option<R>,
        source: StreamSource,
        hook: Option<ChunkHook>,
    ) -> tokio::task::JoinHandle<(String, Option<PathBuf>)>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let spill_dir = self.spill_dir.clone();
        tokio::spawn(async move {
            let Some(mut reader) = reader else {
                return (String::new(), None);
            };
            let mut buffer: Vec<u8> = Vec::new();
            let mut spill: Option<(PathBuf, tokio::fs::File)> = None;
            let mut chunk = [0u8; 8192];

            loop {
                let n = match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let bytes = &chunk[..n];
                if let Some(hook) = &hook {
                    hook(source, &String::from_utf8_lossy(bytes));
                }

                if let Some((_, file)) = &mut spill {
                    let _ = file.write_all(bytes).await;
                } else if buffer.len() + n > MAX_CAPTURE_BYTES {
                    if tokio::fs::create_dir_all(&spill_dir).await.is_ok() {
                        let path =
                            spill_dir.join(format!("spill-{}.log", uuid::Uuid::new_v4()));
                        if let Ok(mut file) = tokio::fs::File::create(&path).await {
                            let _ = file.write_all(&buffer).await;
                            let _ = file.write_all(bytes).await;
                            spill = Some((path, file));
                        }
                    }
                    let keep = MAX_CAPTURE_BYTES.saturating_sub(buffer.len());
                    buffer.extend_from_slice(&bytes[..keep.min(n)]);
                } else {
                    buffer.extend_from_slice(bytes);
                }
            }

            let text = String::from_utf8_lossy(&buffer).into_owned();
            (text, spill.map(|(path, _)| path))
        })
    }
}

/// SIGTERM, bounded grace, then SIGKILL.
pub(crate) async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn runner_for(dir: &std::path::Path, allowed: Option<&[&str]>) -> (CommandRunner, PathResolver) {
        let allowed = allowed.map(|cmds| cmds.iter().map(|s| s.to_string()).collect());
        let runner = CommandRunner::new(
            allowed,
            HashSet::new(),
            Duration::from_secs(10),
            dir.join(".foreman/tmp"),
        );
        let resolver =
            PathResolver::new(dir, &["**/*".to_string()], &[]).unwrap();
        (runner, resolver)
    }

    #[test]
    fn validate_blocks_dangerous_commands_by_default() {
        let dir = tempdir().unwrap();
        let (runner, _) = runner_for(dir.path(), None);
        assert!(matches!(
            runner.validate("rm").unwrap_err(),
            WorkflowError::Forbidden(_)
        ));
        assert!(matches!(
            runner.validate("/usr/bin/curl").unwrap_err(),
            WorkflowError::Forbidden(_)
        ));
        assert!(runner.validate("echo").is_ok());
    }

    #[test]
    fn validate_enforces_allowlist() {
        let dir = tempdir().unwrap();
        let (runner, _) = runner_for(dir.path(), Some(&["echo", "true"]));
        assert!(runner.validate("echo").is_ok());
        assert!(matches!(
            runner.validate("cat").unwrap_err(),
            WorkflowError::Forbidden(_)
        ));
    }

    #[test]
    fn blocklist_wins_over_allowlist() {
        let dir = tempdir().unwrap();
        let (runner, _) = runner_for(dir.path(), Some(&["rm", "echo"]));
        assert!(matches!(
            runner.validate("rm").unwrap_err(),
            WorkflowError::Forbidden(_)
        ));
    }

    #[test]
    fn empty_command_is_invalid() {
        let dir = tempdir().unwrap();
        let (runner, _) = runner_for(dir.path(), None);
        assert!(matches!(
            runner.validate("").unwrap_err(),
            WorkflowError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn run_captures_stdout_and_exit_code() {
        let dir = tempdir().unwrap();
        let (runner, resolver) = runner_for(dir.path(), None);

        let out = runner
            .run(&resolver, CommandSpec::new("echo", &["hello"]), None)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.stderr.is_empty());
        assert!(out.stdout_overflow.is_none());
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit() {
        let dir = tempdir().unwrap();
        let (runner, resolver) = runner_for(dir.path(), None);

        let out = runner
            .run(&resolver, CommandSpec::new("false", &[]), None)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 1);
    }

    #[tokio::test]
    async fn run_feeds_stdin() {
        let dir = tempdir().unwrap();
        let (runner, resolver) = runner_for(dir.path(), None);

        let spec = CommandSpec::new("cat", &[]).with_stdin("piped input");
        let out = runner.run(&resolver, spec, None).await.unwrap();
        assert_eq!(out.stdout, "piped input");
    }

    #[tokio::test]
    async fn run_times_out_and_reaps_the_child() {
        let dir = tempdir().unwrap();
        let (runner, resolver) = runner_for(dir.path(), None);

        let spec = CommandSpec::new("sleep", &["30"]).with_timeout(Duration::from_millis(200));
        let err = runner.run(&resolver, spec, None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Timeout { .. }));
    }

    #[tokio::test]
    async fn run_rejects_cwd_outside_root() {
        let dir = tempdir().unwrap();
        let (runner, resolver) = runner_for(dir.path(), None);

        let spec = CommandSpec::new("echo", &["x"]).with_cwd("../..");
        let err = runner.run(&resolver, spec, None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden(_)));
    }

    #[tokio::test]
    async fn forbidden_command_spawns_no_process() {
        let dir = tempdir().unwrap();
        let (runner, resolver) = runner_for(dir.path(), Some(&["echo"]));

        let marker = dir.path().join("should-not-exist");
        let spec = CommandSpec::new("touch", &[marker.to_str().unwrap()]);
        let err = runner.run(&resolver, spec, None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden(_)));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn chunk_hook_sees_incremental_output() {
        let dir = tempdir().unwrap();
        let (runner, resolver) = runner_for(dir.path(), None);

        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = seen.clone();
        let hook: ChunkHook = Arc::new(move |source, chunk| {
            if source == StreamSource::Stdout {
                sink.lock().unwrap().push_str(chunk);
            }
        });

        runner
            .run(
                &resolver,
                CommandSpec::new("echo", &["streamed"]),
                Some(hook),
            )
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().trim(), "streamed");
    }

    #[tokio::test]
    async fn env_is_scrubbed_to_the_allowlist() {
        let dir = tempdir().unwrap();
        let (runner, resolver) = runner_for(dir.path(), None);

        // SAFETY: test-only mutation, no concurrent env readers in this test.
        unsafe { std::env::set_var("FOREMAN_SECRET_TOKEN", "hunter2") };
        let out = runner
            .run(&resolver, CommandSpec::new("env", &[]), None)
            .await
            .unwrap();
        assert!(!out.stdout.contains("FOREMAN_SECRET_TOKEN"));
        unsafe { std::env::remove_var("FOREMAN_SECRET_TOKEN") };
    }

    #[tokio::test]
    async fn explicit_env_reaches_the_child() {
        let dir = tempdir().unwrap();
        let (runner, resolver) = runner_for(dir.path(), None);

        let mut spec = CommandSpec::new("env", &[]);
        spec.env
            .insert("GATE_MARKER".to_string(), "present".to_string());
        let out = runner.run(&resolver, spec, None).await.unwrap();
        assert!(out.stdout.contains("GATE_MARKER=present"));
    }
}
