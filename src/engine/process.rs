//! Engine adapter wrapping an external AI CLI.
//!
//! The prompt is fed over stdin; stdout streams back as opaque chunks.
//! The child runs with a scrubbed environment and the project root as its
//! working directory. A session deadline kills the child the same way the
//! sandbox does: SIGTERM, grace, SIGKILL.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use super::{Engine, EngineSession, SessionRequest};
use crate::errors::{Result, WorkflowError};
use crate::sandbox::run::{ENV_ALLOWLIST, terminate};

const STDERR_TAIL_BYTES: usize = 16 * 1024;

#[derive(Debug)]
pub struct ProcessEngine {
    name: String,
    program: String,
    args: Vec<String>,
}

impl ProcessEngine {
    pub fn new(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, request: SessionRequest) -> Result<EngineSession> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&request.workdir)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            WorkflowError::EngineFailure(format!("failed to spawn {}: {e}", self.program))
        })?;
        let pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(prompt.as_bytes()).await;
            });
        }

        let (chunk_tx, chunk_rx) = mpsc::channel::<String>(64);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let program = self.program.clone();
        let timeout = request.timeout;

        tokio::spawn(async move {
            let stderr_task = tokio::spawn(async move {
                let mut tail = Vec::new();
                if let Some(mut stderr) = stderr {
                    let mut buf = [0u8; 4096];
                    while let Ok(n) = stderr.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        tail.extend_from_slice(&buf[..n]);
                        if tail.len() > STDERR_TAIL_BYTES {
                            let excess = tail.len() - STDERR_TAIL_BYTES;
                            tail.drain(..excess);
                        }
                    }
                }
                String::from_utf8_lossy(&tail).into_owned()
            });

            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            let result = 'pump: {
                let Some(mut stdout) = stdout else {
                    break 'pump Err(WorkflowError::EngineFailure(
                        "engine stdout was not captured".to_string(),
                    ));
                };
                let mut buf = [0u8; 8192];
                loop {
                    tokio::select! {
                        read = stdout.read(&mut buf) => match read {
                            Ok(0) => break 'pump wait_for_exit(&mut child, &program, stderr_task).await,
                            Ok(n) => {
                                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                                // A dropped receiver just means nobody is
                                // listening; keep draining so the child can
                                // finish.
                                let _ = chunk_tx.send(chunk).await;
                            }
                            Err(e) => {
                                break 'pump Err(WorkflowError::EngineFailure(format!(
                                    "reading {program} output: {e}"
                                )));
                            }
                        },
                        _ = &mut deadline => {
                            terminate(&mut child).await;
                            break 'pump Err(WorkflowError::Timeout {
                                what: format!("engine {program}"),
                                seconds: timeout.as_secs(),
                            });
                        }
                    }
                }
            };

            let _ = outcome_tx.send(result);
        });

        Ok(EngineSession::new(&self.name, chunk_rx, outcome_rx, pid))
    }
}

async fn wait_for_exit(
    child: &mut tokio::process::Child,
    program: &str,
    stderr_task: tokio::task::JoinHandle<String>,
) -> Result<()> {
    let status = child
        .wait()
        .await
        .map_err(|e| WorkflowError::EngineFailure(format!("waiting for {program}: {e}")))?;
    // The stderr reader hits EOF when the child dies; give it a moment to
    // hand over the tail.
    let tail = tokio::time::timeout(std::time::Duration::from_secs(1), stderr_task)
        .await
        .ok()
        .and_then(|joined| joined.ok())
        .unwrap_or_default();
    if status.success() {
        return Ok(());
    }
    let code = status.code().unwrap_or(-1);
    if tail.trim().is_empty() {
        Err(WorkflowError::EngineFailure(format!(
            "{program} exited with code {code}"
        )))
    } else {
        Err(WorkflowError::EngineFailure(format!(
            "{program} exited with code {code}: {}",
            tail.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(prompt: &str) -> SessionRequest {
        SessionRequest {
            prompt: prompt.to_string(),
            workdir: std::env::temp_dir(),
            timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn cat_engine_echoes_the_prompt() {
        let engine = ProcessEngine::new("cat", "cat", &[]);
        let session = engine.start(request("prompt text")).await.unwrap();
        let (text, outcome) = session.collect().await;
        assert_eq!(text, "prompt text");
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn missing_binary_is_engine_failure() {
        let engine = ProcessEngine::new("ghost", "definitely-not-a-real-binary", &[]);
        let err = engine.start(request("x")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::EngineFailure(_)));
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_as_engine_failure() {
        let engine = ProcessEngine::new("false", "false", &[]);
        let session = engine.start(request("")).await.unwrap();
        let (_, outcome) = session.collect().await;
        assert!(matches!(
            outcome.unwrap_err(),
            WorkflowError::EngineFailure(_)
        ));
    }

    #[tokio::test]
    async fn session_deadline_times_out() {
        let engine = ProcessEngine::new("sleeper", "sleep", &["30"]);
        let session = engine
            .start(SessionRequest {
                prompt: String::new(),
                workdir: std::env::temp_dir(),
                timeout: Duration::from_millis(200),
            })
            .await
            .unwrap();
        let (_, outcome) = session.collect().await;
        assert!(matches!(
            outcome.unwrap_err(),
            WorkflowError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_engine() {
        let engine = ProcessEngine::new("sleeper", "sleep", &["30"]);
        let mut session = engine.start(request("")).await.unwrap();
        let started = std::time::Instant::now();
        session.stop().await;
        // SIGTERM lands well inside the grace window for `sleep`.
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
