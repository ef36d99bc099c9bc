//! AI engine adapters: an opaque capability for starting a session,
//! streaming its output, and stopping it.
//!
//! Engines are replaceable, untrusted executors. The orchestrator owns all
//! parsing of their output; adapters only move text. A stream is restartable
//! only by starting a new session, never by rewinding.

pub mod null;
pub mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::errors::{Result, WorkflowError};

/// How long `stop` waits for the stream to complete before force-kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
}

#[async_trait]
pub trait Engine: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Start a session. The returned stream yields opaque text chunks until
    /// the engine finishes or the session is stopped.
    async fn start(&self, request: SessionRequest) -> Result<EngineSession>;
}

/// A live engine session: a chunk stream plus a cancellation handle.
#[derive(Debug)]
pub struct EngineSession {
    engine: String,
    chunks: mpsc::Receiver<String>,
    outcome: Option<oneshot::Receiver<Result<()>>>,
    pid: Option<u32>,
}

impl EngineSession {
    pub(crate) fn new(
        engine: &str,
        chunks: mpsc::Receiver<String>,
        outcome: oneshot::Receiver<Result<()>>,
        pid: Option<u32>,
    ) -> Self {
        Self {
            engine: engine.to_string(),
            chunks,
            outcome: Some(outcome),
            pid,
        }
    }

    /// A session that replays fixed chunks and succeeds. Lets callers and
    /// tests exercise the full pipeline without an external binary.
    pub fn scripted(engine: &str, chunks: Vec<String>) -> Self {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            let _ = tx.try_send(chunk);
        }
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let _ = outcome_tx.send(Ok(()));
        Self {
            engine: engine.to_string(),
            chunks: rx,
            outcome: Some(outcome_rx),
            pid: None,
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Next chunk, or `None` once the stream has completed.
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.chunks.recv().await
    }

    /// Drain the stream to completion and return the full transcript text.
    /// Engine failures and timeouts surface after the partial text has been
    /// consumed, so callers persist what arrived either way.
    pub async fn collect(mut self) -> (String, Result<()>) {
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk().await {
            text.push_str(&chunk);
        }
        let outcome = match self.outcome.take() {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(WorkflowError::Cancelled("engine session".into()))),
            None => Ok(()),
        };
        (text, outcome)
    }

    /// Graceful cancellation: ask the engine to stop, give the stream a
    /// bounded grace period to complete, then force-kill.
    pub async fn stop(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        let completed = match self.outcome.as_mut() {
            Some(rx) => tokio::time::timeout(STOP_GRACE, rx).await.is_ok(),
            None => true,
        };
        if completed {
            self.outcome = None;
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        self.outcome = None;
    }
}

// ── Registry ──────────────────────────────────────────────────────────

/// Named engine adapters. Always carries the "null" stub so a project with
/// no configured engine fails cleanly instead of panicking.
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn Engine>>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        let mut registry = Self {
            engines: HashMap::new(),
        };
        registry.register(Arc::new(null::NullEngine));
        registry
    }
}

impl EngineRegistry {
    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        self.engines.insert(engine.name().to_string(), engine);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Engine>> {
        self.engines.get(name).cloned().ok_or_else(|| {
            WorkflowError::Validation(format!(
                "engine {name:?} is not registered (available: {})",
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_session_streams_and_succeeds() {
        let session = EngineSession::scripted(
            "test",
            vec!["first ".to_string(), "second".to_string()],
        );
        let (text, outcome) = session.collect().await;
        assert_eq!(text, "first second");
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn scripted_session_chunks_arrive_in_order() {
        let mut session =
            EngineSession::scripted("test", vec!["a".to_string(), "b".to_string()]);
        assert_eq!(session.next_chunk().await.as_deref(), Some("a"));
        assert_eq!(session.next_chunk().await.as_deref(), Some("b"));
        assert!(session.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn stop_on_finished_session_is_a_no_op() {
        let mut session = EngineSession::scripted("test", vec!["x".to_string()]);
        session.stop().await;
        assert_eq!(session.engine(), "test");
    }

    #[test]
    fn registry_always_has_the_null_engine() {
        let registry = EngineRegistry::default();
        assert!(registry.get("null").is_ok());
        assert_eq!(registry.names(), vec!["null"]);
    }

    #[test]
    fn unknown_engine_is_a_validation_error() {
        let registry = EngineRegistry::default();
        let err = registry.get("gpt-13").unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert!(err.to_string().contains("null"));
    }
}
