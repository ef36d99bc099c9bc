//! The no-engine stub: registered by default so a project without a
//! configured adapter fails cleanly at session start.

use async_trait::async_trait;

use super::{Engine, EngineSession, SessionRequest};
use crate::errors::{Result, WorkflowError};

#[derive(Debug)]
pub struct NullEngine;

#[async_trait]
impl Engine for NullEngine {
    fn name(&self) -> &str {
        "null"
    }

    async fn start(&self, _request: SessionRequest) -> Result<EngineSession> {
        Err(WorkflowError::EngineFailure(
            "no AI engine is configured for this project; set default_engine in foreman.toml"
                .to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn start_fails_cleanly() {
        let engine = NullEngine;
        let err = engine
            .start(SessionRequest {
                prompt: "hello".to_string(),
                workdir: std::env::temp_dir(),
                timeout: Duration::from_secs(1),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::EngineFailure(_)));
    }
}
