//! Typed error taxonomy for the foreman control plane.
//!
//! Every subsystem surfaces a `WorkflowError`; the API layer maps each kind
//! to a stable code and HTTP status. `Forbidden` is never caught internally:
//! it propagates to the originating phase run, which records a security event.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("precondition failed: {0}")]
    Preconditions(String),

    #[error("engine failure: {0}")]
    EngineFailure(String),

    #[error("unparseable engine output: {0}")]
    Parse(String),

    #[error("{what} timed out after {seconds}s")]
    Timeout { what: String, seconds: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Stable machine-readable code, carried on API error responses and
    /// event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
            Self::Forbidden(_) => "forbidden",
            Self::Preconditions(_) => "preconditions",
            Self::EngineFailure(_) => "engine_failure",
            Self::Parse(_) => "parse",
            Self::Timeout { .. } => "timeout",
            Self::Storage(_) => "storage",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    pub fn not_found(entity: &str, id: i64) -> Self {
        Self::NotFound(format!("{entity} {id}"))
    }
}

impl From<rusqlite::Error> for WorkflowError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("row".to_string()),
            rusqlite::Error::SqliteFailure(e, msg) => {
                // Unique and foreign-key violations both surface as Conflict;
                // governance treats referential breakage the same way.
                if e.code == rusqlite::ErrorCode::ConstraintViolation {
                    Self::Conflict(msg.clone().unwrap_or_else(|| err.to_string()))
                } else {
                    Self::Storage(err.to_string())
                }
            }
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<std::io::Error> for WorkflowError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON serialization failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(WorkflowError::NotFound("task 4".into()).code(), "not_found");
        assert_eq!(WorkflowError::Forbidden("x".into()).code(), "forbidden");
        assert_eq!(
            WorkflowError::Timeout {
                what: "gate".into(),
                seconds: 60
            }
            .code(),
            "timeout"
        );
    }

    #[test]
    fn not_found_helper_formats_entity_and_id() {
        let err = WorkflowError::not_found("task", 42);
        assert_eq!(err.to_string(), "task 42 not found");
    }

    #[test]
    fn query_no_rows_maps_to_not_found() {
        let err: WorkflowError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[test]
    fn io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: WorkflowError = io.into();
        assert!(matches!(err, WorkflowError::Storage(_)));
    }

    #[test]
    fn timeout_message_names_subject_and_duration() {
        let err = WorkflowError::Timeout {
            what: "gate tests".into(),
            seconds: 60,
        };
        assert_eq!(err.to_string(), "gate tests timed out after 60s");
    }
}
