//! Entity types persisted per project: tasks, versions, change requests,
//! approvals, artifacts, runs, and control state.
//!
//! Status enums carry `as_str`/`FromStr` pairs so the DAO stores stable
//! snake_case strings and parses them back into typed values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::gates::{GateReport, GateSpec};

// ── Workflow phases ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    Planner,
    Architect,
    ReviewApproval,
    Coder,
}

impl PhaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Architect => "architect",
            Self::ReviewApproval => "review_approval",
            Self::Coder => "coder",
        }
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planner" => Ok(Self::Planner),
            "architect" => Ok(Self::Architect),
            "review_approval" => Ok(Self::ReviewApproval),
            "coder" => Ok(Self::Coder),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

// ── Task lifecycle ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    AwaitingApproval,
    Approved,
    Rejected,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses absorb all further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Cancelled)
    }

    /// Once a task reaches approval, direct edits are rejected; mutations
    /// must flow through an approved change request.
    pub fn is_post_approval(&self) -> bool {
        matches!(self, Self::Approved | Self::InProgress | Self::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

// ── Change request lifecycle ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeRequestStatus {
    Draft,
    Submitted,
    Approved,
    Rejected,
    Implemented,
}

impl ChangeRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Implemented => "implemented",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Implemented)
    }
}

impl fmt::Display for ChangeRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "submitted" => Ok(Self::Submitted),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "implemented" => Ok(Self::Implemented),
            _ => Err(format!("Invalid change request status: {}", s)),
        }
    }
}

// ── Run lifecycle ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

// ── Artifact kinds ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Spec,
    Plan,
    Architecture,
    Adr,
    Transcript,
    Diff,
    Log,
    Other,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::Plan => "plan",
            Self::Architecture => "architecture",
            Self::Adr => "adr",
            Self::Transcript => "transcript",
            Self::Diff => "diff",
            Self::Log => "log",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spec" => Ok(Self::Spec),
            "plan" => Ok(Self::Plan),
            "architecture" => Ok(Self::Architecture),
            "adr" => Ok(Self::Adr),
            "transcript" => Ok(Self::Transcript),
            "diff" => Ok(Self::Diff),
            "log" => Ok(Self::Log),
            "other" => Ok(Self::Other),
            _ => Err(format!("Invalid artifact kind: {}", s)),
        }
    }
}

// ── Approval decisions ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            _ => Err(format!("Invalid decision: {}", s)),
        }
    }
}

// ── Entities ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub root_path: String,
    pub current_phase: Option<PhaseType>,
    pub default_engine: String,
    /// Architecture option id selected after approval, if any.
    pub selected_option: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub description: String,
    pub priority: i64,
    pub status: TaskStatus,
    pub current_phase: Option<PhaseType>,
    pub attempts: i64,
    pub active_version_id: Option<i64>,
    /// Free-form metadata: `superseded_by`, `merged_from`, `reason`,
    /// `commit_type`, and similar markers.
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Immutable snapshot of a task's mutable fields. Versions form a strictly
/// increasing, gapless sequence per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskVersion {
    pub id: i64,
    pub task_id: i64,
    pub version_num: i64,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub depends_on: Vec<i64>,
    pub gates: Vec<GateSpec>,
    pub phase: Option<PhaseType>,
    pub created_at: String,
}

/// Proposed delta carried by an edit change request. `None` fields keep the
/// active version's value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDelta {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i64>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub depends_on: Option<Vec<i64>>,
    pub gates: Option<Vec<GateSpec>>,
    pub engine: Option<String>,
}

/// Full specification of a new task, used by planner output, split children,
/// and merge results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<i64>,
    #[serde(default)]
    pub gates: Vec<GateSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeRequestPayload {
    Edit { delta: TaskDelta },
    Split { children: Vec<TaskSpec> },
    Merge { source_ids: Vec<i64>, merged: TaskSpec },
}

impl ChangeRequestPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Edit { .. } => "edit",
            Self::Split { .. } => "split",
            Self::Merge { .. } => "merge",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: i64,
    pub task_id: i64,
    pub status: ChangeRequestStatus,
    pub payload: ChangeRequestPayload,
    pub diff_artifact_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Immutable record of a human decision. Exactly one of
/// `change_request_id` / `task_version_id` is set, except for project-level
/// decisions (architecture option selection) which carry neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: i64,
    pub change_request_id: Option<i64>,
    pub task_version_id: Option<i64>,
    pub approver: String,
    pub decision: Decision,
    pub notes: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub project_id: i64,
    pub task_id: Option<i64>,
    pub run_id: Option<i64>,
    pub kind: ArtifactKind,
    /// Path relative to the project root.
    pub path: String,
    pub hash: String,
    pub size: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub project_id: i64,
    pub task_id: Option<i64>,
    pub engine: String,
    pub phase: PhaseType,
    pub status: RunStatus,
    pub gate_results: Option<GateReport>,
    pub error: Option<String>,
    pub correlation_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// One row per project; mediates the coder loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlState {
    pub project_id: i64,
    pub paused: bool,
    pub max_attempts: i64,
    pub timeout_seconds: i64,
    pub current_task_id: Option<i64>,
}

/// Append-only audit row mirroring a published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub project_id: Option<i64>,
    pub seq: i64,
    pub kind: String,
    pub correlation_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips_through_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::AwaitingApproval,
            TaskStatus::Approved,
            TaskStatus::Rejected,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
        ] {
            let parsed: TaskStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_and_post_approval_classification() {
        assert!(TaskStatus::Rejected.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Completed.is_terminal());

        assert!(TaskStatus::Approved.is_post_approval());
        assert!(TaskStatus::InProgress.is_post_approval());
        assert!(TaskStatus::Completed.is_post_approval());
        assert!(!TaskStatus::Pending.is_post_approval());
        assert!(!TaskStatus::AwaitingApproval.is_post_approval());
    }

    #[test]
    fn change_request_terminal_states() {
        assert!(ChangeRequestStatus::Rejected.is_terminal());
        assert!(ChangeRequestStatus::Implemented.is_terminal());
        assert!(!ChangeRequestStatus::Approved.is_terminal());
    }

    #[test]
    fn run_status_terminal_states() {
        assert!(!RunStatus::Running.is_terminal());
        for status in [
            RunStatus::Success,
            RunStatus::Failure,
            RunStatus::Timeout,
            RunStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn phase_type_parses_review_approval() {
        let phase: PhaseType = "review_approval".parse().unwrap();
        assert_eq!(phase, PhaseType::ReviewApproval);
        assert_eq!(phase.to_string(), "review_approval");
    }

    #[test]
    fn artifact_kind_round_trips() {
        for kind in [
            ArtifactKind::Spec,
            ArtifactKind::Plan,
            ArtifactKind::Architecture,
            ArtifactKind::Adr,
            ArtifactKind::Transcript,
            ArtifactKind::Diff,
            ArtifactKind::Log,
            ArtifactKind::Other,
        ] {
            let parsed: ArtifactKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn change_request_payload_serializes_with_kind_tag() {
        let payload = ChangeRequestPayload::Split {
            children: vec![
                TaskSpec {
                    title: "first half".to_string(),
                    ..Default::default()
                },
                TaskSpec {
                    title: "second half".to_string(),
                    ..Default::default()
                },
            ],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "split");
        assert_eq!(payload.kind(), "split");

        let back: ChangeRequestPayload = serde_json::from_value(json).unwrap();
        match back {
            ChangeRequestPayload::Split { children } => assert_eq!(children.len(), 2),
            _ => panic!("Expected Split payload"),
        }
    }

    #[test]
    fn task_metadata_accessor() {
        let task = Task {
            id: 1,
            project_id: 1,
            title: "t".to_string(),
            description: String::new(),
            priority: 0,
            status: TaskStatus::Rejected,
            current_phase: None,
            attempts: 3,
            active_version_id: Some(1),
            metadata: serde_json::json!({"reason": "exhausted"}),
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(task.metadata_str("reason"), Some("exhausted"));
        assert_eq!(task.metadata_str("missing"), None);
    }
}
