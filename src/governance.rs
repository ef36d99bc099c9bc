//! Governance: the task / version / change-request / approval state machine.
//!
//! Human approval is the only authority here. A task that has reached
//! `APPROVED` is immutable except through an approved change request, and
//! `apply` is the single path that mutates a target after approval. Writes
//! on one task are linearized by a per-task async lock held in an evictable
//! map; there is no process-wide lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::errors::{Result, WorkflowError};
use crate::events::{EventBus, EventKind};
use crate::store::StoreHandle;
use crate::store::models::*;

// ── Per-task locks ────────────────────────────────────────────────────

/// Mutexes keyed by task id. Entries evict once nobody holds or waits on
/// them, so the map does not grow with the task table.
#[derive(Default)]
pub struct TaskLocks {
    map: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl TaskLocks {
    pub async fn acquire(&self, task_id: i64) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.map.lock().unwrap();
            map.entry(task_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn evict_unheld(&self) {
        self.map
            .lock()
            .unwrap()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

// ── Transition tables ─────────────────────────────────────────────────

fn task_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, AwaitingApproval)
            | (AwaitingApproval, Approved)
            | (AwaitingApproval, Rejected)
            | (Approved, InProgress)
            | (InProgress, Completed)
            | (InProgress, Approved)
            | (Approved, Rejected)
            | (Pending, Cancelled)
            | (AwaitingApproval, Cancelled)
            | (Approved, Cancelled)
            | (InProgress, Cancelled)
    )
}

fn cr_transition_allowed(from: ChangeRequestStatus, to: ChangeRequestStatus) -> bool {
    use ChangeRequestStatus::*;
    matches!(
        (from, to),
        (Draft, Submitted) | (Submitted, Approved) | (Submitted, Rejected) | (Approved, Implemented)
    )
}

// ── Apply outcome ─────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApplyOutcome {
    Updated(Task),
    Split(Vec<Task>),
    Merged(Task),
}

// ── Governance service ────────────────────────────────────────────────

pub struct Governance {
    project_id: i64,
    store: StoreHandle,
    bus: EventBus,
    locks: TaskLocks,
}

impl Governance {
    pub fn new(project_id: i64, store: StoreHandle, bus: EventBus) -> Self {
        Self {
            project_id,
            store,
            bus,
            locks: TaskLocks::default(),
        }
    }

    // ── Task creation ─────────────────────────────────────────────────

    pub async fn create_task(&self, spec: TaskSpec, phase: Option<PhaseType>) -> Result<Task> {
        Ok(self.create_tasks(vec![spec], phase).await?.remove(0))
    }

    /// Create a batch of tasks atomically; `depends_on` names existing
    /// task ids.
    pub async fn create_tasks(
        &self,
        specs: Vec<TaskSpec>,
        phase: Option<PhaseType>,
    ) -> Result<Vec<Task>> {
        self.create_task_batch(specs, phase, false).await
    }

    /// Planner output references sibling tasks by 0-based index, before ids
    /// exist; this variant rewrites those indices to the assigned ids.
    pub async fn create_tasks_from_plan(
        &self,
        specs: Vec<TaskSpec>,
        phase: Option<PhaseType>,
    ) -> Result<Vec<Task>> {
        self.create_task_batch(specs, phase, true).await
    }

    async fn create_task_batch(
        &self,
        specs: Vec<TaskSpec>,
        phase: Option<PhaseType>,
        deps_are_indices: bool,
    ) -> Result<Vec<Task>> {
        let project_id = self.project_id;
        let created = self
            .store
            .call(move |store| {
                store.create_task_batch(project_id, &specs, phase, deps_are_indices)
            })
            .await?;

        let mut tasks = Vec::with_capacity(created.len());
        for (task, version) in created {
            self.bus.publish_task(
                EventKind::TaskCreated,
                self.project_id,
                task.id,
                serde_json::json!({"task_id": task.id, "title": task.title, "status": task.status}),
            );
            self.publish_version(&version);
            tasks.push(task);
        }
        Ok(tasks)
    }

    // ── Task mutation ─────────────────────────────────────────────────

    /// Apply a delta as a new task version. Direct edits are only legal
    /// before approval; afterwards the delta must ride an approved change
    /// request (`via_change_request`), which `apply` supplies.
    pub async fn update_task(
        &self,
        task_id: i64,
        delta: TaskDelta,
        via_change_request: Option<i64>,
    ) -> Result<Task> {
        let _guard = self.locks.acquire(task_id).await;
        let result = self.update_task_locked(task_id, delta, via_change_request).await;
        drop(_guard);
        self.locks.evict_unheld();
        result
    }

    async fn update_task_locked(
        &self,
        task_id: i64,
        delta: TaskDelta,
        via_change_request: Option<i64>,
    ) -> Result<Task> {
        let store = &self.store;
        let task = store.call(move |s| s.get_task(task_id)).await?;

        if task.status.is_terminal() {
            return Err(WorkflowError::Preconditions(format!(
                "task {task_id} is {} and cannot change",
                task.status
            )));
        }
        if task.status.is_post_approval() {
            let cr_id = via_change_request.ok_or_else(|| {
                WorkflowError::Preconditions(format!(
                    "task {task_id} is {}; edits require an approved change request",
                    task.status
                ))
            })?;
            let cr = store.call(move |s| s.get_change_request(cr_id)).await?;
            if cr.task_id != task_id {
                return Err(WorkflowError::Validation(format!(
                    "change request {cr_id} targets task {}, not {task_id}",
                    cr.task_id
                )));
            }
            if cr.status != ChangeRequestStatus::Approved {
                return Err(WorkflowError::Preconditions(format!(
                    "change request {cr_id} is {}, not approved",
                    cr.status
                )));
            }
        }

        let active = store.call(move |s| s.active_version(task_id)).await?;
        let next = TaskSpec {
            title: delta.title.unwrap_or(active.title),
            description: delta.description.unwrap_or(active.description),
            priority: delta.priority.unwrap_or(task.priority),
            acceptance_criteria: delta
                .acceptance_criteria
                .unwrap_or(active.acceptance_criteria),
            depends_on: delta.depends_on.unwrap_or(active.depends_on),
            gates: delta.gates.unwrap_or(active.gates),
        };
        let phase = task.current_phase;
        let (task, version) = store
            .call(move |s| s.create_task_version(task_id, &next, phase))
            .await?;

        if let Some(engine) = delta.engine {
            let project_id = self.project_id;
            store
                .call(move |s| s.update_project(project_id, None, Some(&engine), None))
                .await?;
        }

        self.publish_version(&version);
        self.bus.publish_task(
            EventKind::TaskUpdated,
            self.project_id,
            task.id,
            serde_json::json!({"task_id": task.id, "version": version.version_num}),
        );
        Ok(task)
    }

    /// Validated status transition with a `task_status_changed` event.
    pub async fn set_status(&self, task_id: i64, to: TaskStatus) -> Result<Task> {
        let _guard = self.locks.acquire(task_id).await;
        let result = self.set_status_locked(task_id, to).await;
        drop(_guard);
        self.locks.evict_unheld();
        result
    }

    async fn set_status_locked(&self, task_id: i64, to: TaskStatus) -> Result<Task> {
        let task = self.store.call(move |s| s.get_task(task_id)).await?;
        if task.status == to {
            return Ok(task);
        }
        if !task_transition_allowed(task.status, to) {
            return Err(WorkflowError::Preconditions(format!(
                "task {task_id} cannot move {} -> {}",
                task.status, to
            )));
        }
        let from = task.status;
        let task = self
            .store
            .call(move |s| s.set_task_status(task_id, to))
            .await?;
        self.bus.publish_task(
            EventKind::TaskStatusChanged,
            self.project_id,
            task.id,
            serde_json::json!({"task_id": task.id, "from": from, "to": to}),
        );
        Ok(task)
    }

    pub async fn submit_for_approval(&self, task_id: i64) -> Result<Task> {
        self.set_status(task_id, TaskStatus::AwaitingApproval).await
    }

    /// Human decision on the task's active version.
    pub async fn approve_task(
        &self,
        task_id: i64,
        approver: &str,
        notes: Option<&str>,
    ) -> Result<Task> {
        self.decide_task(task_id, approver, notes, Decision::Approve)
            .await
    }

    pub async fn reject_task(
        &self,
        task_id: i64,
        approver: &str,
        notes: Option<&str>,
    ) -> Result<Task> {
        self.decide_task(task_id, approver, notes, Decision::Reject)
            .await
    }

    async fn decide_task(
        &self,
        task_id: i64,
        approver: &str,
        notes: Option<&str>,
        decision: Decision,
    ) -> Result<Task> {
        let to = match decision {
            Decision::Approve => TaskStatus::Approved,
            Decision::Reject => TaskStatus::Rejected,
        };
        let task = self.set_status(task_id, to).await?;

        let version_id = task.active_version_id;
        let approver_owned = approver.to_string();
        let notes_owned = notes.map(|s| s.to_string());
        let approval = self
            .store
            .call(move |s| {
                s.insert_approval(
                    None,
                    version_id,
                    &approver_owned,
                    decision,
                    notes_owned.as_deref(),
                )
            })
            .await?;
        self.publish_approval(&approval, Some(task_id));
        Ok(task)
    }

    // ── Change requests ───────────────────────────────────────────────

    pub async fn create_change_request(
        &self,
        task_id: i64,
        payload: ChangeRequestPayload,
    ) -> Result<ChangeRequest> {
        match &payload {
            ChangeRequestPayload::Split { children } => {
                if children.len() < 2 {
                    return Err(WorkflowError::Validation(
                        "a split needs at least two children".into(),
                    ));
                }
            }
            ChangeRequestPayload::Merge { source_ids, .. } => {
                if source_ids.len() < 2 {
                    return Err(WorkflowError::Validation(
                        "a merge needs at least two source tasks".into(),
                    ));
                }
                if !source_ids.contains(&task_id) {
                    return Err(WorkflowError::Validation(
                        "the targeted task must be among the merge sources".into(),
                    ));
                }
            }
            ChangeRequestPayload::Edit { .. } => {}
        }

        // Target must exist.
        self.store.call(move |s| s.get_task(task_id)).await?;
        let cr = self
            .store
            .call(move |s| s.insert_change_request(task_id, &payload))
            .await?;
        self.bus.publish_task(
            EventKind::ChangeRequestCreated,
            self.project_id,
            task_id,
            serde_json::json!({"change_request_id": cr.id, "kind": cr.payload.kind()}),
        );
        Ok(cr)
    }

    pub async fn submit_change_request(&self, cr_id: i64) -> Result<ChangeRequest> {
        self.transition_cr(cr_id, ChangeRequestStatus::Submitted, EventKind::ChangeRequestSubmitted)
            .await
    }

    pub async fn approve_change_request(
        &self,
        cr_id: i64,
        approver: &str,
        notes: Option<&str>,
    ) -> Result<ChangeRequest> {
        let cr = self
            .transition_cr(cr_id, ChangeRequestStatus::Approved, EventKind::ChangeRequestApproved)
            .await?;
        let approver_owned = approver.to_string();
        let notes_owned = notes.map(|s| s.to_string());
        let approval = self
            .store
            .call(move |s| {
                s.insert_approval(
                    Some(cr_id),
                    None,
                    &approver_owned,
                    Decision::Approve,
                    notes_owned.as_deref(),
                )
            })
            .await?;
        self.publish_approval(&approval, Some(cr.task_id));
        Ok(cr)
    }

    pub async fn reject_change_request(
        &self,
        cr_id: i64,
        approver: &str,
        notes: Option<&str>,
    ) -> Result<ChangeRequest> {
        let cr = self
            .transition_cr(cr_id, ChangeRequestStatus::Rejected, EventKind::ChangeRequestRejected)
            .await?;
        let approver_owned = approver.to_string();
        let notes_owned = notes.map(|s| s.to_string());
        let approval = self
            .store
            .call(move |s| {
                s.insert_approval(
                    Some(cr_id),
                    None,
                    &approver_owned,
                    Decision::Reject,
                    notes_owned.as_deref(),
                )
            })
            .await?;
        self.publish_approval(&approval, Some(cr.task_id));
        Ok(cr)
    }

    async fn transition_cr(
        &self,
        cr_id: i64,
        to: ChangeRequestStatus,
        event: EventKind,
    ) -> Result<ChangeRequest> {
        let cr = self.store.call(move |s| s.get_change_request(cr_id)).await?;
        if !cr_transition_allowed(cr.status, to) {
            return Err(if cr.status.is_terminal() {
                WorkflowError::Conflict(format!("change request {cr_id} is {}", cr.status))
            } else {
                WorkflowError::Preconditions(format!(
                    "change request {cr_id} cannot move {} -> {to}",
                    cr.status
                ))
            });
        }
        let cr = self
            .store
            .call(move |s| s.set_change_request_status(cr_id, to))
            .await?;
        self.bus.publish_task(
            event,
            self.project_id,
            cr.task_id,
            serde_json::json!({"change_request_id": cr.id, "status": to}),
        );
        Ok(cr)
    }

    // ── Apply ─────────────────────────────────────────────────────────

    /// The only path that mutates a target after approval. Idempotent at
    /// the API level: re-applying an implemented change request returns
    /// `Conflict`.
    pub async fn apply_change_request(&self, cr_id: i64) -> Result<ApplyOutcome> {
        let cr = self.store.call(move |s| s.get_change_request(cr_id)).await?;
        match cr.status {
            ChangeRequestStatus::Approved => {}
            ChangeRequestStatus::Implemented => {
                return Err(WorkflowError::Conflict(format!(
                    "change request {cr_id} is already implemented"
                )));
            }
            other => {
                return Err(WorkflowError::Preconditions(format!(
                    "change request {cr_id} is {other}, not approved"
                )));
            }
        }

        let outcome = match cr.payload.clone() {
            ChangeRequestPayload::Edit { delta } => {
                let task = self.update_task(cr.task_id, delta, Some(cr_id)).await?;
                ApplyOutcome::Updated(task)
            }
            ChangeRequestPayload::Split { children } => {
                ApplyOutcome::Split(self.perform_split(&cr, children).await?)
            }
            ChangeRequestPayload::Merge { source_ids, merged } => {
                ApplyOutcome::Merged(self.perform_merge(&cr, source_ids, merged).await?)
            }
        };

        let cr = self
            .store
            .call(move |s| {
                s.set_change_request_status(cr_id, ChangeRequestStatus::Implemented)
            })
            .await?;
        self.bus.publish_task(
            EventKind::ChangeRequestApplied,
            self.project_id,
            cr.task_id,
            serde_json::json!({"change_request_id": cr.id}),
        );
        Ok(outcome)
    }

    /// Split via the latest approved split change request; without one the
    /// call fails with `Preconditions`.
    pub async fn split(&self, task_id: i64) -> Result<Vec<Task>> {
        let cr = self
            .store
            .call(move |s| s.find_approved_change_request(task_id, Some("split")))
            .await?
            .ok_or_else(|| {
                WorkflowError::Preconditions(format!(
                    "splitting task {task_id} requires an approved split change request"
                ))
            })?;
        match self.apply_change_request(cr.id).await? {
            ApplyOutcome::Split(tasks) => Ok(tasks),
            _ => Err(WorkflowError::Internal("split applied a non-split payload".into())),
        }
    }

    /// Merge via the latest approved merge change request on the task.
    pub async fn merge(&self, task_id: i64) -> Result<Task> {
        let cr = self
            .store
            .call(move |s| s.find_approved_change_request(task_id, Some("merge")))
            .await?
            .ok_or_else(|| {
                WorkflowError::Preconditions(format!(
                    "merging task {task_id} requires an approved merge change request"
                ))
            })?;
        match self.apply_change_request(cr.id).await? {
            ApplyOutcome::Merged(task) => Ok(task),
            _ => Err(WorkflowError::Internal("merge applied a non-merge payload".into())),
        }
    }

    async fn perform_split(
        &self,
        cr: &ChangeRequest,
        children: Vec<TaskSpec>,
    ) -> Result<Vec<Task>> {
        let source_id = cr.task_id;
        let _guard = self.locks.acquire(source_id).await;

        let source = self.store.call(move |s| s.get_task(source_id)).await?;
        if source.status.is_terminal() {
            return Err(WorkflowError::Preconditions(format!(
                "task {source_id} is {} and cannot be split",
                source.status
            )));
        }
        let active = self.store.call(move |s| s.active_version(source_id)).await?;

        // Children inherit gates and acceptance criteria unless they bring
        // their own.
        let specs: Vec<TaskSpec> = children
            .into_iter()
            .map(|mut child| {
                if child.gates.is_empty() {
                    child.gates = active.gates.clone();
                }
                if child.acceptance_criteria.is_empty() {
                    child.acceptance_criteria = active.acceptance_criteria.clone();
                }
                if child.priority == 0 {
                    child.priority = source.priority;
                }
                child
            })
            .collect();

        let new_tasks = self.create_tasks(specs, source.current_phase).await?;
        let new_ids: Vec<i64> = new_tasks.iter().map(|t| t.id).collect();

        // cancel_superseded re-acquires the task lock.
        drop(_guard);
        self.cancel_superseded(source_id, &new_ids).await?;
        self.locks.evict_unheld();
        Ok(new_tasks)
    }

    async fn perform_merge(
        &self,
        _cr: &ChangeRequest,
        source_ids: Vec<i64>,
        merged: TaskSpec,
    ) -> Result<Task> {
        for &source_id in &source_ids {
            let source = self.store.call(move |s| s.get_task(source_id)).await?;
            if source.status.is_terminal() {
                return Err(WorkflowError::Preconditions(format!(
                    "task {source_id} is {} and cannot be merged",
                    source.status
                )));
            }
        }

        let merged_task = self.create_task(merged, None).await?;
        let merged_id = merged_task.id;
        self.store
            .call(move |s| {
                s.merge_task_metadata(
                    merged_id,
                    &serde_json::json!({"merged_from": source_ids.clone()}),
                )
            })
            .await?;

        let merged_task = self.store.call(move |s| s.get_task(merged_id)).await?;
        let sources: Vec<i64> = merged_task.metadata["merged_from"]
            .as_array()
            .map(|ids| ids.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default();
        for source_id in sources {
            self.cancel_superseded(source_id, &[merged_id]).await?;
        }
        Ok(merged_task)
    }

    async fn cancel_superseded(&self, task_id: i64, superseded_by: &[i64]) -> Result<()> {
        let _guard = self.locks.acquire(task_id).await;
        let ids = superseded_by.to_vec();
        self.store
            .call(move |s| {
                s.merge_task_metadata(task_id, &serde_json::json!({"superseded_by": ids}))
            })
            .await?;
        self.set_status_locked(task_id, TaskStatus::Cancelled).await?;
        self.bus.publish_task(
            EventKind::TaskUpdated,
            self.project_id,
            task_id,
            serde_json::json!({"task_id": task_id, "superseded_by": superseded_by}),
        );
        Ok(())
    }

    // ── Control state ─────────────────────────────────────────────────

    pub async fn pause(&self) -> Result<ControlState> {
        let project_id = self.project_id;
        let control = self.store.call(move |s| s.set_paused(project_id, true)).await?;
        self.bus.publish(
            EventKind::ExecutionPaused,
            Some(self.project_id),
            serde_json::json!({"project_id": self.project_id}),
        );
        Ok(control)
    }

    pub async fn resume(&self) -> Result<ControlState> {
        let project_id = self.project_id;
        let control = self
            .store
            .call(move |s| s.set_paused(project_id, false))
            .await?;
        self.bus.publish(
            EventKind::ExecutionResumed,
            Some(self.project_id),
            serde_json::json!({"project_id": self.project_id}),
        );
        Ok(control)
    }

    pub async fn set_limits(
        &self,
        max_attempts: Option<i64>,
        timeout_seconds: Option<i64>,
    ) -> Result<ControlState> {
        let project_id = self.project_id;
        self.store
            .call(move |s| s.set_limits(project_id, max_attempts, timeout_seconds))
            .await
    }

    pub async fn control_state(&self) -> Result<ControlState> {
        let project_id = self.project_id;
        self.store.call(move |s| s.control_state(project_id)).await
    }

    /// Record the architecture option chosen by a human reviewer. This is
    /// the only way `selected_option` lands on the project.
    pub async fn select_architecture_option(
        &self,
        option_id: &str,
        approver: &str,
        notes: Option<&str>,
    ) -> Result<Project> {
        let project_id = self.project_id;
        let option = option_id.to_string();
        let project = self
            .store
            .call(move |s| s.update_project(project_id, None, None, Some(&option)))
            .await?;

        let approver_owned = approver.to_string();
        let notes_owned = notes.map(|s| s.to_string());
        let approval = self
            .store
            .call(move |s| {
                s.insert_approval(None, None, &approver_owned, Decision::Approve, notes_owned.as_deref())
            })
            .await?;
        self.publish_approval(&approval, None);
        self.bus.publish(
            EventKind::ProjectUpdated,
            Some(self.project_id),
            serde_json::json!({"project_id": self.project_id, "selected_option": option_id}),
        );
        Ok(project)
    }

    // ── Helpers ───────────────────────────────────────────────────────

    fn publish_version(&self, version: &TaskVersion) {
        self.bus.publish_task(
            EventKind::TaskVersionCreated,
            self.project_id,
            version.task_id,
            serde_json::json!({
                "task_id": version.task_id,
                "version_id": version.id,
                "version": version.version_num,
            }),
        );
    }

    fn publish_approval(&self, approval: &Approval, task_id: Option<i64>) {
        let payload = serde_json::json!({
            "approval_id": approval.id,
            "approver": approval.approver,
            "decision": approval.decision,
            "change_request_id": approval.change_request_id,
            "task_version_id": approval.task_version_id,
        });
        match task_id {
            Some(task_id) => {
                self.bus
                    .publish_task(EventKind::ApprovalRecorded, self.project_id, task_id, payload)
            }
            None => self
                .bus
                .publish(EventKind::ApprovalRecorded, Some(self.project_id), payload),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ProjectStore;

    async fn governance() -> (Governance, StoreHandle, EventBus, i64) {
        let store = ProjectStore::open_in_memory().unwrap();
        let project = store
            .insert_project(None, "demo", "/tmp/demo", "null")
            .unwrap();
        let handle = StoreHandle::new(store);
        let bus = EventBus::default();
        (
            Governance::new(project.id, handle.clone(), bus.clone()),
            handle,
            bus,
            project.id,
        )
    }

    fn spec(title: &str) -> TaskSpec {
        TaskSpec {
            title: title.to_string(),
            ..Default::default()
        }
    }

    async fn approved_task(gov: &Governance) -> Task {
        let task = gov.create_task(spec("work"), None).await.unwrap();
        gov.submit_for_approval(task.id).await.unwrap();
        gov.approve_task(task.id, "alice", None).await.unwrap()
    }

    #[tokio::test]
    async fn create_task_publishes_creation_and_version_events() {
        let (gov, _, bus, _) = governance().await;
        let task = gov.create_task(spec("t"), Some(PhaseType::Planner)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let kinds: Vec<EventKind> = bus
            .history(&crate::events::EventFilter::all(), None)
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&EventKind::TaskCreated));
        assert!(kinds.contains(&EventKind::TaskVersionCreated));
    }

    #[tokio::test]
    async fn pending_task_edits_directly_and_versions_advance() {
        let (gov, store, _, _) = governance().await;
        let task = gov.create_task(spec("original"), None).await.unwrap();

        let delta = TaskDelta {
            title: Some("revised".to_string()),
            ..Default::default()
        };
        let task = gov.update_task(task.id, delta, None).await.unwrap();
        assert_eq!(task.title, "revised");

        let task_id = task.id;
        let versions = store
            .call(move |s| s.list_task_versions(task_id))
            .await
            .unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].title, "revised");
    }

    #[tokio::test]
    async fn approval_flow_records_approval_row() {
        let (gov, store, _, _) = governance().await;
        let task = approved_task(&gov).await;
        assert_eq!(task.status, TaskStatus::Approved);

        let task_id = task.id;
        let approver = store
            .call(move |s| s.latest_approver(task_id))
            .await
            .unwrap();
        assert_eq!(approver.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn approved_task_rejects_direct_edit() {
        let (gov, _, _, _) = governance().await;
        let task = approved_task(&gov).await;

        let err = gov
            .update_task(task.id, TaskDelta::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Preconditions(_)));
    }

    #[tokio::test]
    async fn invalid_transition_is_a_precondition_failure() {
        let (gov, _, _, _) = governance().await;
        let task = gov.create_task(spec("t"), None).await.unwrap();
        // Pending -> Completed skips the whole pipeline.
        let err = gov
            .set_status(task.id, TaskStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Preconditions(_)));
    }

    #[tokio::test]
    async fn edit_change_request_applies_through_approval() {
        let (gov, store, _, _) = governance().await;
        let task = approved_task(&gov).await;

        let cr = gov
            .create_change_request(
                task.id,
                ChangeRequestPayload::Edit {
                    delta: TaskDelta {
                        description: Some("amended".to_string()),
                        ..Default::default()
                    },
                },
            )
            .await
            .unwrap();
        gov.submit_change_request(cr.id).await.unwrap();
        gov.approve_change_request(cr.id, "bob", Some("fine")).await.unwrap();

        let outcome = gov.apply_change_request(cr.id).await.unwrap();
        let updated = match outcome {
            ApplyOutcome::Updated(task) => task,
            other => panic!("expected Updated, got {other:?}"),
        };
        assert_eq!(updated.description, "amended");

        let cr_id = cr.id;
        let cr = store.call(move |s| s.get_change_request(cr_id)).await.unwrap();
        assert_eq!(cr.status, ChangeRequestStatus::Implemented);
    }

    #[tokio::test]
    async fn apply_twice_returns_conflict() {
        let (gov, _, _, _) = governance().await;
        let task = approved_task(&gov).await;
        let cr = gov
            .create_change_request(
                task.id,
                ChangeRequestPayload::Edit {
                    delta: TaskDelta::default(),
                },
            )
            .await
            .unwrap();
        gov.submit_change_request(cr.id).await.unwrap();
        gov.approve_change_request(cr.id, "bob", None).await.unwrap();

        gov.apply_change_request(cr.id).await.unwrap();
        let err = gov.apply_change_request(cr.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
    }

    #[tokio::test]
    async fn split_without_approved_cr_is_preconditions() {
        let (gov, _, _, _) = governance().await;
        let task = approved_task(&gov).await;
        let err = gov.split(task.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Preconditions(_)));
    }

    #[tokio::test]
    async fn split_cancels_source_and_creates_children() {
        let (gov, store, _, _) = governance().await;
        let task = gov
            .create_task(
                TaskSpec {
                    title: "big task".to_string(),
                    acceptance_criteria: vec!["it works".to_string()],
                    gates: vec![crate::gates::GateSpec::exit_code("tests", "cargo", &["test"])],
                    priority: 5,
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        gov.submit_for_approval(task.id).await.unwrap();
        gov.approve_task(task.id, "alice", None).await.unwrap();

        let cr = gov
            .create_change_request(
                task.id,
                ChangeRequestPayload::Split {
                    children: vec![spec("first half"), spec("second half")],
                },
            )
            .await
            .unwrap();
        gov.submit_change_request(cr.id).await.unwrap();
        gov.approve_change_request(cr.id, "alice", None).await.unwrap();

        let children = gov.split(task.id).await.unwrap();
        assert_eq!(children.len(), 2);

        // Children inherit gates, criteria, and priority from the source.
        let child_id = children[0].id;
        let version = store
            .call(move |s| s.active_version(child_id))
            .await
            .unwrap();
        assert_eq!(version.gates.len(), 1);
        assert_eq!(version.acceptance_criteria, vec!["it works"]);
        assert_eq!(children[0].priority, 5);

        let source_id = task.id;
        let source = store.call(move |s| s.get_task(source_id)).await.unwrap();
        assert_eq!(source.status, TaskStatus::Cancelled);
        let superseded: Vec<i64> = source.metadata["superseded_by"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_i64())
            .collect();
        assert_eq!(superseded, children.iter().map(|c| c.id).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn split_needs_at_least_two_children() {
        let (gov, _, _, _) = governance().await;
        let task = gov.create_task(spec("t"), None).await.unwrap();
        let err = gov
            .create_change_request(
                task.id,
                ChangeRequestPayload::Split {
                    children: vec![spec("only one")],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[tokio::test]
    async fn merge_cancels_sources_and_links_metadata() {
        let (gov, store, _, _) = governance().await;
        let a = gov.create_task(spec("a"), None).await.unwrap();
        let b = gov.create_task(spec("b"), None).await.unwrap();

        let cr = gov
            .create_change_request(
                a.id,
                ChangeRequestPayload::Merge {
                    source_ids: vec![a.id, b.id],
                    merged: spec("a+b"),
                },
            )
            .await
            .unwrap();
        gov.submit_change_request(cr.id).await.unwrap();
        gov.approve_change_request(cr.id, "alice", None).await.unwrap();

        let merged = gov.merge(a.id).await.unwrap();
        let merged_from: Vec<i64> = merged.metadata["merged_from"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_i64())
            .collect();
        assert_eq!(merged_from, vec![a.id, b.id]);

        for source_id in [a.id, b.id] {
            let source = store.call(move |s| s.get_task(source_id)).await.unwrap();
            assert_eq!(source.status, TaskStatus::Cancelled);
            assert_eq!(source.metadata["superseded_by"][0], merged.id);
        }
    }

    #[tokio::test]
    async fn cr_terminal_states_absorb() {
        let (gov, _, _, _) = governance().await;
        let task = gov.create_task(spec("t"), None).await.unwrap();
        let cr = gov
            .create_change_request(
                task.id,
                ChangeRequestPayload::Edit {
                    delta: TaskDelta::default(),
                },
            )
            .await
            .unwrap();
        gov.submit_change_request(cr.id).await.unwrap();
        gov.reject_change_request(cr.id, "alice", Some("no")).await.unwrap();

        let err = gov.submit_change_request(cr.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
    }

    #[tokio::test]
    async fn pause_resume_round_trip_with_events() {
        let (gov, _, bus, _) = governance().await;
        let control = gov.pause().await.unwrap();
        assert!(control.paused);
        let control = gov.resume().await.unwrap();
        assert!(!control.paused);

        let kinds: Vec<EventKind> = bus
            .history(&crate::events::EventFilter::all(), None)
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&EventKind::ExecutionPaused));
        assert!(kinds.contains(&EventKind::ExecutionResumed));
    }

    #[tokio::test]
    async fn select_architecture_option_records_on_project() {
        let (gov, _, _, project_id) = governance().await;
        let project = gov
            .select_architecture_option("opt-2", "alice", Some("simplest"))
            .await
            .unwrap();
        assert_eq!(project.id, project_id);
        assert_eq!(project.selected_option.as_deref(), Some("opt-2"));
    }

    #[tokio::test]
    async fn task_locks_evict_when_released() {
        let locks = TaskLocks::default();
        {
            let _guard = locks.acquire(1).await;
            assert_eq!(locks.len(), 1);
        }
        locks.evict_unheld();
        assert_eq!(locks.len(), 0);
    }
}
