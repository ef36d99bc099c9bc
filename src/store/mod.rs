//! Per-project persistence: one embedded SQLite file per project, with the
//! DAO as the only writer.
//!
//! All writes are transactional per call. Migrations are version-stamped in
//! `schema_version` and idempotent; a freshly created store always carries
//! the latest schema. `StoreHandle` moves synchronous SQLite work onto
//! tokio's blocking pool so async workers never park on database I/O.

pub mod models;
pub mod workspace;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::{Result, WorkflowError};
use crate::events::Event;
use crate::gates::{GateReport, GateSpec};
use models::*;

// ── Migrations ────────────────────────────────────────────────────────

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "
    CREATE TABLE IF NOT EXISTS projects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        root_path TEXT NOT NULL,
        current_phase TEXT,
        default_engine TEXT NOT NULL DEFAULT 'null',
        selected_option TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        priority INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        current_phase TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        active_version_id INTEGER,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS task_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        version_num INTEGER NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        acceptance_criteria TEXT NOT NULL DEFAULT '[]',
        depends_on TEXT NOT NULL DEFAULT '[]',
        gates TEXT NOT NULL DEFAULT '[]',
        phase TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(task_id, version_num)
    );

    CREATE TABLE IF NOT EXISTS change_requests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        status TEXT NOT NULL DEFAULT 'draft',
        payload TEXT NOT NULL,
        diff_artifact_id INTEGER,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS approvals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        change_request_id INTEGER REFERENCES change_requests(id) ON DELETE CASCADE,
        task_version_id INTEGER REFERENCES task_versions(id) ON DELETE CASCADE,
        approver TEXT NOT NULL,
        decision TEXT NOT NULL,
        notes TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS artifacts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        task_id INTEGER REFERENCES tasks(id) ON DELETE SET NULL,
        run_id INTEGER,
        kind TEXT NOT NULL,
        path TEXT NOT NULL,
        hash TEXT NOT NULL,
        size INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE(project_id, kind, hash)
    );

    CREATE TABLE IF NOT EXISTS runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        task_id INTEGER REFERENCES tasks(id) ON DELETE SET NULL,
        engine TEXT NOT NULL,
        phase TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'running',
        gate_results TEXT,
        error TEXT,
        correlation_id TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT
    );

    CREATE TABLE IF NOT EXISTS control_state (
        project_id INTEGER PRIMARY KEY REFERENCES projects(id) ON DELETE CASCADE,
        paused INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        timeout_seconds INTEGER NOT NULL DEFAULT 300,
        current_task_id INTEGER
    );

    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER,
        seq INTEGER NOT NULL,
        kind TEXT NOT NULL,
        correlation_id TEXT,
        payload TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(project_id, status);
    CREATE INDEX IF NOT EXISTS idx_versions_task ON task_versions(task_id);
    CREATE INDEX IF NOT EXISTS idx_crs_task ON change_requests(task_id);
    CREATE INDEX IF NOT EXISTS idx_artifacts_project ON artifacts(project_id);
    CREATE INDEX IF NOT EXISTS idx_runs_task ON runs(task_id);
    CREATE INDEX IF NOT EXISTS idx_events_project ON events(project_id, seq);
    ",
)];

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn corrupt(what: &str, value: &str) -> WorkflowError {
    WorkflowError::Storage(format!("corrupt {what} in database: {value:?}"))
}

fn parse_json<T: serde::de::DeserializeOwned>(what: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|_| corrupt(what, raw))
}

// ── Async handle ──────────────────────────────────────────────────────

/// Async-safe handle to a project store. All access runs on tokio's
/// blocking pool; closures must own their captures.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<ProjectStore>>,
}

impl StoreHandle {
    pub fn new(store: ProjectStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ProjectStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| WorkflowError::Internal(format!("store lock poisoned: {e}")))?;
            f(&guard)
        })
        .await
        .map_err(|e| WorkflowError::Internal(format!("store task panicked: {e}")))?
    }

    /// Synchronous access for startup, audit flushing, and tests. Must not
    /// be called from a hot async path.
    pub fn lock_sync(&self) -> Result<MutexGuard<'_, ProjectStore>> {
        self.inner
            .lock()
            .map_err(|e| WorkflowError::Internal(format!("store lock poisoned: {e}")))
    }
}

// ── Store ─────────────────────────────────────────────────────────────

pub struct ProjectStore {
    conn: Connection,
}

impl ProjectStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| WorkflowError::Storage(format!("open {}: {e}", path.display())))?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| WorkflowError::Storage(format!("open in-memory store: {e}")))?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.apply_migrations()
    }

    fn apply_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;
        let current: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        for (version, sql) in MIGRATIONS {
            if *version > current {
                self.conn.execute_batch(sql)?;
                self.conn.execute(
                    "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                    params![version, now()],
                )?;
            }
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?)
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn insert_project(
        &self,
        id: Option<i64>,
        name: &str,
        root_path: &str,
        default_engine: &str,
    ) -> Result<Project> {
        let ts = now();
        match id {
            Some(id) => self.conn.execute(
                "INSERT INTO projects (id, name, root_path, default_engine, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, name, root_path, default_engine, ts],
            )?,
            None => self.conn.execute(
                "INSERT INTO projects (name, root_path, default_engine, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![name, root_path, default_engine, ts],
            )?,
        };
        let id = id.unwrap_or_else(|| self.conn.last_insert_rowid());
        // Control state rides along with the project row.
        self.conn.execute(
            "INSERT OR IGNORE INTO control_state (project_id) VALUES (?1)",
            params![id],
        )?;
        self.get_project(id)
    }

    pub fn get_project(&self, id: i64) -> Result<Project> {
        self.conn
            .query_row(
                "SELECT id, name, root_path, current_phase, default_engine, selected_option,
                        created_at, updated_at
                 FROM projects WHERE id = ?1",
                params![id],
                project_from_row,
            )
            .optional()?
            .ok_or_else(|| WorkflowError::not_found("project", id))?
    }

    pub fn update_project(
        &self,
        id: i64,
        current_phase: Option<PhaseType>,
        default_engine: Option<&str>,
        selected_option: Option<&str>,
    ) -> Result<Project> {
        let tx = self.conn.unchecked_transaction()?;
        if let Some(phase) = current_phase {
            tx.execute(
                "UPDATE projects SET current_phase = ?1, updated_at = ?2 WHERE id = ?3",
                params![phase.as_str(), now(), id],
            )?;
        }
        if let Some(engine) = default_engine {
            tx.execute(
                "UPDATE projects SET default_engine = ?1, updated_at = ?2 WHERE id = ?3",
                params![engine, now(), id],
            )?;
        }
        if let Some(option) = selected_option {
            tx.execute(
                "UPDATE projects SET selected_option = ?1, updated_at = ?2 WHERE id = ?3",
                params![option, now(), id],
            )?;
        }
        tx.commit()?;
        self.get_project(id)
    }

    pub fn delete_project(&self, id: i64) -> Result<()> {
        let count = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        if count == 0 {
            return Err(WorkflowError::not_found("project", id));
        }
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    /// Create a task with its version 1 in a single transaction.
    /// `depends_on` names existing task ids.
    pub fn create_task(
        &self,
        project_id: i64,
        spec: &TaskSpec,
        phase: Option<PhaseType>,
    ) -> Result<(Task, TaskVersion)> {
        let mut created =
            self.create_task_batch(project_id, std::slice::from_ref(spec), phase, false)?;
        Ok(created.remove(0))
    }

    /// Insert a batch of tasks atomically. With `deps_are_indices`,
    /// `depends_on` entries are 0-based indices into the batch and are
    /// rewritten to the assigned task ids, so planner output can reference
    /// sibling tasks before ids exist. Otherwise entries must name existing
    /// tasks.
    pub fn create_task_batch(
        &self,
        project_id: i64,
        specs: &[TaskSpec],
        phase: Option<PhaseType>,
        deps_are_indices: bool,
    ) -> Result<Vec<(Task, TaskVersion)>> {
        let tx = self.conn.unchecked_transaction()?;
        let ts = now();
        let phase_str = phase.map(|p| p.as_str());

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.title.trim().is_empty() {
                return Err(WorkflowError::Validation("task title is required".into()));
            }
            tx.execute(
                "INSERT INTO tasks (project_id, title, description, priority, status,
                                    current_phase, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)",
                params![project_id, spec.title, spec.description, spec.priority, phase_str, ts],
            )?;
            ids.push(tx.last_insert_rowid());
        }

        for (spec, task_id) in specs.iter().zip(&ids) {
            let deps: Vec<i64> = if deps_are_indices {
                spec.depends_on
                    .iter()
                    .map(|&index| {
                        usize::try_from(index)
                            .ok()
                            .and_then(|i| ids.get(i).copied())
                            .ok_or_else(|| {
                                WorkflowError::Validation(format!(
                                    "dependency index {index} is out of range"
                                ))
                            })
                    })
                    .collect::<Result<_>>()?
            } else {
                for &dep in &spec.depends_on {
                    let exists: bool = tx.query_row(
                        "SELECT COUNT(*) > 0 FROM tasks WHERE id = ?1",
                        params![dep],
                        |row| row.get(0),
                    )?;
                    if !exists {
                        return Err(WorkflowError::Validation(format!(
                            "dependency task {dep} does not exist"
                        )));
                    }
                }
                spec.depends_on.clone()
            };
            tx.execute(
                "INSERT INTO task_versions (task_id, version_num, title, description,
                                            acceptance_criteria, depends_on, gates, phase, created_at)
                 VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    task_id,
                    spec.title,
                    spec.description,
                    serde_json::to_string(&spec.acceptance_criteria)?,
                    serde_json::to_string(&deps)?,
                    serde_json::to_string(&spec.gates)?,
                    phase_str,
                    ts
                ],
            )?;
            let version_id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE tasks SET active_version_id = ?1 WHERE id = ?2",
                params![version_id, task_id],
            )?;
        }
        tx.commit()?;

        ids.iter()
            .map(|&id| Ok((self.get_task(id)?, self.active_version(id)?)))
            .collect()
    }

    /// Append the next version for a task and sync the task row to it.
    /// Callers hold the per-task lock, so the max+1 read is race-free.
    pub fn create_task_version(
        &self,
        task_id: i64,
        spec: &TaskSpec,
        phase: Option<PhaseType>,
    ) -> Result<(Task, TaskVersion)> {
        let tx = self.conn.unchecked_transaction()?;
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version_num), 0) + 1 FROM task_versions WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        let ts = now();
        tx.execute(
            "INSERT INTO task_versions (task_id, version_num, title, description,
                                        acceptance_criteria, depends_on, gates, phase, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task_id,
                next,
                spec.title,
                spec.description,
                serde_json::to_string(&spec.acceptance_criteria)?,
                serde_json::to_string(&spec.depends_on)?,
                serde_json::to_string(&spec.gates)?,
                phase.map(|p| p.as_str()),
                ts
            ],
        )?;
        let version_id = tx.last_insert_rowid();
        let updated = tx.execute(
            "UPDATE tasks SET title = ?1, description = ?2, priority = ?3,
                              active_version_id = ?4, updated_at = ?5
             WHERE id = ?6",
            params![spec.title, spec.description, spec.priority, version_id, ts, task_id],
        )?;
        if updated == 0 {
            return Err(WorkflowError::not_found("task", task_id));
        }
        tx.commit()?;
        Ok((self.get_task(task_id)?, self.get_task_version(version_id)?))
    }

    pub fn get_task(&self, id: i64) -> Result<Task> {
        self.conn
            .query_row(
                "SELECT id, project_id, title, description, priority, status, current_phase,
                        attempts, active_version_id, metadata, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![id],
                task_from_row,
            )
            .optional()?
            .ok_or_else(|| WorkflowError::not_found("task", id))?
    }

    pub fn list_tasks(
        &self,
        project_id: i64,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, title, description, priority, status, current_phase,
                    attempts, active_version_id, metadata, created_at, updated_at
             FROM tasks WHERE project_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY priority DESC, id",
        )?;
        let rows = stmt.query_map(
            params![project_id, status.map(|s| s.as_str())],
            task_from_row,
        )?;
        rows.map(|row| row.map_err(Into::into).and_then(|r| r)).collect()
    }

    pub fn set_task_status(&self, id: i64, status: TaskStatus) -> Result<Task> {
        let updated = self.conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now(), id],
        )?;
        if updated == 0 {
            return Err(WorkflowError::not_found("task", id));
        }
        self.get_task(id)
    }

    pub fn set_task_phase(&self, id: i64, phase: PhaseType) -> Result<Task> {
        self.conn.execute(
            "UPDATE tasks SET current_phase = ?1, updated_at = ?2 WHERE id = ?3",
            params![phase.as_str(), now(), id],
        )?;
        self.get_task(id)
    }

    pub fn bump_attempts(&self, id: i64) -> Result<i64> {
        self.conn.execute(
            "UPDATE tasks SET attempts = attempts + 1, updated_at = ?1 WHERE id = ?2",
            params![now(), id],
        )?;
        Ok(self
            .conn
            .query_row("SELECT attempts FROM tasks WHERE id = ?1", params![id], |r| {
                r.get(0)
            })?)
    }

    pub fn merge_task_metadata(&self, id: i64, patch: &serde_json::Value) -> Result<Task> {
        let task = self.get_task(id)?;
        let mut metadata = task.metadata;
        if let (Some(object), Some(extra)) = (metadata.as_object_mut(), patch.as_object()) {
            for (key, value) in extra {
                object.insert(key.clone(), value.clone());
            }
        }
        self.conn.execute(
            "UPDATE tasks SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(&metadata)?, now(), id],
        )?;
        self.get_task(id)
    }

    pub fn delete_task(&self, id: i64) -> Result<()> {
        let count = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        if count == 0 {
            return Err(WorkflowError::not_found("task", id));
        }
        Ok(())
    }

    /// Next task eligible for the coder loop: approved, highest priority
    /// first, oldest first within a priority.
    pub fn next_approved_task(&self, project_id: i64) -> Result<Option<Task>> {
        let task = self
            .conn
            .query_row(
                "SELECT id, project_id, title, description, priority, status, current_phase,
                        attempts, active_version_id, metadata, created_at, updated_at
                 FROM tasks WHERE project_id = ?1 AND status = 'approved'
                 ORDER BY priority DESC, id LIMIT 1",
                params![project_id],
                task_from_row,
            )
            .optional()?;
        task.transpose()
    }

    // ── Task versions ─────────────────────────────────────────────────

    pub fn get_task_version(&self, id: i64) -> Result<TaskVersion> {
        self.conn
            .query_row(
                "SELECT id, task_id, version_num, title, description, acceptance_criteria,
                        depends_on, gates, phase, created_at
                 FROM task_versions WHERE id = ?1",
                params![id],
                version_from_row,
            )
            .optional()?
            .ok_or_else(|| WorkflowError::not_found("task version", id))?
    }

    pub fn list_task_versions(&self, task_id: i64) -> Result<Vec<TaskVersion>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, version_num, title, description, acceptance_criteria,
                    depends_on, gates, phase, created_at
             FROM task_versions WHERE task_id = ?1 ORDER BY version_num",
        )?;
        let rows = stmt.query_map(params![task_id], version_from_row)?;
        rows.map(|row| row.map_err(Into::into).and_then(|r| r)).collect()
    }

    pub fn active_version(&self, task_id: i64) -> Result<TaskVersion> {
        let task = self.get_task(task_id)?;
        let version_id = task.active_version_id.ok_or_else(|| {
            WorkflowError::Storage(format!("task {task_id} has no active version"))
        })?;
        self.get_task_version(version_id)
    }

    // ── Change requests ───────────────────────────────────────────────

    pub fn insert_change_request(
        &self,
        task_id: i64,
        payload: &ChangeRequestPayload,
    ) -> Result<ChangeRequest> {
        let ts = now();
        self.conn.execute(
            "INSERT INTO change_requests (task_id, status, payload, created_at, updated_at)
             VALUES (?1, 'draft', ?2, ?3, ?3)",
            params![task_id, serde_json::to_string(payload)?, ts],
        )?;
        self.get_change_request(self.conn.last_insert_rowid())
    }

    pub fn get_change_request(&self, id: i64) -> Result<ChangeRequest> {
        self.conn
            .query_row(
                "SELECT id, task_id, status, payload, diff_artifact_id, created_at, updated_at
                 FROM change_requests WHERE id = ?1",
                params![id],
                change_request_from_row,
            )
            .optional()?
            .ok_or_else(|| WorkflowError::not_found("change request", id))?
    }

    pub fn list_change_requests(
        &self,
        task_id: Option<i64>,
        status: Option<ChangeRequestStatus>,
    ) -> Result<Vec<ChangeRequest>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, status, payload, diff_artifact_id, created_at, updated_at
             FROM change_requests
             WHERE (?1 IS NULL OR task_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(
            params![task_id, status.map(|s| s.as_str())],
            change_request_from_row,
        )?;
        rows.map(|row| row.map_err(Into::into).and_then(|r| r)).collect()
    }

    pub fn set_change_request_status(
        &self,
        id: i64,
        status: ChangeRequestStatus,
    ) -> Result<ChangeRequest> {
        let updated = self.conn.execute(
            "UPDATE change_requests SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now(), id],
        )?;
        if updated == 0 {
            return Err(WorkflowError::not_found("change request", id));
        }
        self.get_change_request(id)
    }

    pub fn set_change_request_diff(&self, id: i64, artifact_id: i64) -> Result<ChangeRequest> {
        self.conn.execute(
            "UPDATE change_requests SET diff_artifact_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![artifact_id, now(), id],
        )?;
        self.get_change_request(id)
    }

    /// Most recent approved change request for a task, optionally narrowed
    /// to one payload kind.
    pub fn find_approved_change_request(
        &self,
        task_id: i64,
        kind: Option<&str>,
    ) -> Result<Option<ChangeRequest>> {
        let approved =
            self.list_change_requests(Some(task_id), Some(ChangeRequestStatus::Approved))?;
        Ok(approved
            .into_iter()
            .find(|cr| kind.is_none_or(|k| cr.payload.kind() == k)))
    }

    // ── Approvals ─────────────────────────────────────────────────────

    pub fn insert_approval(
        &self,
        change_request_id: Option<i64>,
        task_version_id: Option<i64>,
        approver: &str,
        decision: Decision,
        notes: Option<&str>,
    ) -> Result<Approval> {
        self.conn.execute(
            "INSERT INTO approvals (change_request_id, task_version_id, approver, decision,
                                    notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                change_request_id,
                task_version_id,
                approver,
                decision.as_str(),
                notes,
                now()
            ],
        )?;
        self.get_approval(self.conn.last_insert_rowid())
    }

    pub fn get_approval(&self, id: i64) -> Result<Approval> {
        self.conn
            .query_row(
                "SELECT id, change_request_id, task_version_id, approver, decision, notes,
                        created_at
                 FROM approvals WHERE id = ?1",
                params![id],
                approval_from_row,
            )
            .optional()?
            .ok_or_else(|| WorkflowError::not_found("approval", id))?
    }

    pub fn list_approvals_for_change_request(&self, cr_id: i64) -> Result<Vec<Approval>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, change_request_id, task_version_id, approver, decision, notes, created_at
             FROM approvals WHERE change_request_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![cr_id], approval_from_row)?;
        rows.map(|row| row.map_err(Into::into).and_then(|r| r)).collect()
    }

    /// The identity behind the most recent APPROVE decision touching this
    /// task, through either a version or a change request. Feeds the
    /// `Approver` commit trailer.
    pub fn latest_approver(&self, task_id: i64) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT a.approver FROM approvals a
                 LEFT JOIN task_versions tv ON a.task_version_id = tv.id
                 LEFT JOIN change_requests cr ON a.change_request_id = cr.id
                 WHERE a.decision = 'approve' AND (tv.task_id = ?1 OR cr.task_id = ?1)
                 ORDER BY a.id DESC LIMIT 1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    pub fn insert_artifact(
        &self,
        project_id: i64,
        task_id: Option<i64>,
        run_id: Option<i64>,
        kind: ArtifactKind,
        path: &str,
        hash: &str,
        size: i64,
    ) -> Result<Artifact> {
        self.conn.execute(
            "INSERT INTO artifacts (project_id, task_id, run_id, kind, path, hash, size,
                                    created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![project_id, task_id, run_id, kind.as_str(), path, hash, size, now()],
        )?;
        self.get_artifact(self.conn.last_insert_rowid())
    }

    pub fn get_artifact(&self, id: i64) -> Result<Artifact> {
        self.conn
            .query_row(
                "SELECT id, project_id, task_id, run_id, kind, path, hash, size, created_at
                 FROM artifacts WHERE id = ?1",
                params![id],
                artifact_from_row,
            )
            .optional()?
            .ok_or_else(|| WorkflowError::not_found("artifact", id))?
    }

    pub fn find_artifact_by_hash(
        &self,
        project_id: i64,
        kind: ArtifactKind,
        hash: &str,
    ) -> Result<Option<Artifact>> {
        let artifact = self
            .conn
            .query_row(
                "SELECT id, project_id, task_id, run_id, kind, path, hash, size, created_at
                 FROM artifacts WHERE project_id = ?1 AND kind = ?2 AND hash = ?3",
                params![project_id, kind.as_str(), hash],
                artifact_from_row,
            )
            .optional()?;
        artifact.transpose()
    }

    pub fn list_artifacts(
        &self,
        project_id: i64,
        kind: Option<ArtifactKind>,
        task_id: Option<i64>,
    ) -> Result<Vec<Artifact>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, task_id, run_id, kind, path, hash, size, created_at
             FROM artifacts
             WHERE project_id = ?1 AND (?2 IS NULL OR kind = ?2) AND (?3 IS NULL OR task_id = ?3)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(
            params![project_id, kind.map(|k| k.as_str()), task_id],
            artifact_from_row,
        )?;
        rows.map(|row| row.map_err(Into::into).and_then(|r| r)).collect()
    }

    pub fn latest_artifact(
        &self,
        project_id: i64,
        kind: ArtifactKind,
    ) -> Result<Option<Artifact>> {
        let artifact = self
            .conn
            .query_row(
                "SELECT id, project_id, task_id, run_id, kind, path, hash, size, created_at
                 FROM artifacts WHERE project_id = ?1 AND kind = ?2 ORDER BY id DESC LIMIT 1",
                params![project_id, kind.as_str()],
                artifact_from_row,
            )
            .optional()?;
        artifact.transpose()
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(
        &self,
        project_id: i64,
        task_id: Option<i64>,
        engine: &str,
        phase: PhaseType,
        correlation_id: &str,
    ) -> Result<Run> {
        self.conn.execute(
            "INSERT INTO runs (project_id, task_id, engine, phase, status, correlation_id,
                               started_at)
             VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6)",
            params![project_id, task_id, engine, phase.as_str(), correlation_id, now()],
        )?;
        self.get_run(self.conn.last_insert_rowid())
    }

    pub fn finish_run(
        &self,
        id: i64,
        status: RunStatus,
        error: Option<&str>,
        gate_results: Option<&GateReport>,
    ) -> Result<Run> {
        let gate_json = gate_results.map(serde_json::to_string).transpose()?;
        let finished_at = status.is_terminal().then(now);
        self.conn.execute(
            "UPDATE runs SET status = ?1, error = ?2, gate_results = ?3,
                             finished_at = COALESCE(?4, finished_at)
             WHERE id = ?5",
            params![status.as_str(), error, gate_json, finished_at, id],
        )?;
        self.get_run(id)
    }

    pub fn get_run(&self, id: i64) -> Result<Run> {
        self.conn
            .query_row(
                "SELECT id, project_id, task_id, engine, phase, status, gate_results, error,
                        correlation_id, started_at, finished_at
                 FROM runs WHERE id = ?1",
                params![id],
                run_from_row,
            )
            .optional()?
            .ok_or_else(|| WorkflowError::not_found("run", id))?
    }

    pub fn list_runs(&self, project_id: i64, task_id: Option<i64>) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, task_id, engine, phase, status, gate_results, error,
                    correlation_id, started_at, finished_at
             FROM runs WHERE project_id = ?1 AND (?2 IS NULL OR task_id = ?2)
             ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![project_id, task_id], run_from_row)?;
        rows.map(|row| row.map_err(Into::into).and_then(|r| r)).collect()
    }

    /// COMPLETED tasks must own at least one fully passing SUCCESS run.
    pub fn has_passing_run(&self, task_id: i64) -> Result<bool> {
        let runs = self.list_runs(self.get_task(task_id)?.project_id, Some(task_id))?;
        Ok(runs.iter().any(|run| {
            run.status == RunStatus::Success
                && run
                    .gate_results
                    .as_ref()
                    .map(|report| report.all_passed())
                    .unwrap_or(true)
        }))
    }

    // ── Control state ─────────────────────────────────────────────────

    pub fn control_state(&self, project_id: i64) -> Result<ControlState> {
        self.conn.execute(
            "INSERT OR IGNORE INTO control_state (project_id) VALUES (?1)",
            params![project_id],
        )?;
        Ok(self.conn.query_row(
            "SELECT project_id, paused, max_attempts, timeout_seconds, current_task_id
             FROM control_state WHERE project_id = ?1",
            params![project_id],
            |row| {
                Ok(ControlState {
                    project_id: row.get(0)?,
                    paused: row.get::<_, i64>(1)? != 0,
                    max_attempts: row.get(2)?,
                    timeout_seconds: row.get(3)?,
                    current_task_id: row.get(4)?,
                })
            },
        )?)
    }

    pub fn set_paused(&self, project_id: i64, paused: bool) -> Result<ControlState> {
        self.conn.execute(
            "UPDATE control_state SET paused = ?1 WHERE project_id = ?2",
            params![paused as i64, project_id],
        )?;
        self.control_state(project_id)
    }

    pub fn set_limits(
        &self,
        project_id: i64,
        max_attempts: Option<i64>,
        timeout_seconds: Option<i64>,
    ) -> Result<ControlState> {
        if let Some(attempts) = max_attempts {
            if attempts < 1 {
                return Err(WorkflowError::Validation(
                    "max_attempts must be at least 1".into(),
                ));
            }
            self.conn.execute(
                "UPDATE control_state SET max_attempts = ?1 WHERE project_id = ?2",
                params![attempts, project_id],
            )?;
        }
        if let Some(timeout) = timeout_seconds {
            self.conn.execute(
                "UPDATE control_state SET timeout_seconds = ?1 WHERE project_id = ?2",
                params![timeout, project_id],
            )?;
        }
        self.control_state(project_id)
    }

    pub fn set_current_task(&self, project_id: i64, task_id: Option<i64>) -> Result<ControlState> {
        self.conn.execute(
            "UPDATE control_state SET current_task_id = ?1 WHERE project_id = ?2",
            params![task_id, project_id],
        )?;
        self.control_state(project_id)
    }

    // ── Events (audit rows) ───────────────────────────────────────────

    pub fn insert_event(&self, event: &Event) -> Result<EventRecord> {
        self.conn.execute(
            "INSERT INTO events (project_id, seq, kind, correlation_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.project_id,
                event.project_seq.unwrap_or(event.seq) as i64,
                event.kind.as_str(),
                event.correlation_id,
                serde_json::to_string(&event.payload)?,
                event.timestamp
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(self.conn.query_row(
            "SELECT id, project_id, seq, kind, correlation_id, payload, created_at
             FROM events WHERE id = ?1",
            params![id],
            event_record_from_row,
        )??)
    }

    pub fn last_event_seq(&self, project_id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM events WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?)
    }

    pub fn list_events(&self, project_id: i64, limit: i64) -> Result<Vec<EventRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, seq, kind, correlation_id, payload, created_at
             FROM (SELECT * FROM events WHERE project_id = ?1 ORDER BY seq DESC LIMIT ?2)
             ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![project_id, limit], event_record_from_row)?;
        rows.map(|row| row.map_err(Into::into).and_then(|r| r)).collect()
    }
}

// ── Row mappers ───────────────────────────────────────────────────────
//
// Each mapper returns `rusqlite::Result<Result<T>>` so string parsing
// failures surface as typed storage errors instead of panics.

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Project>> {
    let current_phase: Option<String> = row.get(3)?;
    Ok((|| {
        Ok(Project {
            id: row.get(0)?,
            name: row.get(1)?,
            root_path: row.get(2)?,
            current_phase: current_phase
                .map(|p| PhaseType::from_str(&p).map_err(|_| corrupt("phase", &p)))
                .transpose()?,
            default_engine: row.get(4)?,
            selected_option: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    })())
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Task>> {
    let status: String = row.get(5)?;
    let phase: Option<String> = row.get(6)?;
    let metadata: String = row.get(9)?;
    Ok((|| {
        Ok(Task {
            id: row.get(0)?,
            project_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            priority: row.get(4)?,
            status: TaskStatus::from_str(&status).map_err(|_| corrupt("task status", &status))?,
            current_phase: phase
                .map(|p| PhaseType::from_str(&p).map_err(|_| corrupt("phase", &p)))
                .transpose()?,
            attempts: row.get(7)?,
            active_version_id: row.get(8)?,
            metadata: parse_json("task metadata", &metadata)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    })())
}

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<TaskVersion>> {
    let criteria: String = row.get(5)?;
    let deps: String = row.get(6)?;
    let gates: String = row.get(7)?;
    let phase: Option<String> = row.get(8)?;
    Ok((|| {
        Ok(TaskVersion {
            id: row.get(0)?,
            task_id: row.get(1)?,
            version_num: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            acceptance_criteria: parse_json("acceptance criteria", &criteria)?,
            depends_on: parse_json("depends_on", &deps)?,
            gates: parse_json::<Vec<GateSpec>>("gates", &gates)?,
            phase: phase
                .map(|p| PhaseType::from_str(&p).map_err(|_| corrupt("phase", &p)))
                .transpose()?,
            created_at: row.get(9)?,
        })
    })())
}

fn change_request_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ChangeRequest>> {
    let status: String = row.get(2)?;
    let payload: String = row.get(3)?;
    Ok((|| {
        Ok(ChangeRequest {
            id: row.get(0)?,
            task_id: row.get(1)?,
            status: ChangeRequestStatus::from_str(&status)
                .map_err(|_| corrupt("change request status", &status))?,
            payload: parse_json("change request payload", &payload)?,
            diff_artifact_id: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    })())
}

fn approval_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Approval>> {
    let decision: String = row.get(4)?;
    Ok((|| {
        Ok(Approval {
            id: row.get(0)?,
            change_request_id: row.get(1)?,
            task_version_id: row.get(2)?,
            approver: row.get(3)?,
            decision: Decision::from_str(&decision).map_err(|_| corrupt("decision", &decision))?,
            notes: row.get(5)?,
            created_at: row.get(6)?,
        })
    })())
}

fn artifact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Artifact>> {
    let kind: String = row.get(4)?;
    Ok((|| {
        Ok(Artifact {
            id: row.get(0)?,
            project_id: row.get(1)?,
            task_id: row.get(2)?,
            run_id: row.get(3)?,
            kind: ArtifactKind::from_str(&kind).map_err(|_| corrupt("artifact kind", &kind))?,
            path: row.get(5)?,
            hash: row.get(6)?,
            size: row.get(7)?,
            created_at: row.get(8)?,
        })
    })())
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Run>> {
    let phase: String = row.get(4)?;
    let status: String = row.get(5)?;
    let gate_results: Option<String> = row.get(6)?;
    Ok((|| {
        Ok(Run {
            id: row.get(0)?,
            project_id: row.get(1)?,
            task_id: row.get(2)?,
            engine: row.get(3)?,
            phase: PhaseType::from_str(&phase).map_err(|_| corrupt("phase", &phase))?,
            status: RunStatus::from_str(&status).map_err(|_| corrupt("run status", &status))?,
            gate_results: gate_results
                .map(|raw| parse_json("gate results", &raw))
                .transpose()?,
            error: row.get(7)?,
            correlation_id: row.get(8)?,
            started_at: row.get(9)?,
            finished_at: row.get(10)?,
        })
    })())
}

fn event_record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<EventRecord>> {
    let payload: String = row.get(5)?;
    Ok((|| {
        Ok(EventRecord {
            id: row.get(0)?,
            project_id: row.get(1)?,
            seq: row.get(2)?,
            kind: row.get(3)?,
            correlation_id: row.get(4)?,
            payload: parse_json("event payload", &payload)?,
            created_at: row.get(6)?,
        })
    })())
}
