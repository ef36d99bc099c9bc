//! Multi-project workspace: one isolated store file per project plus a
//! small registry so name lookups don't open every store.
//!
//! The registry maps unique project names to ids and filesystem roots; each
//! project's own store carries the authoritative `projects` row. Store
//! handles are opened lazily and cached. Deleting a project removes its
//! store file and the `.foreman` tree under its root, which cascades every
//! owned entity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::{Result, WorkflowError};
use crate::events::{EventBus, EventFilter, EventKind};
use crate::store::models::Project;
use crate::store::{ProjectStore, StoreHandle};

pub struct Workspace {
    data_dir: PathBuf,
    registry: Mutex<Connection>,
    stores: RwLock<HashMap<i64, StoreHandle>>,
    bus: EventBus,
}

impl Workspace {
    pub fn open(data_dir: &Path, bus: EventBus) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let registry = Connection::open(data_dir.join("registry.db"))
            .map_err(|e| WorkflowError::Storage(format!("open registry: {e}")))?;
        registry.execute_batch(
            "CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                root_path TEXT NOT NULL,
                store_path TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            registry: Mutex::new(registry),
            stores: RwLock::new(HashMap::new()),
            bus,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn registry(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.registry
            .lock()
            .map_err(|e| WorkflowError::Internal(format!("registry lock poisoned: {e}")))
    }

    // ── Project lifecycle ─────────────────────────────────────────────

    /// Create a project: registry row, fresh store file at the latest
    /// schema, project row, and working directory.
    pub fn create_project(
        &self,
        name: &str,
        root_path: Option<&Path>,
        default_engine: &str,
    ) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(WorkflowError::Validation("project name is required".into()));
        }

        let root = match root_path {
            Some(path) => path.to_path_buf(),
            None => self.data_dir.join("workdirs").join(name),
        };
        std::fs::create_dir_all(&root)?;
        let root = std::fs::canonicalize(&root)?;

        let root_str = root.to_string_lossy().into_owned();
        let id = {
            let registry = self.registry()?;
            registry
                .execute(
                    "INSERT INTO projects (name, root_path, store_path, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![name, root_str, "", chrono::Utc::now().to_rfc3339()],
                )
                .map_err(|e| match WorkflowError::from(e) {
                    WorkflowError::Conflict(_) => {
                        WorkflowError::Conflict(format!("project {name:?} already exists"))
                    }
                    other => other,
                })?;
            let id = registry.last_insert_rowid();
            let store_path = self.store_path(id);
            registry.execute(
                "UPDATE projects SET store_path = ?1 WHERE id = ?2",
                params![store_path.to_string_lossy(), id],
            )?;
            id
        };

        let store = ProjectStore::open(&self.store_path(id))?;
        let project = store.insert_project(Some(id), name, &root_str, default_engine)?;
        self.stores
            .write()
            .unwrap()
            .insert(id, StoreHandle::new(store));

        self.bus.publish(
            EventKind::ProjectCreated,
            Some(id),
            serde_json::json!({"project_id": id, "name": name}),
        );
        Ok(project)
    }

    pub fn get_project(&self, id: i64) -> Result<Project> {
        let handle = self.store(id)?;
        let store = handle.lock_sync()?;
        store.get_project(id)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<i64>> {
        let registry = self.registry()?;
        Ok(registry
            .query_row(
                "SELECT id FROM projects WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn project_ids(&self) -> Result<Vec<i64>> {
        let registry = self.registry()?;
        let mut stmt = registry.prepare("SELECT id FROM projects ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<i64>>>()
            .map_err(Into::into)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        self.project_ids()?
            .into_iter()
            .map(|id| self.get_project(id))
            .collect()
    }

    pub fn delete_project(&self, id: i64) -> Result<()> {
        let project = self.get_project(id)?;
        self.stores.write().unwrap().remove(&id);

        {
            let registry = self.registry()?;
            let count = registry.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
            if count == 0 {
                return Err(WorkflowError::not_found("project", id));
            }
        }

        // The store file holds every owned row; removing it is the cascade.
        let store_path = self.store_path(id);
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{suffix}", store_path.display()));
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
        }
        let foreman_dir = Path::new(&project.root_path).join(".foreman");
        if foreman_dir.exists() {
            let _ = std::fs::remove_dir_all(foreman_dir);
        }

        self.bus.publish(
            EventKind::ProjectDeleted,
            Some(id),
            serde_json::json!({"project_id": id, "name": project.name}),
        );
        Ok(())
    }

    // ── Store access ──────────────────────────────────────────────────

    pub fn store(&self, project_id: i64) -> Result<StoreHandle> {
        if let Some(handle) = self.stores.read().unwrap().get(&project_id) {
            return Ok(handle.clone());
        }

        let path = {
            let registry = self.registry()?;
            registry
                .query_row(
                    "SELECT store_path FROM projects WHERE id = ?1",
                    params![project_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .ok_or_else(|| WorkflowError::not_found("project", project_id))?
        };

        let store = ProjectStore::open(Path::new(&path))?;
        // Event numbering continues from the persisted audit trail.
        let last_seq = store.last_event_seq(project_id)?;
        self.bus.seed_project_seq(project_id, last_seq as u64);

        let handle = StoreHandle::new(store);
        let mut stores = self.stores.write().unwrap();
        // Another thread may have opened it while we were; first one wins.
        Ok(stores
            .entry(project_id)
            .or_insert_with(|| handle)
            .clone())
    }

    fn store_path(&self, project_id: i64) -> PathBuf {
        self.data_dir.join(format!("project_{project_id}.db"))
    }

    /// Forward every project-scoped event into the owning project's audit
    /// table. Subscribers never block publishers; persistence failures for
    /// a just-deleted project are logged and skipped.
    pub fn spawn_audit_writer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let workspace = Arc::clone(self);
        let mut subscription = self
            .bus
            .subscribe_with_capacity(EventFilter::all(), 1024);
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Some(project_id) = event.project_id else {
                    continue;
                };
                if event.kind == EventKind::ProjectDeleted {
                    continue;
                }
                let Ok(handle) = workspace.store(project_id) else {
                    continue;
                };
                let result = handle.call(move |store| store.insert_event(&event)).await;
                if let Err(err) = result {
                    tracing::warn!(project = project_id, "audit write failed: {err}");
                }
            }
        })
    }
}
