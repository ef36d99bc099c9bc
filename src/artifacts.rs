//! Content-addressed artifact storage under the project root.
//!
//! Bytes land at `.foreman/artifacts/<kind>/<hh>/<hash>` where `hh` is the
//! hash prefix. Writes go to a temp file and rename into place, so a path
//! is either absent or complete. Re-putting identical bytes returns the
//! existing metadata row.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::errors::{Result, WorkflowError};
use crate::events::{EventBus, EventKind};
use crate::store::StoreHandle;
use crate::store::models::{Artifact, ArtifactKind};

pub const ARTIFACTS_SUBDIR: &str = ".foreman/artifacts";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct ArtifactStore {
    project_id: i64,
    root: PathBuf,
    store: StoreHandle,
    bus: EventBus,
}

impl ArtifactStore {
    pub fn new(project_id: i64, root: &Path, store: StoreHandle, bus: EventBus) -> Self {
        Self {
            project_id,
            root: root.to_path_buf(),
            store,
            bus,
        }
    }

    /// Relative path is a pure function of kind and hash, so identical
    /// content lands on the same file without coordination.
    fn rel_path(kind: ArtifactKind, hash: &str) -> String {
        format!("{ARTIFACTS_SUBDIR}/{}/{}/{}", kind.as_str(), &hash[..2], hash)
    }

    pub fn abs_path(&self, artifact: &Artifact) -> PathBuf {
        self.root.join(&artifact.path)
    }

    pub async fn put(
        &self,
        kind: ArtifactKind,
        bytes: Vec<u8>,
        task_id: Option<i64>,
        run_id: Option<i64>,
    ) -> Result<Artifact> {
        let hash = sha256_hex(&bytes);
        let project_id = self.project_id;

        let hash_for_lookup = hash.clone();
        if let Some(existing) = self
            .store
            .call(move |store| store.find_artifact_by_hash(project_id, kind, &hash_for_lookup))
            .await?
        {
            return Ok(existing);
        }

        let rel = Self::rel_path(kind, &hash);
        let abs = self.root.join(&rel);
        // Derived from a hex digest, so this cannot escape; check anyway
        // because an escape here would be a security hole, not a bug.
        if !abs.starts_with(&self.root) {
            return Err(WorkflowError::Forbidden(format!(
                "artifact path {} escapes project root",
                abs.display()
            )));
        }

        let parent = abs.parent().ok_or_else(|| {
            WorkflowError::Internal("artifact path has no parent".to_string())
        })?;
        tokio::fs::create_dir_all(parent).await?;
        let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &abs).await?;

        let size = bytes.len() as i64;
        let rel_for_insert = rel.clone();
        let hash_for_insert = hash.clone();
        let inserted = self
            .store
            .call(move |store| {
                store.insert_artifact(
                    project_id,
                    task_id,
                    run_id,
                    kind,
                    &rel_for_insert,
                    &hash_for_insert,
                    size,
                )
            })
            .await;

        let artifact = match inserted {
            Ok(artifact) => artifact,
            // Lost a race with an identical put; the content file is shared.
            Err(WorkflowError::Conflict(_)) => {
                let hash_for_retry = hash.clone();
                self.store
                    .call(move |store| {
                        store.find_artifact_by_hash(project_id, kind, &hash_for_retry)
                    })
                    .await?
                    .ok_or_else(|| {
                        WorkflowError::Storage("artifact row vanished after conflict".into())
                    })?
            }
            Err(err) => return Err(err),
        };

        self.bus.publish(
            EventKind::ArtifactCreated,
            Some(self.project_id),
            serde_json::json!({
                "artifact_id": artifact.id,
                "kind": kind.as_str(),
                "hash": artifact.hash,
                "size": artifact.size,
                "task_id": task_id,
                "run_id": run_id,
            }),
        );
        Ok(artifact)
    }

    pub async fn put_text(
        &self,
        kind: ArtifactKind,
        text: &str,
        task_id: Option<i64>,
        run_id: Option<i64>,
    ) -> Result<Artifact> {
        self.put(kind, text.as_bytes().to_vec(), task_id, run_id).await
    }

    pub async fn get(&self, id: i64) -> Result<Artifact> {
        self.store.call(move |store| store.get_artifact(id)).await
    }

    pub async fn read(&self, artifact: &Artifact) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.abs_path(artifact)).await?)
    }

    pub async fn read_to_string(&self, artifact: &Artifact) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.read(artifact).await?).into_owned())
    }

    pub async fn open(&self, artifact: &Artifact) -> Result<tokio::fs::File> {
        Ok(tokio::fs::File::open(self.abs_path(artifact)).await?)
    }

    /// Recompute the content hash and compare to the metadata row.
    pub async fn verify(&self, artifact: &Artifact) -> Result<bool> {
        let bytes = self.read(artifact).await?;
        Ok(sha256_hex(&bytes) == artifact.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::store::ProjectStore;
    use tempfile::tempdir;

    async fn artifact_store(dir: &Path) -> (ArtifactStore, EventBus) {
        let bus = EventBus::default();
        let store = ProjectStore::open_in_memory().unwrap();
        let project = store
            .insert_project(None, "demo", &dir.to_string_lossy(), "null")
            .unwrap();
        let artifacts = ArtifactStore::new(
            project.id,
            dir,
            StoreHandle::new(store),
            bus.clone(),
        );
        (artifacts, bus)
    }

    #[tokio::test]
    async fn put_then_get_round_trips_contents() {
        let dir = tempdir().unwrap();
        let (artifacts, _) = artifact_store(dir.path()).await;

        let body = b"plan contents".to_vec();
        let artifact = artifacts
            .put(ArtifactKind::Plan, body.clone(), None, None)
            .await
            .unwrap();

        assert_eq!(artifact.hash, sha256_hex(&body));
        assert_eq!(artifact.size, body.len() as i64);
        let read_back = artifacts.read(&artifact).await.unwrap();
        assert_eq!(read_back, body);
    }

    #[tokio::test]
    async fn path_is_kind_prefix_hash() {
        let dir = tempdir().unwrap();
        let (artifacts, _) = artifact_store(dir.path()).await;

        let artifact = artifacts
            .put(ArtifactKind::Spec, b"spec body".to_vec(), None, None)
            .await
            .unwrap();

        let expected = format!(
            "{ARTIFACTS_SUBDIR}/spec/{}/{}",
            &artifact.hash[..2],
            artifact.hash
        );
        assert_eq!(artifact.path, expected);
        assert!(dir.path().join(&artifact.path).exists());
    }

    #[tokio::test]
    async fn identical_bytes_dedupe_to_same_row() {
        let dir = tempdir().unwrap();
        let (artifacts, _) = artifact_store(dir.path()).await;

        let first = artifacts
            .put(ArtifactKind::Log, b"same bytes".to_vec(), None, None)
            .await
            .unwrap();
        let second = artifacts
            .put(ArtifactKind::Log, b"same bytes".to_vec(), None, None)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.path, second.path);
    }

    #[tokio::test]
    async fn different_kinds_are_distinct_artifacts() {
        let dir = tempdir().unwrap();
        let (artifacts, _) = artifact_store(dir.path()).await;

        let log = artifacts
            .put(ArtifactKind::Log, b"shared".to_vec(), None, None)
            .await
            .unwrap();
        let diff = artifacts
            .put(ArtifactKind::Diff, b"shared".to_vec(), None, None)
            .await
            .unwrap();
        assert_ne!(log.id, diff.id);
        assert_eq!(log.hash, diff.hash);
        assert_ne!(log.path, diff.path);
    }

    #[tokio::test]
    async fn verify_detects_tampering() {
        let dir = tempdir().unwrap();
        let (artifacts, _) = artifact_store(dir.path()).await;

        let artifact = artifacts
            .put(ArtifactKind::Adr, b"decision".to_vec(), None, None)
            .await
            .unwrap();
        assert!(artifacts.verify(&artifact).await.unwrap());

        std::fs::write(artifacts.abs_path(&artifact), b"tampered").unwrap();
        assert!(!artifacts.verify(&artifact).await.unwrap());
    }

    #[tokio::test]
    async fn put_publishes_artifact_created() {
        let dir = tempdir().unwrap();
        let (artifacts, bus) = artifact_store(dir.path()).await;

        artifacts
            .put(ArtifactKind::Transcript, b"chat log".to_vec(), Some(3), None)
            .await
            .unwrap();

        let events = bus.history(
            &EventFilter {
                kind: Some(EventKind::ArtifactCreated),
                ..EventFilter::default()
            },
            None,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["kind"], "transcript");
        assert_eq!(events[0].payload["task_id"], 3);
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let (artifacts, _) = artifact_store(dir.path()).await;
        let artifact = artifacts
            .put(ArtifactKind::Plan, b"tidy".to_vec(), None, None)
            .await
            .unwrap();

        let parent = artifacts.abs_path(&artifact);
        let siblings: Vec<_> = std::fs::read_dir(parent.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(siblings.is_empty());
    }
}
