//! Version-control adapter: status, init, structured commit, diff.
//!
//! Every operation shells out to the external `git` binary through a
//! sandbox scoped to exactly that command. Commits stage the exact file
//! set, commit, and return the new revision id; on failure the working
//! tree is left as git left it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, WorkflowError};
use crate::events::{EventBus, EventKind};
use crate::sandbox::{CommandOutput, CommandSpec, Sandbox};

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Committer identity for automated commits.
const COMMIT_IDENT: [&str; 4] = [
    "-c",
    "user.name=foreman",
    "-c",
    "user.email=foreman@localhost",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsStatus {
    pub is_repo: bool,
    pub branch: String,
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
    pub has_changes: bool,
}

impl VcsStatus {
    fn not_a_repo() -> Self {
        Self {
            is_repo: false,
            branch: String::new(),
            staged: Vec::new(),
            unstaged: Vec::new(),
            untracked: Vec::new(),
            has_changes: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub summary: String,
    pub author: String,
    pub timestamp: String,
}

pub struct VcsAdapter {
    sandbox: Sandbox,
    project_id: i64,
    bus: EventBus,
}

impl VcsAdapter {
    pub fn new(root: &Path, bus: EventBus, project_id: i64) -> Result<Self> {
        let sandbox = Sandbox::for_commands(root, &["git"], GIT_TIMEOUT, bus.clone(), project_id)?;
        Ok(Self {
            sandbox,
            project_id,
            bus,
        })
    }

    async fn git(&self, args: &[&str]) -> Result<CommandOutput> {
        self.sandbox.run(CommandSpec::new("git", args)).await
    }

    async fn git_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.git(args).await?;
        if !output.success() {
            return Err(WorkflowError::Storage(format!(
                "git {} failed with code {}: {}",
                args.first().unwrap_or(&""),
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    pub async fn is_repo(&self) -> Result<bool> {
        Ok(self.git(&["rev-parse", "--git-dir"]).await?.success())
    }

    /// Initialize a repository with `main` as the initial branch. A no-op
    /// when the root is already a repository.
    pub async fn init(&self) -> Result<()> {
        if self.is_repo().await? {
            return Ok(());
        }
        self.git_checked(&["init", "-b", "main"]).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<VcsStatus> {
        if !self.is_repo().await? {
            return Ok(VcsStatus::not_a_repo());
        }

        let branch = self
            .git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .map(|out| {
                if out.success() {
                    out.stdout.trim().to_string()
                } else {
                    // Unborn HEAD in a fresh repository.
                    "main".to_string()
                }
            })?;

        let porcelain = self.git_checked(&["status", "--porcelain"]).await?;
        let mut staged = Vec::new();
        let mut unstaged = Vec::new();
        let mut untracked = Vec::new();
        for line in porcelain.stdout.lines() {
            if line.len() < 4 {
                continue;
            }
            let code = &line[..2];
            let file = line[3..].to_string();
            if code == "??" {
                untracked.push(file);
                continue;
            }
            let mut chars = code.chars();
            let index_state = chars.next().unwrap_or(' ');
            let tree_state = chars.next().unwrap_or(' ');
            if matches!(index_state, 'M' | 'A' | 'D' | 'R' | 'C') {
                staged.push(file.clone());
            }
            if matches!(tree_state, 'M' | 'D') {
                unstaged.push(file);
            }
        }

        let has_changes = !(staged.is_empty() && unstaged.is_empty() && untracked.is_empty());
        Ok(VcsStatus {
            is_repo: true,
            branch,
            staged,
            unstaged,
            untracked,
            has_changes,
        })
    }

    /// Stage the exact file set (everything when empty) and commit.
    /// Returns the new revision id.
    pub async fn commit(&self, files: &[String], message: &str) -> Result<String> {
        if files.is_empty() {
            self.git_checked(&["add", "-A"]).await?;
        } else {
            let mut args = vec!["add", "--"];
            args.extend(files.iter().map(String::as_str));
            self.git_checked(&args).await?;
        }

        let mut args: Vec<&str> = COMMIT_IDENT.to_vec();
        args.extend(["commit", "-m", message]);
        self.git_checked(&args).await?;

        let sha = self
            .git_checked(&["rev-parse", "HEAD"])
            .await?
            .stdout
            .trim()
            .to_string();

        self.bus.publish(
            EventKind::VcsCommitted,
            Some(self.project_id),
            serde_json::json!({
                "sha": sha,
                "summary": message.lines().next().unwrap_or(""),
                "files": files,
            }),
        );
        Ok(sha)
    }

    pub async fn diff(&self, cached: bool) -> Result<String> {
        let args: &[&str] = if cached {
            &["diff", "--cached"]
        } else {
            &["diff"]
        };
        Ok(self.git_checked(args).await?.stdout)
    }

    pub async fn last_commit(&self) -> Result<Option<CommitInfo>> {
        let output = self
            .git(&["log", "-1", "--pretty=format:%H|%s|%an|%aI"])
            .await?;
        if !output.success() || output.stdout.trim().is_empty() {
            return Ok(None);
        }
        let line = output.stdout.trim();
        let parts: Vec<&str> = line.splitn(4, '|').collect();
        if parts.len() != 4 {
            return Ok(None);
        }
        Ok(Some(CommitInfo {
            sha: parts[0].to_string(),
            summary: parts[1].to_string(),
            author: parts[2].to_string(),
            timestamp: parts[3].to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use tempfile::tempdir;

    async fn adapter(dir: &Path) -> (VcsAdapter, EventBus) {
        let bus = EventBus::default();
        (VcsAdapter::new(dir, bus.clone(), 1).unwrap(), bus)
    }

    #[tokio::test]
    async fn status_on_plain_directory_reports_not_a_repo() {
        let dir = tempdir().unwrap();
        let (vcs, _) = adapter(dir.path()).await;
        assert!(!vcs.is_repo().await.unwrap());
        let status = vcs.status().await.unwrap();
        assert!(!status.is_repo);
        assert!(!status.has_changes);
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let dir = tempdir().unwrap();
        let (vcs, _) = adapter(dir.path()).await;
        vcs.init().await.unwrap();
        assert!(vcs.is_repo().await.unwrap());
        vcs.init().await.unwrap();
    }

    #[tokio::test]
    async fn status_sees_untracked_files() {
        let dir = tempdir().unwrap();
        let (vcs, _) = adapter(dir.path()).await;
        vcs.init().await.unwrap();
        std::fs::write(dir.path().join("new.txt"), "fresh").unwrap();

        let status = vcs.status().await.unwrap();
        assert!(status.has_changes);
        assert_eq!(status.untracked, vec!["new.txt"]);
        assert!(status.staged.is_empty());
    }

    #[tokio::test]
    async fn commit_returns_sha_and_publishes_event() {
        let dir = tempdir().unwrap();
        let (vcs, bus) = adapter(dir.path()).await;
        vcs.init().await.unwrap();
        std::fs::write(dir.path().join("a.txt"), "one").unwrap();

        let sha = vcs
            .commit(&["a.txt".to_string()], "feat(task-1 v1): add a")
            .await
            .unwrap();
        assert_eq!(sha.len(), 40);

        let events = bus.history(
            &EventFilter {
                kind: Some(EventKind::VcsCommitted),
                ..EventFilter::default()
            },
            None,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["summary"], "feat(task-1 v1): add a");

        let last = vcs.last_commit().await.unwrap().unwrap();
        assert_eq!(last.sha, sha);
        assert_eq!(last.summary, "feat(task-1 v1): add a");
        assert_eq!(last.author, "foreman");
    }

    #[tokio::test]
    async fn commit_stages_exact_file_set() {
        let dir = tempdir().unwrap();
        let (vcs, _) = adapter(dir.path()).await;
        vcs.init().await.unwrap();
        std::fs::write(dir.path().join("wanted.txt"), "in").unwrap();
        std::fs::write(dir.path().join("unwanted.txt"), "out").unwrap();

        vcs.commit(&["wanted.txt".to_string()], "only wanted")
            .await
            .unwrap();

        let status = vcs.status().await.unwrap();
        assert_eq!(status.untracked, vec!["unwanted.txt"]);
    }

    #[tokio::test]
    async fn diff_shows_unstaged_changes() {
        let dir = tempdir().unwrap();
        let (vcs, _) = adapter(dir.path()).await;
        vcs.init().await.unwrap();
        std::fs::write(dir.path().join("f.txt"), "before\n").unwrap();
        vcs.commit(&[], "base").await.unwrap();

        std::fs::write(dir.path().join("f.txt"), "after\n").unwrap();
        let diff = vcs.diff(false).await.unwrap();
        assert!(diff.contains("-before"));
        assert!(diff.contains("+after"));
    }

    #[tokio::test]
    async fn commit_with_nothing_staged_fails_cleanly() {
        let dir = tempdir().unwrap();
        let (vcs, _) = adapter(dir.path()).await;
        vcs.init().await.unwrap();
        std::fs::write(dir.path().join("f.txt"), "x").unwrap();
        vcs.commit(&[], "base").await.unwrap();

        let err = vcs.commit(&[], "empty").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Storage(_)));
    }

    #[tokio::test]
    async fn last_commit_on_empty_repo_is_none() {
        let dir = tempdir().unwrap();
        let (vcs, _) = adapter(dir.path()).await;
        vcs.init().await.unwrap();
        assert!(vcs.last_commit().await.unwrap().is_none());
    }
}
