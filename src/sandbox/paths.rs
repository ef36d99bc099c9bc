//! Path allow/deny resolution with traversal rejection.
//!
//! Resolution order: lexical normalization (a `..` that escapes the project
//! root is rejected before the filesystem is touched), symlink
//! canonicalization, containment check against the canonical root, then the
//! glob allowlist with the blocklist overriding.

use std::path::{Component, Path, PathBuf};

use glob::Pattern;

use crate::errors::{Result, WorkflowError};

#[derive(Debug)]
pub struct PathResolver {
    root: PathBuf,
    allow: Vec<Pattern>,
    deny: Vec<Pattern>,
}

impl PathResolver {
    pub fn new(root: &Path, allowed: &[String], blocked: &[String]) -> Result<Self> {
        let root = std::fs::canonicalize(root).map_err(|e| {
            WorkflowError::Storage(format!("project root {}: {e}", root.display()))
        })?;
        Ok(Self {
            root,
            allow: compile_patterns(allowed)?,
            deny: compile_patterns(blocked)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `requested` (relative to the project root, or absolute) into
    /// a canonical path guaranteed to live inside the root and match the
    /// allowlist.
    pub fn resolve(&self, requested: &Path) -> Result<PathBuf> {
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        // Lexical pass: no filesystem access, so a `..` escape is caught
        // even when the target does not exist.
        let normalized = lexical_normalize(&joined)?;
        if !normalized.starts_with(&self.root) {
            return Err(self.escape(requested));
        }

        // Symlink pass: canonicalize the deepest existing prefix so a link
        // pointing outside the root cannot smuggle the path out.
        let resolved = canonicalize_existing_prefix(&normalized)?;
        if !resolved.starts_with(&self.root) {
            return Err(self.escape(requested));
        }

        let rel = resolved
            .strip_prefix(&self.root)
            .expect("containment checked above");
        let rel_str = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");

        if self.deny.iter().any(|p| pattern_matches(p, &rel_str)) {
            return Err(WorkflowError::Forbidden(format!(
                "path {} is blocked",
                requested.display()
            )));
        }

        // The root itself is always reachable; it is the cwd of every run.
        if !rel_str.is_empty() && !self.allow.iter().any(|p| pattern_matches(p, &rel_str)) {
            return Err(WorkflowError::Forbidden(format!(
                "path {} does not match any allowed pattern",
                requested.display()
            )));
        }

        Ok(resolved)
    }

    pub fn is_safe(&self, requested: &Path) -> bool {
        self.resolve(requested).is_ok()
    }

    fn escape(&self, requested: &Path) -> WorkflowError {
        WorkflowError::Forbidden(format!(
            "path {} escapes project root {}",
            requested.display(),
            self.root.display()
        ))
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| WorkflowError::Validation(format!("bad glob pattern {p:?}: {e}")))
        })
        .collect()
}

/// `dir/**` also covers `dir` itself, matching how allowlists are written.
fn pattern_matches(pattern: &Pattern, rel: &str) -> bool {
    if pattern.matches(rel) {
        return true;
    }
    let raw = pattern.as_str();
    if let Some(dir) = raw.strip_suffix("/**") {
        return rel == dir || rel.starts_with(&format!("{dir}/"));
    }
    false
}

fn lexical_normalize(path: &Path) -> Result<PathBuf> {
    let mut stack: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match stack.last() {
                Some(Component::Normal(_)) => {
                    stack.pop();
                }
                _ => {
                    return Err(WorkflowError::Forbidden(format!(
                        "path {} traverses above the filesystem root",
                        path.display()
                    )));
                }
            },
            other => stack.push(other),
        }
    }
    Ok(stack.iter().collect())
}

/// Canonicalize the deepest existing ancestor and re-append the missing
/// remainder, so paths that do not exist yet still get symlinks in their
/// parents resolved.
fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(std::fs::canonicalize(path)?);
    }
    let mut missing: Vec<std::ffi::OsString> = Vec::new();
    let mut cursor = path.to_path_buf();
    loop {
        if cursor.exists() {
            let mut resolved = std::fs::canonicalize(&cursor)?;
            for part in missing.iter().rev() {
                resolved.push(part);
            }
            return Ok(resolved);
        }
        match (cursor.file_name(), cursor.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name.to_os_string());
                cursor = parent.to_path_buf();
            }
            _ => return Ok(path.to_path_buf()),
        }
    }
}
