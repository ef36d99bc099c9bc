//! Context bundles: the prompt documents handed to an engine session.
//!
//! A bundle is an ordered list of titled sections rendered to markdown.
//! The rendered text is persisted as an artifact before the session starts,
//! so every run records exactly what the engine saw. This module also owns
//! file selection for coder bundles: architecture hints win, otherwise a
//! keyword match over a shallow repository listing picks the files most
//! likely to be touched.

use std::path::Path;

/// Ground rules prepended to every coder session.
pub const SAFETY_RULES: &str = "\
- Work only inside the project directory; never read or write outside it.\n\
- Do not run commands; the control plane executes gates itself.\n\
- Do not commit, tag, or push; version control is driven externally.\n\
- Prefer small, reviewable changes that satisfy the acceptance criteria.";

/// Directories never worth showing an engine.
const SKIP_DIRS: &[&str] = &["node_modules", "target", "dist", "build", "__pycache__"];

/// Listing depth, matching the two levels a reviewer skims first.
const LIST_DEPTH: usize = 2;

/// Caps keep the bundle bounded on large repositories.
const MAX_LISTED_FILES: usize = 200;
const MAX_SELECTED_FILES: usize = 20;

#[derive(Debug, Default)]
pub struct ContextBundle {
    sections: Vec<(String, String)>,
}

impl ContextBundle {
    pub fn new(instruction: &str) -> Self {
        Self {
            sections: vec![("Instructions".to_string(), instruction.to_string())],
        }
    }

    pub fn section(mut self, title: &str, body: &str) -> Self {
        self.sections.push((title.to_string(), body.to_string()));
        self
    }

    pub fn section_opt(self, title: &str, body: Option<&str>) -> Self {
        match body {
            Some(body) if !body.trim().is_empty() => self.section(title, body),
            _ => self,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (title, body) in &self.sections {
            out.push_str("## ");
            out.push_str(title);
            out.push_str("\n\n");
            out.push_str(body.trim_end());
            out.push_str("\n\n");
        }
        out
    }
}

// ── File selection ────────────────────────────────────────────────────

/// Files to surface in a coder bundle. Architecture hints are taken
/// verbatim when present; otherwise the repository listing is ranked by
/// token overlap with the task text, falling back to the plain listing
/// when nothing matches.
pub fn select_files(root: &Path, hints: &[String], task_text: &str) -> Vec<String> {
    if !hints.is_empty() {
        return hints.iter().take(MAX_SELECTED_FILES).cloned().collect();
    }

    let files = list_project_files(root, LIST_DEPTH);
    let tokens = keywords(task_text);
    let mut scored: Vec<(usize, &String)> = files
        .iter()
        .filter_map(|file| {
            let score = file_score(file, &tokens);
            (score > 0).then_some((score, file))
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    let selected: Vec<String> = scored
        .into_iter()
        .take(MAX_SELECTED_FILES)
        .map(|(_, file)| file.clone())
        .collect();
    if selected.is_empty() {
        files.into_iter().take(MAX_SELECTED_FILES).collect()
    } else {
        selected
    }
}

/// Shallow, sorted listing of repository files relative to the root.
/// Hidden entries and dependency/build trees are skipped; the result is
/// capped so huge checkouts stay readable.
pub fn list_project_files(root: &Path, depth: usize) -> Vec<String> {
    let mut files = Vec::new();
    walk(root, root, depth, &mut files);
    files.sort();
    files.truncate(MAX_LISTED_FILES);
    files
}

fn walk(root: &Path, dir: &Path, depth_left: usize, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || SKIP_DIRS.contains(&name.as_str()) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            if depth_left > 1 {
                walk(root, &path, depth_left - 1, out);
            }
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"));
        }
    }
}

/// Lowercased alphanumeric tokens worth matching against paths. Short
/// words carry no signal and are dropped.
fn keywords(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() >= 3)
        .map(|token| token.to_lowercase())
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

fn file_score(file: &str, tokens: &[String]) -> usize {
    let lowered = file.to_lowercase();
    tokens
        .iter()
        .filter(|token| lowered.contains(token.as_str()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_sections_in_order() {
        let bundle = ContextBundle::new("Do the thing.")
            .section("Specification", "build an adder")
            .section("Task", "add(a, b)");
        let text = bundle.render();

        let instructions = text.find("## Instructions").unwrap();
        let spec = text.find("## Specification").unwrap();
        let task = text.find("## Task").unwrap();
        assert!(instructions < spec && spec < task);
        assert!(text.contains("build an adder"));
    }

    #[test]
    fn optional_sections_skip_empty_bodies() {
        let bundle = ContextBundle::new("x")
            .section_opt("Present", Some("body"))
            .section_opt("Absent", None)
            .section_opt("Blank", Some("   "));
        let text = bundle.render();
        assert!(text.contains("## Present"));
        assert!(!text.contains("## Absent"));
        assert!(!text.contains("## Blank"));
    }

    fn seed_repo(dir: &Path) {
        std::fs::create_dir_all(dir.join("src/auth")).unwrap();
        std::fs::create_dir_all(dir.join("tests")).unwrap();
        std::fs::create_dir_all(dir.join("node_modules/lodash")).unwrap();
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        std::fs::write(dir.join("src/login.rs"), "").unwrap();
        std::fs::write(dir.join("src/auth/session.rs"), "").unwrap();
        std::fs::write(dir.join("src/auth/token.rs"), "").unwrap();
        std::fs::write(dir.join("tests/login_test.rs"), "").unwrap();
        std::fs::write(dir.join("node_modules/lodash/index.js"), "").unwrap();
        std::fs::write(dir.join(".git/config"), "").unwrap();
        std::fs::write(dir.join("README.md"), "").unwrap();
    }

    #[test]
    fn listing_skips_vcs_and_dependency_trees() {
        let dir = tempfile::tempdir().unwrap();
        seed_repo(dir.path());

        let files = list_project_files(dir.path(), 3);
        assert!(files.contains(&"src/login.rs".to_string()));
        assert!(files.contains(&"src/auth/session.rs".to_string()));
        assert!(!files.iter().any(|f| f.contains("node_modules")));
        assert!(!files.iter().any(|f| f.contains(".git")));
    }

    #[test]
    fn listing_honors_depth_cap() {
        let dir = tempfile::tempdir().unwrap();
        seed_repo(dir.path());

        let files = list_project_files(dir.path(), 2);
        assert!(files.contains(&"src/login.rs".to_string()));
        // src/auth/* sits at depth 3.
        assert!(!files.iter().any(|f| f.starts_with("src/auth/")));
    }

    #[test]
    fn architecture_hints_win_over_the_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        seed_repo(dir.path());

        let hints = vec!["src/auth/session.rs".to_string()];
        let selected = select_files(dir.path(), &hints, "anything at all");
        assert_eq!(selected, hints);
    }

    #[test]
    fn heuristic_ranks_files_matching_task_keywords() {
        let dir = tempfile::tempdir().unwrap();
        seed_repo(dir.path());

        let selected = select_files(dir.path(), &[], "Fix the login flow");
        assert!(selected.contains(&"src/login.rs".to_string()));
        assert!(selected.contains(&"tests/login_test.rs".to_string()));
        assert!(!selected.contains(&"README.md".to_string()));
    }

    #[test]
    fn heuristic_falls_back_to_the_listing_when_nothing_matches() {
        let dir = tempfile::tempdir().unwrap();
        seed_repo(dir.path());

        let selected = select_files(dir.path(), &[], "zzz qqq xyzzy");
        assert!(!selected.is_empty());
        assert!(selected.contains(&"README.md".to_string()));
    }

    #[test]
    fn keywords_drop_short_and_duplicate_tokens() {
        let tokens = keywords("Fix the login, fix IT: login!");
        assert_eq!(tokens, vec!["fix", "login", "the"]);
    }
}
