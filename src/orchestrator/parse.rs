//! Structured parsing of opaque engine output.
//!
//! Engines emit free text with (hopefully) a JSON object somewhere inside.
//! The extractor scans for the largest balanced object, tolerating leading
//! and trailing chatter, and never panics on malformed input. The result is
//! a tagged union: plan, architecture, or freeform text.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, WorkflowError};
use crate::gates::GateSpec;
use crate::store::models::TaskSpec;

// ── Payload schemas ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMetadata {
    #[serde(default)]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTaskEntry {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// 0-based indices into `tasks`; resolved to ids at creation time.
    #[serde(default)]
    pub dependencies: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPayload {
    #[serde(default)]
    pub metadata: PlanMetadata,
    pub tasks: Vec<PlanTaskEntry>,
}

impl PlanPayload {
    pub fn to_task_specs(&self) -> Vec<TaskSpec> {
        self.tasks
            .iter()
            .map(|entry| TaskSpec {
                title: entry.title.clone(),
                description: entry.description.clone(),
                priority: entry.priority.unwrap_or(0),
                acceptance_criteria: entry.acceptance_criteria.clone(),
                depends_on: entry.dependencies.clone(),
                gates: Vec::new(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchOption {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pros: Vec<String>,
    #[serde(default)]
    pub cons: Vec<String>,
    #[serde(default)]
    pub trade_offs: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdrDoc {
    pub name: String,
    pub markdown: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRefinement {
    pub task_id: i64,
    #[serde(default)]
    pub deps: Vec<i64>,
    #[serde(default)]
    pub gates: Vec<GateSpec>,
    #[serde(default)]
    pub priority: Option<i64>,
    /// Files the architect expects this task to touch; surfaced to the
    /// coder bundle as selection hints.
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitecturePayload {
    #[serde(default)]
    pub options: Vec<ArchOption>,
    #[serde(default)]
    pub adrs: Vec<AdrDoc>,
    #[serde(default)]
    pub task_refinements: Vec<TaskRefinement>,
}

/// What an engine actually said, as far as we can tell.
#[derive(Debug, Clone)]
pub enum ParsedEngineOutput {
    Plan(PlanPayload),
    Architecture(ArchitecturePayload),
    Freeform(String),
}

impl ParsedEngineOutput {
    pub fn parse(text: &str) -> Self {
        let Some(json) = extract_largest_json(text) else {
            return Self::Freeform(text.to_string());
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(json) else {
            return Self::Freeform(text.to_string());
        };
        if value.get("tasks").is_some_and(|t| t.is_array()) {
            if let Ok(plan) = serde_json::from_value::<PlanPayload>(value.clone()) {
                return Self::Plan(plan);
            }
        }
        if value.get("options").is_some() || value.get("adrs").is_some() {
            if let Ok(arch) = serde_json::from_value::<ArchitecturePayload>(value) {
                return Self::Architecture(arch);
            }
        }
        Self::Freeform(text.to_string())
    }
}

pub fn parse_plan(text: &str) -> Result<PlanPayload> {
    match ParsedEngineOutput::parse(text) {
        ParsedEngineOutput::Plan(plan) if !plan.tasks.is_empty() => Ok(plan),
        ParsedEngineOutput::Plan(_) => Err(WorkflowError::Parse(
            "plan contained no tasks".to_string(),
        )),
        _ => Err(WorkflowError::Parse(
            "no plan object found in engine output".to_string(),
        )),
    }
}

pub fn parse_architecture(text: &str) -> Result<ArchitecturePayload> {
    match ParsedEngineOutput::parse(text) {
        ParsedEngineOutput::Architecture(arch) if !arch.options.is_empty() => Ok(arch),
        ParsedEngineOutput::Architecture(_) => Err(WorkflowError::Parse(
            "architecture contained no options".to_string(),
        )),
        _ => Err(WorkflowError::Parse(
            "no architecture object found in engine output".to_string(),
        )),
    }
}

// ── Balanced-object extraction ────────────────────────────────────────

/// Largest balanced `{...}` block in `text`, honoring JSON string and
/// escape rules so braces inside strings don't count.
pub fn extract_largest_json(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = scan_balanced(bytes, i) {
                if best.is_none_or(|(s, e)| end - i > e - s) {
                    best = Some((i, end));
                }
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    best.map(|(start, end)| &text[start..=end])
}

fn scan_balanced(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (index, &byte) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_object_surrounded_by_chatter() {
        let text = "Sure! Here is the plan:\n{\"tasks\": []}\nLet me know.";
        assert_eq!(extract_largest_json(text), Some("{\"tasks\": []}"));
    }

    #[test]
    fn picks_the_largest_of_several_objects() {
        let text = "{\"a\": 1} and then {\"b\": {\"nested\": true}, \"c\": 2}";
        assert_eq!(
            extract_largest_json(text),
            Some("{\"b\": {\"nested\": true}, \"c\": 2}")
        );
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let text = r#"{"note": "a } inside", "x": 1}"#;
        assert_eq!(extract_largest_json(text), Some(text));
    }

    #[test]
    fn escaped_quotes_inside_strings_are_handled() {
        let text = r#"{"note": "she said \"}\"", "ok": true}"#;
        assert_eq!(extract_largest_json(text), Some(text));
    }

    #[test]
    fn unbalanced_text_yields_none() {
        assert_eq!(extract_largest_json("no json here"), None);
        assert_eq!(extract_largest_json("{\"open\": "), None);
    }

    #[test]
    fn parse_plan_happy_path() {
        let text = r#"Here you go:
{
  "metadata": {"generated_at": "2026-08-01T00:00:00Z", "engine": "copilot-cli"},
  "tasks": [
    {"title": "Add add(a,b)", "description": "Sum two ints", "priority": 5},
    {"title": "Unit test add", "dependencies": [0], "acceptance_criteria": ["test passes"]}
  ]
}
Done!"#;
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.metadata.engine.as_deref(), Some("copilot-cli"));
        assert_eq!(plan.tasks[1].dependencies, vec![0]);

        let specs = plan.to_task_specs();
        assert_eq!(specs[0].priority, 5);
        assert_eq!(specs[1].acceptance_criteria, vec!["test passes"]);
    }

    #[test]
    fn parse_plan_without_json_is_a_parse_error() {
        let err = parse_plan("I could not produce a plan, sorry.").unwrap_err();
        assert!(matches!(err, WorkflowError::Parse(_)));
    }

    #[test]
    fn parse_plan_with_empty_tasks_is_a_parse_error() {
        let err = parse_plan(r#"{"tasks": []}"#).unwrap_err();
        assert!(matches!(err, WorkflowError::Parse(_)));
    }

    #[test]
    fn parse_architecture_happy_path() {
        let text = r##"{
  "options": [
    {"id": "opt-1", "name": "Monolith", "pros": ["simple"], "cons": ["scaling"], "trade_offs": "fast now"},
    {"id": "opt-2", "name": "Services", "description": "split by domain"}
  ],
  "adrs": [{"name": "001-storage", "markdown": "# Use SQLite"}],
  "task_refinements": [{"task_id": 3, "deps": [1], "priority": 8, "files": ["src/store.rs"]}]
}"##;
        let arch = parse_architecture(text).unwrap();
        assert_eq!(arch.options.len(), 2);
        assert_eq!(arch.adrs[0].name, "001-storage");
        assert_eq!(arch.task_refinements[0].task_id, 3);
        assert_eq!(arch.task_refinements[0].priority, Some(8));
        assert_eq!(arch.task_refinements[0].files, vec!["src/store.rs"]);
    }

    #[test]
    fn tagged_union_discriminates_plan_vs_architecture() {
        match ParsedEngineOutput::parse(r#"{"tasks": [{"title": "t"}]}"#) {
            ParsedEngineOutput::Plan(_) => {}
            other => panic!("expected plan, got {other:?}"),
        }
        match ParsedEngineOutput::parse(r#"{"options": [], "adrs": []}"#) {
            ParsedEngineOutput::Architecture(_) => {}
            other => panic!("expected architecture, got {other:?}"),
        }
        match ParsedEngineOutput::parse("just words") {
            ParsedEngineOutput::Freeform(text) => assert_eq!(text, "just words"),
            other => panic!("expected freeform, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_degrades_to_freeform() {
        match ParsedEngineOutput::parse("{\"tasks\": [}, broken") {
            ParsedEngineOutput::Freeform(_) => {}
            other => panic!("expected freeform, got {other:?}"),
        }
    }
}
