//! Per-project configuration, loaded from `foreman.toml` at the project root.
//!
//! Every section is optional; missing keys fall back to safe defaults. The
//! sandbox sections feed the path resolver and command runner, the gates
//! section sets gate-runner policy, and the database section selects the
//! persistence backend.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, WorkflowError};

pub const CONFIG_FILE: &str = "foreman.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
    pub project_name: Option<String>,
    pub default_engine: Option<String>,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub gates: GateSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Glob patterns of paths the sandbox may touch, relative to project root.
    #[serde(default = "default_allowed_paths")]
    pub allowed_paths: Vec<String>,
    /// Glob patterns that override the allowlist.
    #[serde(default)]
    pub blocked_paths: Vec<String>,
    /// Command basenames permitted to run. `None` means blocklist-only mode.
    #[serde(default)]
    pub allowed_commands: Option<Vec<String>>,
    /// Additional command basenames to block beyond the built-in set.
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    /// Default timeout for sandboxed commands, in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

fn default_allowed_paths() -> Vec<String> {
    vec!["**/*".to_string()]
}

fn default_command_timeout() -> u64 {
    300
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            allowed_paths: default_allowed_paths(),
            blocked_paths: Vec::new(),
            allowed_commands: None,
            blocked_commands: Vec::new(),
            command_timeout: default_command_timeout(),
        }
    }
}

impl SandboxSettings {
    pub fn allowed_command_set(&self) -> Option<HashSet<String>> {
        self.allowed_commands
            .as_ref()
            .map(|cmds| cmds.iter().cloned().collect())
    }

    pub fn blocked_command_set(&self) -> HashSet<String> {
        self.blocked_commands.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default per-gate timeout in seconds, used when a gate spec omits one.
    #[serde(default = "default_gate_timeout")]
    pub timeout: u64,
    /// Short-circuit policy: stop running gates after the first failure.
    #[serde(default)]
    pub fail_on_error: bool,
}

fn default_true() -> bool {
    true
}

fn default_gate_timeout() -> u64 {
    60
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: default_gate_timeout(),
            fail_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseKind {
    #[default]
    EmbeddedSqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseSettings {
    #[serde(rename = "type", default)]
    pub kind: DatabaseKind,
    /// Directory for embedded store files. Defaults to the workspace data dir.
    pub path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl DatabaseSettings {
    /// The embedded per-project SQLite file is the only backend this build
    /// ships. The postgres variant parses so existing configs stay readable,
    /// but store construction refuses it up front.
    pub fn ensure_supported(&self) -> Result<()> {
        match self.kind {
            DatabaseKind::EmbeddedSqlite => Ok(()),
            DatabaseKind::Postgres => Err(WorkflowError::Validation(
                "database.type = \"postgres\" is not available in this build".to_string(),
            )),
        }
    }
}

impl ProjectConfig {
    /// Load configuration from `foreman.toml` under the project root.
    /// Returns defaults when the file does not exist.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = project_root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        toml::from_str(&content).map_err(|e| {
            WorkflowError::Validation(format!("failed to parse {}: {e}", path.display()))
        })
    }

    pub fn save(&self, project_root: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| WorkflowError::Internal(format!("failed to serialize config: {e}")))?;
        std::fs::write(project_root.join(CONFIG_FILE), content)?;
        Ok(())
    }

    pub fn engine_name(&self) -> &str {
        self.default_engine.as_deref().unwrap_or("null")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.sandbox.allowed_paths, vec!["**/*"]);
        assert_eq!(config.sandbox.command_timeout, 300);
        assert!(config.gates.enabled);
        assert!(!config.gates.fail_on_error);
        assert_eq!(config.database.kind, DatabaseKind::EmbeddedSqlite);
        assert_eq!(config.engine_name(), "null");
    }

    #[test]
    fn load_full_config() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
project_name = "demo"
default_engine = "copilot-cli"

[sandbox]
allowed_paths = ["src/**", "tests/**"]
blocked_paths = ["src/secrets/**"]
allowed_commands = ["cargo", "git", "pytest"]
blocked_commands = ["curl"]
command_timeout = 120

[gates]
enabled = true
timeout = 30
fail_on_error = true

[database]
type = "embedded-sqlite"
"#,
        )
        .unwrap();

        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.project_name.as_deref(), Some("demo"));
        assert_eq!(config.engine_name(), "copilot-cli");
        assert_eq!(config.sandbox.allowed_paths.len(), 2);
        assert_eq!(config.sandbox.blocked_paths, vec!["src/secrets/**"]);
        assert_eq!(config.sandbox.command_timeout, 120);
        assert!(config.sandbox.allowed_command_set().unwrap().contains("git"));
        assert_eq!(config.gates.timeout, 30);
        assert!(config.gates.fail_on_error);
    }

    #[test]
    fn postgres_parses_but_is_rejected_by_support_check() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
[database]
type = "postgres"
host = "localhost"
port = 5432
database = "foreman"
username = "fm"
password = "secret"
"#,
        )
        .unwrap();

        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.database.kind, DatabaseKind::Postgres);
        assert_eq!(config.database.host.as_deref(), Some("localhost"));
        let err = config.database.ensure_supported().unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[test]
    fn invalid_toml_is_a_validation_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "not valid toml {{{{").unwrap();
        let err = ProjectConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[test]
    fn save_round_trips() {
        let dir = tempdir().unwrap();
        let mut config = ProjectConfig::default();
        config.project_name = Some("saved".to_string());
        config.sandbox.allowed_commands = Some(vec!["cargo".to_string()]);
        config.save(dir.path()).unwrap();

        let loaded = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.project_name.as_deref(), Some("saved"));
        assert_eq!(
            loaded.sandbox.allowed_commands,
            Some(vec!["cargo".to_string()])
        );
    }
}
