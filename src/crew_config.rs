//! Unified configuration system for crew.
//!
//! Settings are read from `.crew/crew.toml` and layered:
//! file → environment → CLI flags. Every field has a default, so an empty
//! or missing file yields a working configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-project"
//!
//! [worker]
//! cmd = "claude"
//! skip_permissions = true
//! task_timeout_secs = 600
//! simple_task_timeout_secs = 180
//!
//! [worker.models]
//! enabled = true
//! fast = "sonnet"
//! powerful = "opus"
//!
//! [worker.models.roles]
//! security = "powerful"
//!
//! [execution]
//! max_parallel = 2
//! cross_section_parallel = false
//! batching = false
//! batch_size = 3
//!
//! [retry]
//! max_retries = 3
//!
//! [session]
//! continuity = true
//! max_context_chars = 800000
//! reset_threshold = "80%"
//! max_tasks_per_session = 10
//!
//! [split]
//! enabled = true
//! threshold = 6
//!
//! [gates]
//! testing = false
//! security_review = true
//! qa = false
//!
//! [memory]
//! decisions_cap = 20
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::session::parse_context_limit;

/// Name of the configuration file inside `.crew/`.
pub const CONFIG_FILE: &str = "crew.toml";

/// Project-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project name (optional, defaults to directory name)
    #[serde(default)]
    pub name: Option<String>,
}

/// Model tier a role prefers when model routing is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    Powerful,
    /// Pick per task from its estimated complexity.
    Auto,
}

/// Model routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsSection {
    /// Route tasks to `fast` / `powerful` models (off: worker default model)
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fast_model")]
    pub fast: String,
    #[serde(default = "default_powerful_model")]
    pub powerful: String,
    /// Per-role tier overrides (e.g. `security = "powerful"`)
    #[serde(default)]
    pub roles: BTreeMap<String, ModelTier>,
}

fn default_fast_model() -> String {
    "sonnet".to_string()
}

fn default_powerful_model() -> String {
    "opus".to_string()
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            fast: default_fast_model(),
            powerful: default_powerful_model(),
            roles: BTreeMap::new(),
        }
    }
}

/// External worker invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Worker CLI command (default: "claude", env: CREW_WORKER_CMD)
    #[serde(default)]
    pub cmd: Option<String>,
    /// Whether to skip permission prompts in the worker CLI
    #[serde(default = "default_skip_permissions")]
    pub skip_permissions: bool,
    /// Time budget per dispatch
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Time budget for tasks classified as simple (only with model routing)
    #[serde(default = "default_simple_task_timeout_secs")]
    pub simple_task_timeout_secs: u64,
    #[serde(default)]
    pub models: ModelsSection,
}

fn default_skip_permissions() -> bool {
    true
}

fn default_task_timeout_secs() -> u64 {
    600
}

fn default_simple_task_timeout_secs() -> u64 {
    180
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            cmd: None,
            skip_permissions: default_skip_permissions(),
            task_timeout_secs: default_task_timeout_secs(),
            simple_task_timeout_secs: default_simple_task_timeout_secs(),
            models: ModelsSection::default(),
        }
    }
}

/// Concurrency and dispatch-shape settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Maximum concurrently in-flight dispatches project-wide (K)
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Treat sections as independent lanes
    #[serde(default)]
    pub cross_section_parallel: bool,
    /// Group consecutive same-role tasks into one dispatch
    #[serde(default)]
    pub batching: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_max_parallel() -> usize {
    2
}

fn default_batch_size() -> usize {
    3
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            cross_section_parallel: false,
            batching: false,
            batch_size: default_batch_size(),
        }
    }
}

/// Automatic retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Recoverable failures retried before escalating to a human
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Maximum length of the error summary carried into the next attempt
    #[serde(default = "default_error_summary_chars")]
    pub error_summary_chars: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_error_summary_chars() -> usize {
    300
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            error_summary_chars: default_error_summary_chars(),
        }
    }
}

/// Worker session continuity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Resume a role's previous session instead of starting fresh
    #[serde(default = "default_continuity")]
    pub continuity: bool,
    /// Context budget per session, in characters
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// Reset once consumption reaches this share of the budget ("80%") or
    /// an absolute character count ("500000")
    #[serde(default = "default_reset_threshold")]
    pub reset_threshold: String,
    #[serde(default = "default_max_tasks_per_session")]
    pub max_tasks_per_session: u32,
    /// Maximum number of changed files listed in a stale-context warning
    #[serde(default = "default_stale_file_cap")]
    pub stale_file_cap: usize,
    /// Conversion factor for reported token usage
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
}

fn default_continuity() -> bool {
    true
}

fn default_max_context_chars() -> usize {
    200_000 * 4
}

fn default_reset_threshold() -> String {
    "80%".to_string()
}

fn default_max_tasks_per_session() -> u32 {
    10
}

fn default_stale_file_cap() -> usize {
    20
}

fn default_chars_per_token() -> usize {
    4
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            continuity: default_continuity(),
            max_context_chars: default_max_context_chars(),
            reset_threshold: default_reset_threshold(),
            max_tasks_per_session: default_max_tasks_per_session(),
            stale_file_cap: default_stale_file_cap(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

/// Task splitting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitSection {
    #[serde(default = "default_split_enabled")]
    pub enabled: bool,
    /// Complexity score above which a task is split
    #[serde(default = "default_split_threshold")]
    pub threshold: u32,
    #[serde(default = "default_split_max_parts")]
    pub max_parts: usize,
}

fn default_split_enabled() -> bool {
    true
}

fn default_split_threshold() -> u32 {
    6
}

fn default_split_max_parts() -> usize {
    4
}

impl Default for SplitSection {
    fn default() -> Self {
        Self {
            enabled: default_split_enabled(),
            threshold: default_split_threshold(),
            max_parts: default_split_max_parts(),
        }
    }
}

/// Quality gate toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatesSection {
    #[serde(default)]
    pub testing: bool,
    #[serde(default = "default_security_review")]
    pub security_review: bool,
    #[serde(default)]
    pub qa: bool,
}

fn default_security_review() -> bool {
    true
}

impl Default for GatesSection {
    fn default() -> Self {
        Self {
            testing: false,
            security_review: default_security_review(),
            qa: false,
        }
    }
}

/// Role that receives remediation tasks for blocking gate findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationSection {
    #[serde(default = "default_remediation_role")]
    pub role: String,
}

fn default_remediation_role() -> String {
    "engineer".to_string()
}

impl Default for RemediationSection {
    fn default() -> Self {
        Self {
            role: default_remediation_role(),
        }
    }
}

/// Project memory bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_decisions_cap")]
    pub decisions_cap: usize,
    #[serde(default = "default_actions_cap")]
    pub actions_cap: usize,
    #[serde(default = "default_lessons_cap")]
    pub lessons_cap: usize,
    /// Recent decisions included in each dispatch
    #[serde(default = "default_context_decisions")]
    pub context_decisions: usize,
    /// Sibling uncompleted tasks included in each dispatch
    #[serde(default = "default_sibling_tasks")]
    pub sibling_tasks: usize,
}

fn default_decisions_cap() -> usize {
    20
}

fn default_actions_cap() -> usize {
    100
}

fn default_lessons_cap() -> usize {
    50
}

fn default_context_decisions() -> usize {
    5
}

fn default_sibling_tasks() -> usize {
    3
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            decisions_cap: default_decisions_cap(),
            actions_cap: default_actions_cap(),
            lessons_cap: default_lessons_cap(),
            context_decisions: default_context_decisions(),
            sibling_tasks: default_sibling_tasks(),
        }
    }
}

/// Root of `.crew/crew.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrewToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub split: SplitSection,
    #[serde(default)]
    pub gates: GatesSection,
    #[serde(default)]
    pub remediation: RemediationSection,
    #[serde(default)]
    pub memory: MemorySection,
}

impl CrewToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse crew.toml")
    }

    /// Load configuration from `<crew_dir>/crew.toml`.
    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(crew_dir: &Path) -> Result<Self> {
        let config_path = crew_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize crew.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides on top of the file settings.
    pub fn apply_env(&mut self) {
        if let Ok(cmd) = std::env::var("CREW_WORKER_CMD")
            && !cmd.trim().is_empty()
        {
            self.worker.cmd = Some(cmd);
        }
        if let Ok(val) = std::env::var("CREW_SKIP_PERMISSIONS") {
            self.worker.skip_permissions = val != "false";
        }
        if let Ok(val) = std::env::var("CREW_MAX_PARALLEL")
            && let Ok(k) = val.parse::<usize>()
        {
            self.execution.max_parallel = k;
        }
    }

    /// Worker command (file → default).
    pub fn worker_cmd(&self) -> String {
        self.worker
            .cmd
            .clone()
            .unwrap_or_else(|| "claude".to_string())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.task_timeout_secs)
    }

    pub fn simple_task_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.simple_task_timeout_secs)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.execution.max_parallel == 0 {
            warnings.push("execution.max_parallel is 0; at least 1 is required".to_string());
        }
        if self.execution.batching && self.execution.batch_size < 2 {
            warnings.push(format!(
                "execution.batch_size is {}; batching has no effect below 2",
                self.execution.batch_size
            ));
        }
        if let Err(e) = parse_context_limit(&self.session.reset_threshold) {
            warnings.push(format!(
                "Invalid session.reset_threshold '{}': {}",
                self.session.reset_threshold, e
            ));
        }
        if self.session.max_tasks_per_session == 0 {
            warnings.push("session.max_tasks_per_session is 0; every dispatch will start a fresh session".to_string());
        }
        if self.session.chars_per_token == 0 {
            warnings.push("session.chars_per_token must be at least 1".to_string());
        }
        if self.split.enabled && self.split.max_parts < 2 {
            warnings.push(format!(
                "split.max_parts is {}; splitting needs at least 2 parts",
                self.split.max_parts
            ));
        }
        if self.worker.task_timeout_secs == 0 {
            warnings.push("worker.task_timeout_secs is 0; every dispatch will time out".to_string());
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // =========================================
    // Defaults
    // =========================================

    #[test]
    fn test_empty_file_yields_defaults() {
        let cfg = CrewToml::parse("").unwrap();
        assert_eq!(cfg.execution.max_parallel, 2);
        assert!(!cfg.execution.cross_section_parallel);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.session.reset_threshold, "80%");
        assert_eq!(cfg.session.max_context_chars, 800_000);
        assert!(cfg.gates.security_review);
        assert!(!cfg.gates.testing);
        assert_eq!(cfg.remediation.role, "engineer");
        assert_eq!(cfg.worker_cmd(), "claude");
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let cfg = CrewToml::parse(
            r#"
[execution]
max_parallel = 4
batching = true

[gates]
qa = true
"#,
        )
        .unwrap();
        assert_eq!(cfg.execution.max_parallel, 4);
        assert!(cfg.execution.batching);
        assert_eq!(cfg.execution.batch_size, 3);
        assert!(cfg.gates.qa);
        assert!(cfg.gates.security_review);
    }

    #[test]
    fn test_model_role_overrides() {
        let cfg = CrewToml::parse(
            r#"
[worker.models]
enabled = true
fast = "haiku"

[worker.models.roles]
security = "powerful"
ui = "fast"
"#,
        )
        .unwrap();
        assert!(cfg.worker.models.enabled);
        assert_eq!(cfg.worker.models.fast, "haiku");
        assert_eq!(cfg.worker.models.powerful, "opus");
        assert_eq!(
            cfg.worker.models.roles.get("security"),
            Some(&ModelTier::Powerful)
        );
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let err = CrewToml::parse("[execution\nmax_parallel = 2").unwrap_err();
        assert!(err.to_string().contains("Failed to parse crew.toml"));
    }

    // =========================================
    // Validation
    // =========================================

    #[test]
    fn test_validate_flags_bad_values() {
        let mut cfg = CrewToml::default();
        cfg.execution.max_parallel = 0;
        cfg.session.reset_threshold = "eighty".into();
        cfg.split.max_parts = 1;
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("max_parallel")));
        assert!(warnings.iter().any(|w| w.contains("reset_threshold")));
        assert!(warnings.iter().any(|w| w.contains("max_parts")));
    }

    // =========================================
    // Persistence
    // =========================================

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let mut cfg = CrewToml::default();
        cfg.project.name = Some("demo".into());
        cfg.gates.qa = true;
        let path = dir.path().join(CONFIG_FILE);
        cfg.save(&path).unwrap();

        let loaded = CrewToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.project.name.as_deref(), Some("demo"));
        assert!(loaded.gates.qa);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let cfg = CrewToml::load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.execution.max_parallel, 2);
    }
}
