use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::crew_config::{CONFIG_FILE, CrewToml};

/// Directory holding crew's own files inside a project.
pub const CREW_DIR: &str = ".crew";

/// Runtime configuration for crew.
///
/// Bridges the file-backed `CrewToml` with the paths the orchestrator works
/// against. All project documents live at the project root; bookkeeping
/// lives under `.crew/`.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub crew_dir: PathBuf,
    pub todo_file: PathBuf,
    pub memory_file: PathBuf,
    pub spec_file: PathBuf,
    pub summary_file: PathBuf,
    pub state_file: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    /// Effective settings (file → environment → CLI)
    pub toml: CrewToml,
}

impl Config {
    /// Load configuration for a project directory, applying environment
    /// overrides on top of `.crew/crew.toml`.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let crew_dir = project_dir.join(CREW_DIR);
        let mut toml = CrewToml::load_or_default(&crew_dir)?;
        toml.apply_env();
        Ok(Self::from_parts(project_dir, toml))
    }

    /// Build a configuration from explicit settings without touching the
    /// environment.
    pub fn from_parts(project_dir: PathBuf, toml: CrewToml) -> Self {
        let crew_dir = project_dir.join(CREW_DIR);
        Self {
            todo_file: project_dir.join("TODO.md"),
            memory_file: project_dir.join("MEMORY.md"),
            spec_file: project_dir.join("SPEC.md"),
            summary_file: project_dir.join("SUMMARY.md"),
            state_file: crew_dir.join("state.json"),
            log_dir: crew_dir.join("logs"),
            crew_dir,
            project_dir,
            verbose: false,
            toml,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.crew_dir.join(CONFIG_FILE)
    }

    pub fn todo_lock_file(&self) -> PathBuf {
        self.crew_dir.join("todo.lock")
    }

    pub fn run_lock_file(&self) -> PathBuf {
        self.crew_dir.join("run.lock")
    }

    /// Project name from config, falling back to the directory name.
    pub fn project_name(&self) -> String {
        self.toml.project.name.clone().unwrap_or_else(|| {
            self.project_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string())
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.crew_dir.is_dir()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.crew_dir).context("Failed to create .crew directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Persist the effective settings back to `.crew/crew.toml`.
    pub fn save_toml(&self) -> Result<()> {
        std::fs::create_dir_all(&self.crew_dir).context("Failed to create .crew directory")?;
        self.toml.save(&self.config_file())
    }
}
