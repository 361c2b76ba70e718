//! `crew init`: lay out a project for the orchestrator.
//!
//! ```text
//! project/
//! ├── TODO.md          # Task list (sections, roles, checkboxes)
//! ├── MEMORY.md        # Decisions, actions and lessons
//! └── .crew/
//!     ├── crew.toml    # Settings
//!     └── logs/        # crew.log and per-dispatch worker logs
//! ```
//!
//! Existing files are never overwritten, so running init again only fills
//! in what is missing.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::crew_config::CrewToml;
use crate::memory::MemoryLog;
use crate::tasks::types::{DEFAULT_SECTION, Section};
use crate::tasks::{TaskList, serialize};
use crate::util::write_atomic;

/// Result of initializing a project.
#[derive(Debug)]
pub struct InitResult {
    pub crew_dir: PathBuf,
    /// Files and directories created by this call, in creation order.
    pub created: Vec<PathBuf>,
}

impl InitResult {
    /// Whether the project was already fully initialized.
    pub fn unchanged(&self) -> bool {
        self.created.is_empty()
    }
}

fn create_dir(path: &Path, created: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    created.push(path.to_path_buf());
    Ok(())
}

fn create_file(path: &Path, contents: &str, created: &mut Vec<PathBuf>) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    write_atomic(path, contents)
        .with_context(|| format!("Failed to create file: {}", path.display()))?;
    created.push(path.to_path_buf());
    Ok(())
}

fn todo_template(project: &str) -> String {
    let mut list = TaskList::new();
    list.title = Some(format!("{} - TODO", project));
    list.sections.push(Section::new(DEFAULT_SECTION));
    serialize(&list)
}

/// Initialize a crew project in `project_dir`.
pub fn init_project(project_dir: &Path, name: Option<&str>) -> Result<InitResult> {
    let mut toml = CrewToml::default();
    toml.project.name = name.map(str::to_string);
    let config = Config::from_parts(project_dir.to_path_buf(), toml);
    let mut created = Vec::new();

    create_dir(&config.crew_dir, &mut created)?;
    create_dir(&config.log_dir, &mut created)?;

    let config_file = config.config_file();
    if !config_file.exists() {
        config
            .toml
            .save(&config_file)
            .with_context(|| format!("Failed to create {}", config_file.display()))?;
        created.push(config_file);
    }

    create_file(
        &config.todo_file,
        &todo_template(&config.project_name()),
        &mut created,
    )?;
    create_file(
        &config.memory_file,
        &MemoryLog::default().render(),
        &mut created,
    )?;

    tracing::info!(
        project = %config.project_name(),
        created = created.len(),
        "project initialized"
    );
    Ok(InitResult {
        crew_dir: config.crew_dir,
        created,
    })
}

pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(crate::config::CREW_DIR).is_dir()
}
