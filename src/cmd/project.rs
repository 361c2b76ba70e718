//! Project setup and the helpers other commands use to open a project.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crew::config::Config;
use crew::orchestrator::Orchestrator;
use crew::util::FileLock;
use crew::worker::{ClaudeWorker, ClaudeWorkerConfig};
use crew::workflow::ReportGate;

pub fn cmd_init(project_dir: &Path, name: Option<&str>) -> Result<()> {
    use crew::init::{init_project, is_initialized};

    let was_initialized = is_initialized(project_dir);
    let result = init_project(project_dir, name)?;

    if !was_initialized {
        println!("Initialized crew project at {}", project_dir.display());
        println!();
        println!("Created:");
        for path in &result.created {
            let shown = path.strip_prefix(project_dir).unwrap_or(path);
            println!("  {}", shown.display());
        }
        println!();
        println!("Next steps:");
        println!("  1. Run `crew plan \"<what to build>\"` to have the manager write SPEC.md and TODO.md,");
        println!("     or add tasks to TODO.md yourself: `- [ ] @engineer Build the users endpoint`");
        println!("  2. Run `crew run` to start work");
    } else if result.unchanged() {
        println!(
            "Crew project already initialized at {}",
            result.crew_dir.display()
        );
    } else {
        println!("Completed crew initialization:");
        for path in &result.created {
            let shown = path.strip_prefix(project_dir).unwrap_or(path);
            println!("  {}", shown.display());
        }
    }
    Ok(())
}

/// Load the configuration of an initialized project.
pub fn load_config(project_dir: &Path) -> Result<Config> {
    if !crew::init::is_initialized(project_dir) {
        anyhow::bail!("Project not initialized. Run 'crew init' first.");
    }
    Config::load(project_dir)
}

/// Build an orchestrator wired to the Claude CLI worker and the report
/// gate.
pub fn open_orchestrator(config: Config) -> Result<Orchestrator> {
    let worker = Arc::new(ClaudeWorker::new(ClaudeWorkerConfig::from_config(&config)));
    let gate = Arc::new(ReportGate::new());
    Ok(Orchestrator::new(config, worker, gate)?)
}

/// Whether another process is running work on the project.
pub fn run_active(config: &Config) -> Result<bool> {
    let lock = FileLock::try_acquire(&config.run_lock_file())
        .with_context(|| format!("Failed to check {}", config.run_lock_file().display()))?;
    Ok(lock.is_none())
}

/// Open an idle project for a control command. The returned lock keeps a
/// run from starting until the control is applied.
pub fn open_idle(project_dir: &Path) -> Result<(Orchestrator, FileLock)> {
    let config = load_config(project_dir)?;
    let lock_path = config.run_lock_file();
    let lock = FileLock::try_acquire(&lock_path)
        .with_context(|| format!("Failed to check {}", lock_path.display()))?;
    let Some(lock) = lock else {
        anyhow::bail!(
            "A run is active for this project. Answer its prompts, or stop it with Ctrl-C first."
        );
    };
    Ok((open_orchestrator(config)?, lock))
}
