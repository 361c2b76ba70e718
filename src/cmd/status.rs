//! Read-only views — `crew status` and `crew tasks`.

use anyhow::Result;
use console::style;
use std::path::Path;

use super::project::{load_config, open_orchestrator, run_active};

pub async fn cmd_status(project_dir: &Path) -> Result<()> {
    use crew::ui::render_escalation;

    let config = load_config(project_dir)?;
    let active = run_active(&config)?;
    let orchestrator = open_orchestrator(config)?;
    let snapshot = orchestrator.snapshot().await?;
    let counts = snapshot.counts;

    println!();
    println!("{}", style(format!("Project: {}", snapshot.project)).bold());
    println!(
        "Status:  {} (cycle {}){}",
        style(snapshot.status.title()).cyan(),
        snapshot.cycle,
        if active {
            style(" - running").green().to_string()
        } else {
            String::new()
        }
    );
    if let Some(section) = &snapshot.active_section {
        println!("Gate:    {}", section);
    }
    println!(
        "Tasks:   {} done, {} open ({} total)",
        counts.done,
        counts.open,
        counts.total - counts.split
    );
    println!(
        "Gates:   testing {}, security review {}, qa {}",
        on_off(snapshot.gates.testing),
        on_off(snapshot.gates.security_review),
        on_off(snapshot.gates.qa)
    );

    if !snapshot.escalations.is_empty() {
        println!();
        println!("{}", style("Pending escalations:").red().bold());
        for escalation in &snapshot.escalations {
            println!("  {}", render_escalation(escalation).replace('\n', "\n  "));
        }
        println!();
        println!("Resolve with `crew resolve <id> <retry|skip|modify|remove|stop>`.");
    }
    println!();
    Ok(())
}

fn on_off(enabled: bool) -> String {
    if enabled {
        style("on").green().to_string()
    } else {
        style("off").dim().to_string()
    }
}

pub fn cmd_tasks(project_dir: &Path) -> Result<()> {
    use crew::tasks::TaskStore;
    use crew::tasks::types::TaskState;

    let config = load_config(project_dir)?;
    let store = TaskStore::new(config.todo_file.clone(), config.todo_lock_file());
    let list = store.load()?;

    if list.counts().total == 0 {
        println!("No tasks in {}", config.todo_file.display());
        return Ok(());
    }

    for section in &list.sections {
        println!();
        println!("{}", style(&section.name).bold());
        for task in &section.tasks {
            let mark = match task.state {
                TaskState::Done => style("[x]").green(),
                TaskState::Split => style("[-]").dim(),
                TaskState::Open => style("[ ]").yellow(),
            };
            println!(
                "  {} {} {} {}",
                mark,
                task.id,
                style(format!("@{}", task.role)).cyan(),
                task.description
            );
            if task.retries > 0 || task.last_error.is_some() {
                println!(
                    "        {}",
                    style(format!(
                        "retries: {}{}",
                        task.retries,
                        task.last_error
                            .as_deref()
                            .map(|e| format!(", last error: {}", e))
                            .unwrap_or_default()
                    ))
                    .dim()
                );
            }
        }
    }
    println!();
    Ok(())
}
