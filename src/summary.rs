//! Completion report written to `SUMMARY.md` when a project reaches done.

use anyhow::{Context, Result};
use chrono::Local;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::Config;
use crate::memory::MemoryLog;
use crate::tasks::TaskList;
use crate::util::write_atomic;
use crate::workflow::WorkflowState;

/// Files listed in the report at most.
const FILE_LIST_CAP: usize = 50;

const IGNORED_DIRS: &[&str] = &["node_modules", "__pycache__", "venv", "target", "dist", "build"];

fn project_files(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || e.file_name()
                    .to_str()
                    .is_some_and(|n| !n.starts_with('.') && !IGNORED_DIRS.contains(&n))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.display().to_string())
        })
        .take(FILE_LIST_CAP + 1)
        .collect()
}

/// Render the report.
pub fn render(
    project: &str,
    list: &TaskList,
    memory: &MemoryLog,
    workflow: &WorkflowState,
    files: &[String],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Project Summary: {}\n", project);
    let _ = writeln!(out, "Generated: {}\n", Local::now().format("%Y-%m-%d %H:%M"));

    out.push_str("## What Was Built\n\n");
    let counts = list.counts();
    let _ = writeln!(
        out,
        "{} of {} tasks complete across {} sections, {} cycle(s), {} acceptance round(s).\n",
        counts.done,
        counts.total - counts.split,
        list.sections.len(),
        workflow.cycle,
        workflow.acceptance_rounds
    );
    for section in &list.sections {
        let done = section.tasks.iter().filter(|t| t.is_done()).count();
        let open = section.tasks.iter().filter(|t| t.is_open()).count();
        let _ = writeln!(out, "### {} ({} done, {} open)\n", section.name, done, open);
        for task in section.tasks.iter().filter(|t| t.is_done()) {
            let _ = writeln!(out, "- {} @{} {}", task.id, task.role, task.description);
        }
        out.push('\n');
    }

    let skipped: Vec<_> = memory
        .actions()
        .filter(|e| e.text.contains("skipped by user"))
        .collect();
    if !skipped.is_empty() {
        out.push_str("## Skipped Tasks\n\n");
        for entry in skipped {
            let _ = writeln!(out, "- {}", entry.text);
        }
        out.push('\n');
    }

    out.push_str("## Key Decisions\n\n");
    let mut any = false;
    for entry in memory.decisions() {
        let _ = writeln!(out, "- {}", entry.text);
        any = true;
    }
    if !any {
        out.push_str("- No major decisions recorded\n");
    }

    out.push_str("\n## Known Issues\n\n");
    if workflow.escalations.is_empty() {
        out.push_str("- No known issues\n");
    } else {
        for e in &workflow.escalations {
            let _ = writeln!(out, "- {} {} ({}): {}", e.task_id, e.description, e.kind, e.error);
        }
    }

    out.push_str("\n## Lessons Learned\n\n");
    let mut any = false;
    for entry in memory.lessons() {
        let _ = writeln!(out, "- {}", entry.text);
        any = true;
    }
    if !any {
        out.push_str("- No lessons recorded\n");
    }

    out.push_str("\n## Project Files\n\n```\n");
    for file in files.iter().take(FILE_LIST_CAP) {
        let _ = writeln!(out, "{}", file);
    }
    if files.len() > FILE_LIST_CAP {
        out.push_str("...\n");
    }
    out.push_str("```\n");
    out
}

/// Write `SUMMARY.md` for the project and return its path.
pub fn write(
    config: &Config,
    list: &TaskList,
    memory: &MemoryLog,
    workflow: &WorkflowState,
) -> Result<PathBuf> {
    let files = project_files(&config.project_dir);
    let report = render(&config.project_name(), list, memory, workflow, &files);
    write_atomic(&config.summary_file, &report)
        .with_context(|| format!("Failed to write {}", config.summary_file.display()))?;
    tracing::info!(path = %config.summary_file.display(), "summary written");
    Ok(config.summary_file.clone())
}
