//! Strict parser and canonical serializer for the `TODO.md` checklist.
//!
//! ```markdown
//! # Project - TODO
//!
//! ## Backend
//! Notes are kept per section.
//! - [ ] T1 @engineer Build the users endpoint
//!   - retries: 1
//!   - last-error: tests failed: missing route
//! - [x] T2 @database Design the schema
//! - [-] T3 @engineer Split parent
//! - [ ] T4 @engineer First half
//!   - split-from: T3
//! ```
//!
//! Anything that looks like a task but does not follow the grammar is a
//! parse error. Indented text under a task must be a known metadata entry,
//! so leftover annotation text can never turn into a new task.

use regex::Regex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::LazyLock;

use super::types::{DEFAULT_SECTION, Role, Section, Task, TaskId, TaskList, TaskState};
use crate::errors::TaskListError;

static TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[-*] \[(?P<mark>.)\] (?:(?P<id>[Tt]\d+)\s+)?(?:@(?P<role>[A-Za-z][\w-]*)\s+)?(?P<desc>.*)$",
    )
    .expect("valid regex")
});

static CHECKBOX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*] \[").expect("valid regex"));

static META_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s+[-*] (?P<key>[A-Za-z][\w-]*):\s*(?P<value>.*)$").expect("valid regex")
});

struct PendingTask {
    id: Option<TaskId>,
    task: Task,
}

fn parse_error(line: usize, content: &str, reason: impl Into<String>) -> TaskListError {
    TaskListError::Parse {
        line,
        content: content.to_string(),
        reason: reason.into(),
    }
}

/// Parse a task list document.
///
/// Tasks without an id receive the next free `T<n>` in document order.
pub fn parse(content: &str) -> Result<TaskList, TaskListError> {
    let mut title = None;
    let mut preamble = Vec::new();
    let mut sections: Vec<(Section, Vec<PendingTask>)> = Vec::new();
    let mut seen: HashMap<TaskId, usize> = HashMap::new();

    for (index, raw) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.trim_end();

        if line.trim().is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix("## ") {
            sections.push((Section::new(name.trim()), Vec::new()));
            continue;
        }

        if sections.is_empty()
            && title.is_none()
            && preamble.is_empty()
            && let Some(text) = line.strip_prefix("# ")
        {
            title = Some(text.trim().to_string());
            continue;
        }

        if line.starts_with(char::is_whitespace) {
            let trimmed = line.trim_start();
            if !(trimmed.starts_with("- ") || trimmed.starts_with("* ")) {
                // Indented prose only makes sense inside a section's notes.
                match sections.last_mut() {
                    Some((section, tasks)) if tasks.is_empty() => {
                        section.notes.push(line.to_string());
                        continue;
                    }
                    None => {
                        preamble.push(line.to_string());
                        continue;
                    }
                    _ => {
                        return Err(parse_error(
                            line_no,
                            line,
                            "unexpected indented text under a task (expected `- key: value`)",
                        ));
                    }
                }
            }
            let Some(caps) = META_RE.captures(line) else {
                return Err(parse_error(
                    line_no,
                    line,
                    "nested list items must be `- key: value` metadata",
                ));
            };
            let Some(pending) = sections.last_mut().and_then(|(_, tasks)| tasks.last_mut()) else {
                return Err(parse_error(line_no, line, "metadata without a preceding task"));
            };
            let value = caps["value"].trim();
            match caps["key"].to_lowercase().as_str() {
                "retries" => {
                    pending.task.retries = value.parse().map_err(|_| {
                        parse_error(line_no, line, format!("invalid retry count '{}'", value))
                    })?;
                }
                "last-error" => {
                    pending.task.last_error = (!value.is_empty()).then(|| value.to_string());
                }
                "split-from" => {
                    pending.task.split_from = Some(
                        value
                            .parse()
                            .map_err(|e: String| parse_error(line_no, line, e))?,
                    );
                }
                other => {
                    return Err(parse_error(
                        line_no,
                        line,
                        format!("unknown task metadata '{}'", other),
                    ));
                }
            }
            continue;
        }

        if CHECKBOX_RE.is_match(line) {
            let Some(caps) = TASK_RE.captures(line) else {
                return Err(parse_error(line_no, line, "malformed task checkbox"));
            };
            let state = match &caps["mark"] {
                " " => TaskState::Open,
                "x" | "X" => TaskState::Done,
                "-" => TaskState::Split,
                other => {
                    return Err(parse_error(
                        line_no,
                        line,
                        format!("unknown checkbox state '{}'", other),
                    ));
                }
            };
            let description = caps["desc"].trim();
            if description.is_empty() {
                return Err(parse_error(line_no, line, "task has no description"));
            }
            let id = match caps.name("id") {
                Some(m) => {
                    let id: TaskId = m
                        .as_str()
                        .parse()
                        .map_err(|e: String| parse_error(line_no, line, e))?;
                    if seen.insert(id, line_no).is_some() {
                        return Err(TaskListError::DuplicateId { id, line: line_no });
                    }
                    Some(id)
                }
                None => None,
            };
            let role = caps
                .name("role")
                .map(|m| Role::new(m.as_str()))
                .unwrap_or_default();

            if sections.is_empty() {
                sections.push((Section::new(DEFAULT_SECTION), Vec::new()));
            }
            let last = sections.len() - 1;
            let (section, tasks) = &mut sections[last];
            let mut task = Task::new(
                id.unwrap_or(TaskId::new(0)),
                role,
                section.name.clone(),
                description,
            );
            task.state = state;
            tasks.push(PendingTask { id, task });
            continue;
        }

        match sections.last_mut() {
            Some((_, tasks)) if !tasks.is_empty() => {
                return Err(parse_error(
                    line_no,
                    line,
                    "text after tasks in a section (notes belong before the first task)",
                ));
            }
            Some((section, _)) => section.notes.push(line.to_string()),
            None => preamble.push(line.to_string()),
        }
    }

    let mut next = seen.keys().map(|id| id.number()).max().unwrap_or(0) + 1;
    let sections = sections
        .into_iter()
        .map(|(mut section, pending)| {
            section.tasks = pending
                .into_iter()
                .map(|p| {
                    let mut task = p.task;
                    task.id = match p.id {
                        Some(id) => id,
                        None => {
                            let id = TaskId::new(next);
                            next += 1;
                            id
                        }
                    };
                    task
                })
                .collect();
            section
        })
        .collect();

    Ok(TaskList {
        title,
        preamble,
        sections,
    })
}

/// Serialize a task list to its canonical document form.
pub fn serialize(list: &TaskList) -> String {
    let mut out = String::new();
    if let Some(ref title) = list.title {
        let _ = writeln!(out, "# {}", title);
        out.push('\n');
    }
    for line in &list.preamble {
        let _ = writeln!(out, "{}", line);
    }
    if !list.preamble.is_empty() {
        out.push('\n');
    }

    for (i, section) in list.sections.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "## {}", section.name);
        for note in &section.notes {
            let _ = writeln!(out, "{}", note);
        }
        for task in &section.tasks {
            let _ = writeln!(
                out,
                "- [{}] {} @{} {}",
                task.state.checkbox(),
                task.id,
                task.role,
                task.description
            );
            if task.retries > 0 {
                let _ = writeln!(out, "  - retries: {}", task.retries);
            }
            if let Some(ref err) = task.last_error {
                let _ = writeln!(out, "  - last-error: {}", super::types::single_line(err));
            }
            if let Some(parent) = task.split_from {
                let _ = writeln!(out, "  - split-from: {}", parent);
            }
        }
    }
    out
}
