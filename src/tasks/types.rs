//! Task list data model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default section for tasks declared before any `##` heading.
pub const DEFAULT_SECTION: &str = "Tasks";

/// Role assumed for task lines without an `@role` tag.
pub const DEFAULT_ROLE: &str = "engineer";

/// Task identifier of the form `T<n>`, unique within a task list.
/// Largest task number accepted in a document. Leaves headroom for ids
/// allocated after it.
pub const MAX_TASK_ID: u32 = 999_999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(u32);

impl TaskId {
    pub fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn number(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .strip_prefix('T')
            .or_else(|| s.strip_prefix('t'))
            .unwrap_or(s);
        let n = digits
            .parse::<u32>()
            .map_err(|_| format!("invalid task id '{}': expected T<number>", s))?;
        if n > MAX_TASK_ID {
            return Err(format!("task id '{}' is above T{}", s, MAX_TASK_ID));
        }
        Ok(TaskId(n))
    }
}

impl TryFrom<String> for TaskId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.to_string()
    }
}

/// Capability tag naming the specialist a task is routed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::new(DEFAULT_ROLE)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        Role::new(s)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Open,
    Done,
    /// Replaced by smaller tasks; never dispatched, never complete.
    Split,
}

impl TaskState {
    pub(crate) fn checkbox(&self) -> char {
        match self {
            TaskState::Open => ' ',
            TaskState::Done => 'x',
            TaskState::Split => '-',
        }
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub role: Role,
    pub section: String,
    pub state: TaskState,
    pub retries: u32,
    pub last_error: Option<String>,
    pub split_from: Option<TaskId>,
}

impl Task {
    pub fn new(id: TaskId, role: Role, section: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            role,
            section: section.into(),
            state: TaskState::Open,
            retries: 0,
            last_error: None,
            split_from: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == TaskState::Open
    }

    pub fn is_done(&self) -> bool {
        self.state == TaskState::Done
    }
}

/// An ordered named group of tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    /// Free-text lines kept verbatim between the heading and the tasks.
    pub notes: Vec<String>,
    pub tasks: Vec<Task>,
}

impl Section {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            notes: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn has_open_tasks(&self) -> bool {
        self.tasks.iter().any(Task::is_open)
    }
}

/// Aggregate task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: usize,
    pub open: usize,
    pub done: usize,
    pub split: usize,
}

/// The canonical task state for a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskList {
    /// Document title (`# ...`), if any.
    pub title: Option<String>,
    /// Prose before the first section.
    pub preamble: Vec<String>,
    pub sections: Vec<Section>,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    /// All tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.sections.iter().flat_map(|s| s.tasks.iter())
    }

    pub fn open_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks().filter(|t| t.is_open())
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.sections
            .iter_mut()
            .flat_map(|s| s.tasks.iter_mut())
            .find(|t| t.id == id)
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Next unused task id.
    pub fn next_id(&self) -> TaskId {
        let max = self.tasks().map(|t| t.id.number()).max().unwrap_or(0);
        TaskId::new(max.saturating_add(1))
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in self.tasks() {
            counts.total += 1;
            match task.state {
                TaskState::Open => counts.open += 1,
                TaskState::Done => counts.done += 1,
                TaskState::Split => counts.split += 1,
            }
        }
        counts
    }

    /// Mark a task complete. Returns whether anything changed; completing an
    /// already-complete (or unknown) task is a no-op.
    pub fn mark_done(&mut self, id: TaskId) -> bool {
        match self.task_mut(id) {
            Some(task) if task.state == TaskState::Open => {
                task.state = TaskState::Done;
                task.retries = 0;
                task.last_error = None;
                true
            }
            _ => false,
        }
    }

    /// Record a failed attempt, returning the new retry count.
    pub fn record_failure(&mut self, id: TaskId, error_summary: &str) -> Option<u32> {
        let task = self.task_mut(id)?;
        task.retries += 1;
        task.last_error = Some(single_line(error_summary));
        Some(task.retries)
    }

    /// Store the error that led to an escalation without consuming a retry.
    pub fn set_last_error(&mut self, id: TaskId, error_summary: &str) -> bool {
        match self.task_mut(id) {
            Some(task) => {
                task.last_error = Some(single_line(error_summary));
                true
            }
            None => false,
        }
    }

    pub fn reset_retries(&mut self, id: TaskId) -> bool {
        match self.task_mut(id) {
            Some(task) => {
                task.retries = 0;
                task.last_error = None;
                true
            }
            None => false,
        }
    }

    pub fn set_description(&mut self, id: TaskId, description: &str) -> bool {
        match self.task_mut(id) {
            Some(task) => {
                task.description = single_line(description);
                true
            }
            None => false,
        }
    }

    /// Physically delete a task.
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        for section in &mut self.sections {
            if let Some(pos) = section.tasks.iter().position(|t| t.id == id) {
                return Some(section.tasks.remove(pos));
            }
        }
        None
    }

    /// Replace an open task with smaller ones inserted right after it. The
    /// parent is marked split; children keep its section and role.
    pub fn split(&mut self, id: TaskId, parts: &[String]) -> Vec<TaskId> {
        let mut next = self.next_id().number();
        let Some(section) = self
            .sections
            .iter_mut()
            .find(|s| s.tasks.iter().any(|t| t.id == id))
        else {
            return Vec::new();
        };
        let Some(pos) = section.tasks.iter().position(|t| t.id == id) else {
            return Vec::new();
        };
        if section.tasks[pos].state != TaskState::Open {
            return Vec::new();
        }

        let parent = &mut section.tasks[pos];
        parent.state = TaskState::Split;
        let role = parent.role.clone();
        let section_name = parent.section.clone();

        let mut ids = Vec::with_capacity(parts.len());
        for (offset, part) in parts.iter().enumerate() {
            let child_id = TaskId::new(next);
            next += 1;
            let mut child = Task::new(child_id, role.clone(), section_name.clone(), single_line(part));
            child.split_from = Some(id);
            section.tasks.insert(pos + 1 + offset, child);
            ids.push(child_id);
        }
        ids
    }

    /// Append tasks to the named section, creating it at the end of the list
    /// when it does not exist yet.
    pub fn add_tasks(&mut self, section_name: &str, tasks: Vec<(Role, String)>) -> Vec<TaskId> {
        let mut next = self.next_id().number();
        let index = match self.sections.iter().position(|s| s.name == section_name) {
            Some(i) => i,
            None => {
                self.sections.push(Section::new(section_name));
                self.sections.len() - 1
            }
        };
        let section = &mut self.sections[index];
        let mut ids = Vec::with_capacity(tasks.len());
        for (role, description) in tasks {
            let id = TaskId::new(next);
            next += 1;
            section
                .tasks
                .push(Task::new(id, role, section_name, single_line(&description)));
            ids.push(id);
        }
        ids
    }

    /// Open tasks in the same section as `id`, excluding it.
    pub fn open_siblings(&self, id: TaskId, limit: usize) -> Vec<&Task> {
        let Some(task) = self.task(id) else {
            return Vec::new();
        };
        self.section(&task.section)
            .map(|s| {
                s.tasks
                    .iter()
                    .filter(|t| t.id != id && t.is_open())
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Collapse whitespace (including newlines) so a value fits on one line.
pub(crate) fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
