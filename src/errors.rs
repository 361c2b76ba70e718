//! Typed error hierarchy for crew.
//!
//! Two top-level enums cover the two places errors cross a seam:
//! - `TaskListError` — reading, parsing and persisting the task list
//! - `OrchestratorError` — control requests and the coordinating loop
//!
//! Task-level worker failures are not errors here: they are outcomes
//! handled by the retry policy.

use std::path::PathBuf;

use thiserror::Error;

use crate::tasks::TaskId;
use crate::workflow::WorkflowStatus;

/// Errors from the task list model and its on-disk store.
#[derive(Debug, Error)]
pub enum TaskListError {
    #[error("Malformed task list at line {line}: {reason}\n  > {content}")]
    Parse {
        line: usize,
        content: String,
        reason: String,
    },

    #[error("Duplicate task id {id} at line {line}")]
    DuplicateId { id: TaskId, line: usize },

    #[error("Failed to access task list at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to lock task list at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from orchestrator controls and the coordinating loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("A run is already active for project {project}")]
    SchedulingConflict { project: String },

    #[error("Task {id} not found")]
    TaskNotFound { id: TaskId },

    #[error("No pending escalation for task {id}")]
    NoPendingEscalation { id: TaskId },

    #[error("Cannot {action} while workflow status is {status}")]
    InvalidTransition {
        action: &'static str,
        status: WorkflowStatus,
    },

    #[error("Modify resolution requires a non-empty description")]
    EmptyDescription,

    #[error("Rejecting acceptance requires at least one requested change")]
    NoChangesRequested,

    #[error("A plan needs a non-empty request")]
    EmptyPlanRequest,

    #[error("Planning failed: {0}")]
    PlanFailed(String),

    #[error(transparent)]
    TaskList(#[from] TaskListError),

    #[error("Failed to persist {what} at {path}: {source}")]
    Persist {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Orchestrator halted: {0}")]
    Critical(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Whether the error was raised by the coordinating loop itself rather
    /// than rejected at a control boundary.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Critical(_)
                | OrchestratorError::Persist { .. }
                | OrchestratorError::TaskList(_)
                | OrchestratorError::Other(_)
        )
    }
}
