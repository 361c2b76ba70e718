//! External worker interface.
//!
//! A [`Worker`] performs one dispatch: it receives the task instruction,
//! minimal context and an optional resumption token, streams incremental
//! events while it runs, and resolves to a [`WorkerOutcome`]. The
//! orchestrator never looks inside a worker; [`ClaudeWorker`] drives the
//! Claude CLI and tests substitute scripted workers.

pub mod claude;
pub mod prompt;
pub mod roles;
pub mod routing;
pub mod stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::ContextUsage;
use crate::tasks::{Role, TaskId};

pub use claude::{ClaudeWorker, ClaudeWorkerConfig};
pub use prompt::build_prompt;
pub use routing::{ModelRouter, Route};

/// One task inside a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: TaskId,
    pub description: String,
    /// Summary of the previous failed attempt, so the worker can adapt.
    pub prior_error: Option<String>,
}

/// Minimal context sent with a dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchContext {
    pub recent_decisions: Vec<String>,
    /// Uncompleted tasks in the same section, for awareness only.
    pub sibling_tasks: Vec<String>,
    /// Files changed since this role's session last saw the project.
    pub stale_files: Vec<PathBuf>,
}

/// Everything a worker needs for one dispatch.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub dispatch_id: Uuid,
    pub role: Role,
    pub section: String,
    pub tasks: Vec<WorkItem>,
    pub context: DispatchContext,
    /// Role definition; `None` when resuming a session that already has it.
    pub preamble: Option<String>,
    pub resume_token: Option<String>,
    pub model: Option<String>,
    pub timeout: Duration,
    /// Rendered instruction sent to the worker.
    pub prompt: String,
}

impl WorkerRequest {
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id).collect()
    }

    pub fn is_resumed(&self) -> bool {
        self.resume_token.is_some()
    }
}

/// Incremental output while a dispatch runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Text { text: String },
    ToolUse { tool: String, description: String },
    SessionStarted { token: String },
}

/// How a dispatch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Success {
        output: String,
        /// Authoritative usage, when the worker reports it.
        usage: Option<ContextUsage>,
        session_token: Option<String>,
    },
    RecoverableError {
        message: String,
    },
    Timeout {
        elapsed: Duration,
    },
    /// The session itself is unusable (lost, expired, or the worker could
    /// not start).
    Unrecoverable {
        message: String,
    },
    Cancelled,
}

impl WorkerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerOutcome::Success { .. } => "success",
            WorkerOutcome::RecoverableError { .. } => "error",
            WorkerOutcome::Timeout { .. } => "timeout",
            WorkerOutcome::Unrecoverable { .. } => "unrecoverable",
            WorkerOutcome::Cancelled => "cancelled",
        }
    }
}

/// Performs dispatches against an external reasoning engine.
///
/// Implementations must return promptly with [`WorkerOutcome::Cancelled`]
/// once `cancel` fires, and must enforce `request.timeout` themselves.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn invoke(
        &self,
        request: WorkerRequest,
        events: mpsc::UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> WorkerOutcome;
}
