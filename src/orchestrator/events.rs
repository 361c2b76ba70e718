//! Observer event stream.
//!
//! Events go out on a broadcast channel; emission never waits for
//! subscribers and lagging subscribers lose the oldest events.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::policy::{Escalation, ResolutionKind};
use crate::session::ResetReason;
use crate::tasks::{Role, TaskId};
use crate::worker::WorkerEvent;
use crate::workflow::WorkflowStatus;

/// Capacity of the broadcast channel.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    RunStarted {
        project: String,
        status: WorkflowStatus,
        max_parallel: usize,
    },
    PhaseChanged {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    DispatchStarted {
        dispatch_id: Uuid,
        role: Role,
        section: String,
        task_ids: Vec<TaskId>,
        resumed: bool,
        model: Option<String>,
    },
    DispatchCompleted {
        dispatch_id: Uuid,
        role: Role,
        task_ids: Vec<TaskId>,
        outcome: String,
        elapsed_ms: u64,
    },
    WorkerOutput {
        dispatch_id: Uuid,
        role: Role,
        event: WorkerEvent,
    },
    TaskCompleted {
        task_id: TaskId,
        role: Role,
        description: String,
    },
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        error: String,
    },
    TaskSplit {
        task_id: TaskId,
        children: Vec<TaskId>,
    },
    EscalationRaised {
        escalation: Escalation,
    },
    EscalationResolved {
        task_id: TaskId,
        resolution: ResolutionKind,
    },
    SessionReset {
        role: Role,
        reason: ResetReason,
    },
    GateEvaluated {
        phase: WorkflowStatus,
        passed: bool,
        blocking: Vec<String>,
        advisory: usize,
    },
    /// Nothing is in flight and every remaining task awaits a human.
    Blocked {
        task_ids: Vec<TaskId>,
    },
    AwaitingAcceptance {
        round: u32,
    },
    /// A plan was written and a new cycle opened.
    PlanReady {
        cycle: u32,
        open_tasks: usize,
    },
    WorkPaused,
    WorkResumed,
    WorkStopped {
        reason: String,
    },
    WorkComplete {
        summary: Option<PathBuf>,
    },
    CriticalError {
        message: String,
    },
}

impl OrchestratorEvent {
    /// Event name as it appears in the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::RunStarted { .. } => "run_started",
            OrchestratorEvent::PhaseChanged { .. } => "phase_changed",
            OrchestratorEvent::DispatchStarted { .. } => "dispatch_started",
            OrchestratorEvent::DispatchCompleted { .. } => "dispatch_completed",
            OrchestratorEvent::WorkerOutput { .. } => "worker_output",
            OrchestratorEvent::TaskCompleted { .. } => "task_completed",
            OrchestratorEvent::TaskRetrying { .. } => "task_retrying",
            OrchestratorEvent::TaskSplit { .. } => "task_split",
            OrchestratorEvent::EscalationRaised { .. } => "escalation_raised",
            OrchestratorEvent::EscalationResolved { .. } => "escalation_resolved",
            OrchestratorEvent::SessionReset { .. } => "session_reset",
            OrchestratorEvent::GateEvaluated { .. } => "gate_evaluated",
            OrchestratorEvent::Blocked { .. } => "blocked",
            OrchestratorEvent::AwaitingAcceptance { .. } => "awaiting_acceptance",
            OrchestratorEvent::PlanReady { .. } => "plan_ready",
            OrchestratorEvent::WorkPaused => "work_paused",
            OrchestratorEvent::WorkResumed => "work_resumed",
            OrchestratorEvent::WorkStopped { .. } => "work_stopped",
            OrchestratorEvent::WorkComplete { .. } => "work_complete",
            OrchestratorEvent::CriticalError { .. } => "critical_error",
        }
    }
}
