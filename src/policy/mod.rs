//! Escalation and retry policy.
//!
//! Turns the outcome of one task's dispatch into the next action:
//! complete, retry with the error carried forward, or escalate to a human.
//! Also applies the human's resolution of an escalation to the task list.

pub mod signals;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::crew_config::RetrySection;
use crate::errors::OrchestratorError;
use crate::tasks::types::single_line;
use crate::tasks::{Role, Task, TaskId, TaskList};
use crate::util::truncate_chars;

pub use signals::{extract_decisions, extract_failures};

/// Outcome of a dispatch as it applies to one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success { output: String },
    RecoverableError { message: String },
    Timeout { elapsed: Duration },
    /// Session-level failure; the role's session must be reset.
    Unrecoverable { message: String },
    /// Dispatch cancelled by a force-stop; the task is left untouched.
    Cancelled,
}

/// Why an escalation was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationKind {
    RetriesExhausted { attempts: u32 },
    Timeout { elapsed_secs: u64 },
}

impl std::fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationKind::RetriesExhausted { attempts } => {
                write!(f, "failed {} times", attempts)
            }
            EscalationKind::Timeout { elapsed_secs } => {
                write!(f, "timed out after {}s", elapsed_secs)
            }
        }
    }
}

/// The closed set of resolutions a human may pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    Retry,
    Skip,
    Modify,
    Remove,
    Stop,
}

impl ResolutionKind {
    pub const ALL: [ResolutionKind; 5] = [
        ResolutionKind::Retry,
        ResolutionKind::Skip,
        ResolutionKind::Modify,
        ResolutionKind::Remove,
        ResolutionKind::Stop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionKind::Retry => "retry",
            ResolutionKind::Skip => "skip",
            ResolutionKind::Modify => "modify",
            ResolutionKind::Remove => "remove",
            ResolutionKind::Stop => "stop",
        }
    }
}

impl std::fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending human decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub task_id: TaskId,
    pub role: Role,
    pub description: String,
    /// Accumulated error text.
    pub error: String,
    pub kind: EscalationKind,
    pub raised_at: DateTime<Utc>,
    pub options: Vec<ResolutionKind>,
}

/// A human's answer to an escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Resolution {
    /// Reset the retry count and re-queue.
    Retry,
    /// Mark complete without executing.
    Skip,
    /// Replace the description, reset the retry count and re-queue.
    Modify { description: String },
    /// Delete the task.
    Remove,
    /// Halt all scheduling for the project.
    Stop,
}

impl Resolution {
    pub fn kind(&self) -> ResolutionKind {
        match self {
            Resolution::Retry => ResolutionKind::Retry,
            Resolution::Skip => ResolutionKind::Skip,
            Resolution::Modify { .. } => ResolutionKind::Modify,
            Resolution::Remove => ResolutionKind::Remove,
            Resolution::Stop => ResolutionKind::Stop,
        }
    }
}

/// Next step for a task after its dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyAction {
    Complete { decisions: Vec<String> },
    Retry { attempt: u32, error_summary: String },
    Escalate(Escalation),
    /// Leave the task as it is (dispatch was cancelled).
    Abandon,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub action: PolicyAction,
    /// Reset the role's session before its next dispatch.
    pub reset_session: bool,
}

/// Effect of applying a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionEffect {
    /// The task is open again and will be scheduled.
    pub requeued: bool,
    /// The task was marked complete without executing.
    pub skipped: bool,
    /// All scheduling must halt.
    pub stop: bool,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub error_summary_chars: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            error_summary_chars: 300,
        }
    }
}

impl RetryPolicy {
    pub fn from_section(section: &RetrySection) -> Self {
        Self {
            max_retries: section.max_retries,
            error_summary_chars: section.error_summary_chars.max(16),
        }
    }

    /// Single-line, bounded summary of an error message.
    pub fn summarize(&self, message: &str) -> String {
        let line = single_line(message);
        if line.is_empty() {
            "unknown error".to_string()
        } else {
            truncate_chars(&line, self.error_summary_chars)
        }
    }

    fn escalation(&self, task: &Task, error: String, kind: EscalationKind) -> Escalation {
        Escalation {
            task_id: task.id,
            role: task.role.clone(),
            description: task.description.clone(),
            error,
            kind,
            raised_at: Utc::now(),
            options: ResolutionKind::ALL.to_vec(),
        }
    }

    fn on_failure(&self, task: &Task, message: &str) -> PolicyAction {
        let summary = self.summarize(message);
        if task.retries < self.max_retries {
            PolicyAction::Retry {
                attempt: task.retries + 1,
                error_summary: summary,
            }
        } else {
            PolicyAction::Escalate(self.escalation(
                task,
                summary,
                EscalationKind::RetriesExhausted {
                    attempts: task.retries + 1,
                },
            ))
        }
    }

    /// Decide what happens to `task` given its dispatch outcome.
    pub fn evaluate(&self, task: &Task, outcome: &TaskOutcome) -> Verdict {
        match outcome {
            TaskOutcome::Success { output } => Verdict {
                action: PolicyAction::Complete {
                    decisions: extract_decisions(output),
                },
                reset_session: false,
            },
            TaskOutcome::RecoverableError { message } => Verdict {
                action: self.on_failure(task, message),
                reset_session: false,
            },
            TaskOutcome::Timeout { elapsed } => {
                let error = format!("timed out after {}s", elapsed.as_secs());
                Verdict {
                    action: PolicyAction::Escalate(self.escalation(
                        task,
                        error,
                        EscalationKind::Timeout {
                            elapsed_secs: elapsed.as_secs(),
                        },
                    )),
                    reset_session: false,
                }
            }
            TaskOutcome::Unrecoverable { message } => Verdict {
                action: self.on_failure(task, message),
                reset_session: true,
            },
            TaskOutcome::Cancelled => Verdict {
                action: PolicyAction::Abandon,
                reset_session: false,
            },
        }
    }
}

/// Apply a resolution for an escalated task to the task list.
pub fn apply_resolution(
    list: &mut TaskList,
    task_id: TaskId,
    resolution: &Resolution,
) -> Result<ResolutionEffect, OrchestratorError> {
    let mut effect = ResolutionEffect {
        requeued: false,
        skipped: false,
        stop: false,
    };
    if matches!(resolution, Resolution::Stop) {
        effect.stop = true;
        return Ok(effect);
    }
    if list.task(task_id).is_none() {
        return Err(OrchestratorError::TaskNotFound { id: task_id });
    }

    match resolution {
        Resolution::Retry => {
            list.reset_retries(task_id);
            effect.requeued = true;
        }
        Resolution::Skip => {
            list.mark_done(task_id);
            effect.skipped = true;
        }
        Resolution::Modify { description } => {
            if description.trim().is_empty() {
                return Err(OrchestratorError::EmptyDescription);
            }
            list.set_description(task_id, description);
            list.reset_retries(task_id);
            effect.requeued = true;
        }
        Resolution::Remove => {
            list.remove(task_id);
        }
        Resolution::Stop => {}
    }
    Ok(effect)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(retries: u32) -> Task {
        let mut t = Task::new(TaskId::new(1), Role::from("engineer"), "Backend", "Build API");
        t.retries = retries;
        t
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            error_summary_chars: 300,
        }
    }

    #[test]
    fn test_success_completes_with_decisions() {
        let v = policy().evaluate(
            &task(0),
            &TaskOutcome::Success {
                output: "<decision>Use axum</decision>".into(),
            },
        );
        assert_eq!(
            v.action,
            PolicyAction::Complete {
                decisions: vec!["Use axum".into()]
            }
        );
        assert!(!v.reset_session);
    }

    #[test]
    fn test_recoverable_retries_up_to_max_then_escalates() {
        let p = policy();
        let outcome = TaskOutcome::RecoverableError {
            message: "tests\nfailed".into(),
        };
        for retries in 0..3 {
            match p.evaluate(&task(retries), &outcome).action {
                PolicyAction::Retry {
                    attempt,
                    error_summary,
                } => {
                    assert_eq!(attempt, retries + 1);
                    assert_eq!(error_summary, "tests failed");
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }
        match p.evaluate(&task(3), &outcome).action {
            PolicyAction::Escalate(esc) => {
                assert_eq!(esc.kind, EscalationKind::RetriesExhausted { attempts: 4 });
                assert_eq!(esc.error, "tests failed");
            }
            other => panic!("expected escalation, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_escalates_immediately_with_all_options() {
        let v = policy().evaluate(
            &task(0),
            &TaskOutcome::Timeout {
                elapsed: Duration::from_secs(600),
            },
        );
        match v.action {
            PolicyAction::Escalate(esc) => {
                assert_eq!(esc.kind, EscalationKind::Timeout { elapsed_secs: 600 });
                assert_eq!(esc.options, ResolutionKind::ALL.to_vec());
                assert_eq!(esc.task_id, TaskId::new(1));
            }
            other => panic!("expected escalation, got {other:?}"),
        }
    }

    #[test]
    fn test_unrecoverable_resets_session_and_follows_retry_rule() {
        let p = policy();
        let outcome = TaskOutcome::Unrecoverable {
            message: "session expired".into(),
        };
        let v = p.evaluate(&task(0), &outcome);
        assert!(v.reset_session);
        assert!(matches!(v.action, PolicyAction::Retry { attempt: 1, .. }));

        let v = p.evaluate(&task(3), &outcome);
        assert!(v.reset_session);
        assert!(matches!(v.action, PolicyAction::Escalate(_)));
    }

    #[test]
    fn test_cancelled_abandons() {
        let v = policy().evaluate(&task(1), &TaskOutcome::Cancelled);
        assert_eq!(v.action, PolicyAction::Abandon);
    }

    #[test]
    fn test_summary_is_bounded() {
        let p = RetryPolicy {
            max_retries: 1,
            error_summary_chars: 20,
        };
        assert_eq!(p.summarize(&"x".repeat(100)).chars().count(), 20);
        assert_eq!(p.summarize("  "), "unknown error");
    }

    fn list() -> TaskList {
        let mut list = TaskList::new();
        list.add_tasks("A", vec![(Role::from("engineer"), "Build API".into())]);
        list.record_failure(TaskId::new(1), "boom");
        list
    }

    #[test]
    fn test_resolution_retry_resets_count() {
        let mut l = list();
        let effect = apply_resolution(&mut l, TaskId::new(1), &Resolution::Retry).unwrap();
        assert!(effect.requeued);
        assert_eq!(l.task(TaskId::new(1)).unwrap().retries, 0);
    }

    #[test]
    fn test_resolution_skip_marks_done() {
        let mut l = list();
        let effect = apply_resolution(&mut l, TaskId::new(1), &Resolution::Skip).unwrap();
        assert!(effect.skipped);
        assert!(l.task(TaskId::new(1)).unwrap().is_done());
    }

    #[test]
    fn test_resolution_modify_replaces_description() {
        let mut l = list();
        let res = Resolution::Modify {
            description: "Build a smaller API".into(),
        };
        apply_resolution(&mut l, TaskId::new(1), &res).unwrap();
        let t = l.task(TaskId::new(1)).unwrap();
        assert_eq!(t.description, "Build a smaller API");
        assert_eq!(t.retries, 0);

        let empty = Resolution::Modify {
            description: " ".into(),
        };
        assert!(matches!(
            apply_resolution(&mut l, TaskId::new(1), &empty),
            Err(OrchestratorError::EmptyDescription)
        ));
    }

    #[test]
    fn test_resolution_remove_and_stop() {
        let mut l = list();
        let stop = apply_resolution(&mut l, TaskId::new(1), &Resolution::Stop).unwrap();
        assert!(stop.stop);
        assert!(l.task(TaskId::new(1)).is_some());

        apply_resolution(&mut l, TaskId::new(1), &Resolution::Remove).unwrap();
        assert!(l.task(TaskId::new(1)).is_none());
        assert!(matches!(
            apply_resolution(&mut l, TaskId::new(1), &Resolution::Retry),
            Err(OrchestratorError::TaskNotFound { .. })
        ));
    }
}
