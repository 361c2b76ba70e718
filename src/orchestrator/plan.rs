//! Plan generation.
//!
//! The manager role turns a project idea or a feature request into SPEC.md
//! and TODO.md. A plan that parses opens a new cycle, so every role starts
//! its next dispatch in a fresh session.

use std::fmt::Write as _;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Orchestrator, OrchestratorEvent};
use crate::errors::OrchestratorError;
use crate::policy::extract_decisions;
use crate::session::{ContextUsage, ResetReason};
use crate::tasks::Role;
use crate::util::truncate_chars;
use crate::worker::prompt::role_preamble;
use crate::worker::{DispatchContext, ModelRouter, WorkerOutcome, WorkerRequest};
use crate::workflow::WorkflowStatus;

/// Role that writes plans.
pub const PLANNER_ROLE: &str = "manager";

const PLAN_SECTION: &str = "Planning";
const SPEC_EXCERPT_CHARS: usize = 6000;

/// What the planner is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    /// A new project: write SPEC.md and TODO.md from scratch.
    Project,
    /// A feature on an existing project: extend SPEC.md and append to TODO.md.
    Feature,
}

impl PlanKind {
    pub fn label(&self) -> &'static str {
        match self {
            PlanKind::Project => "project plan",
            PlanKind::Feature => "feature request",
        }
    }
}

/// Result of a successful planning dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutcome {
    pub cycle: u32,
    /// Open tasks in TODO.md once the plan is written.
    pub open_tasks: usize,
    /// Open tasks the plan added.
    pub added: usize,
}

fn plan_prompt(
    preamble: &str,
    kind: PlanKind,
    request: &str,
    existing_spec: Option<&str>,
    context: &DispatchContext,
) -> String {
    let mut out = String::new();
    out.push_str(preamble.trim_end());
    out.push_str("\n\n");

    match kind {
        PlanKind::Project => out.push_str("## Project Request\n"),
        PlanKind::Feature => out.push_str("## Feature Request\n"),
    }
    out.push_str(request.trim());
    out.push_str("\n\n");

    if let Some(spec) = existing_spec {
        out.push_str("## Current SPEC.md (excerpt)\n");
        out.push_str(spec);
        out.push_str("\n\n");
    }

    if !context.recent_decisions.is_empty() {
        out.push_str("## Recent Decisions\n");
        for d in &context.recent_decisions {
            let _ = writeln!(out, "- {}", d);
        }
        out.push('\n');
    }

    out.push_str("## Instructions\n");
    match kind {
        PlanKind::Project => {
            out.push_str("- Write SPEC.md: goals, requirements, constraints and acceptance criteria.\n");
            out.push_str("- Write TODO.md: `## Section` headings in build order, one `- [ ] @role description` line per task.\n");
        }
        PlanKind::Feature => {
            out.push_str("- Update SPEC.md with the feature's requirements. Keep the existing content.\n");
            out.push_str("- Append new `## Section` blocks for the feature to TODO.md. Do not edit or remove existing tasks.\n");
        }
    }
    out.push_str("- Roles: engineer, ui, database, security, testing, qa.\n");
    out.push_str("- Record any decision teammates should follow as <decision>...</decision>.\n");
    out
}

impl Orchestrator {
    /// Have the manager role write a plan for `request`, then open a new
    /// cycle. Refused while a run is active.
    pub async fn plan(
        &self,
        kind: PlanKind,
        request: &str,
    ) -> Result<PlanOutcome, OrchestratorError> {
        let request = request.trim();
        if request.is_empty() {
            return Err(OrchestratorError::EmptyPlanRequest);
        }
        let (cancel, pool) = self.claim_run(1)?;
        let result = async {
            let role = Role::new(PLANNER_ROLE);
            let _permit = pool
                .acquire(&role, &cancel)
                .await
                .map_err(|_| OrchestratorError::PlanFailed("planning was stopped".into()))?;
            self.run_plan(kind, request, role, cancel.clone()).await
        }
        .await;
        self.shared.release_run();
        if let Err(ref e) = result {
            tracing::warn!(kind = kind.label(), error = %e, "planning failed");
        }
        result
    }

    async fn run_plan(
        &self,
        kind: PlanKind,
        request: &str,
        role: Role,
        cancel: CancellationToken,
    ) -> Result<PlanOutcome, OrchestratorError> {
        let config = &self.shared.config;
        let existing_spec = match kind {
            PlanKind::Feature => std::fs::read_to_string(&config.spec_file)
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(|s| truncate_chars(s.trim(), SPEC_EXCERPT_CHARS)),
            PlanKind::Project => None,
        };

        let (request_msg, open_before) = {
            let mut guard = self.shared.state.lock().await;
            let st = &mut *guard;
            let open_before = st.store.load()?.counts().open;
            // The planner always starts from a clean session.
            st.sessions.reset(&role, ResetReason::NewCycle);
            let ticket = st.sessions.prepare(&role);
            let context = DispatchContext {
                recent_decisions: st
                    .memory
                    .recent_decisions(config.toml.memory.context_decisions),
                ..DispatchContext::default()
            };
            let preamble = role_preamble(&config.project_name(), &role);
            let prompt = plan_prompt(&preamble, kind, request, existing_spec.as_deref(), &context);
            let route = ModelRouter::from_toml(&config.toml).route(&role, &[request]);
            let msg = WorkerRequest {
                dispatch_id: Uuid::new_v4(),
                role: role.clone(),
                section: PLAN_SECTION.to_string(),
                tasks: Vec::new(),
                context,
                preamble: Some(preamble),
                resume_token: ticket.resume_token,
                model: route.model,
                timeout: route.timeout,
                prompt,
            };
            (msg, open_before)
        };

        let dispatch_id = request_msg.dispatch_id;
        let prompt_chars = request_msg.prompt.chars().count();
        tracing::info!(kind = kind.label(), role = %role, "planning started");
        self.shared.emit(OrchestratorEvent::DispatchStarted {
            dispatch_id,
            role: role.clone(),
            section: PLAN_SECTION.to_string(),
            task_ids: Vec::new(),
            resumed: false,
            model: request_msg.model.clone(),
        });

        let started = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let forward = async {
            while let Some(event) = rx.recv().await {
                self.shared.emit(OrchestratorEvent::WorkerOutput {
                    dispatch_id,
                    role: role.clone(),
                    event,
                });
            }
        };
        let (outcome, ()) = tokio::join!(self.shared.worker.invoke(request_msg, tx, cancel), forward);
        self.shared.emit(OrchestratorEvent::DispatchCompleted {
            dispatch_id,
            role: role.clone(),
            task_ids: Vec::new(),
            outcome: outcome.label().to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });

        let mut guard = self.shared.state.lock().await;
        let st = &mut *guard;
        let output = match outcome {
            WorkerOutcome::Success {
                output,
                usage,
                session_token,
            } => {
                let usage = usage.unwrap_or(ContextUsage::Estimated {
                    prompt_chars,
                    output_chars: output.chars().count(),
                });
                st.sessions.record_success(&role, session_token, usage, 1);
                output
            }
            WorkerOutcome::Unrecoverable { message } => {
                st.sessions.mark_unrecoverable(&role);
                return Err(OrchestratorError::PlanFailed(message));
            }
            WorkerOutcome::RecoverableError { message } => {
                return Err(OrchestratorError::PlanFailed(message));
            }
            WorkerOutcome::Timeout { elapsed } => {
                return Err(OrchestratorError::PlanFailed(format!(
                    "timed out after {}s",
                    elapsed.as_secs()
                )));
            }
            WorkerOutcome::Cancelled => {
                return Err(OrchestratorError::PlanFailed("planning was stopped".into()));
            }
        };

        // Canonical form, so ids assigned while parsing stay stable.
        let list = st.store.load()?;
        st.store.save(&list)?;
        let counts = list.counts();
        if counts.open == 0 {
            return Err(OrchestratorError::PlanFailed(
                "the plan left TODO.md without open tasks".into(),
            ));
        }

        let (from, cycle) = st.workflow.begin_cycle();
        st.sessions.begin_cycle();
        st.workflow
            .escalations
            .retain(|e| list.task(e.task_id).is_some_and(|t| t.is_open()));
        for decision in extract_decisions(&output) {
            st.memory.record_decision(&decision);
        }
        let added = counts.open.saturating_sub(open_before);
        st.memory.record_action(&format!(
            "{} planned (cycle {}): {}",
            match kind {
                PlanKind::Project => "Project",
                PlanKind::Feature => "Feature",
            },
            cycle,
            truncate_chars(request, 100)
        ));
        st.persist_workflow(config)?;
        st.persist_memory(config)?;

        tracing::info!(kind = kind.label(), cycle, open = counts.open, added, "plan ready");
        if from != WorkflowStatus::InProgress {
            self.shared.emit(OrchestratorEvent::PhaseChanged {
                from,
                to: WorkflowStatus::InProgress,
            });
        }
        self.shared.emit(OrchestratorEvent::PlanReady {
            cycle,
            open_tasks: counts.open,
        });
        Ok(PlanOutcome {
            cycle,
            open_tasks: counts.open,
            added,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_prompt_asks_for_both_files() {
        let prompt = plan_prompt(
            "You are the Project Manager.",
            PlanKind::Project,
            "A todo app with sharing",
            None,
            &DispatchContext::default(),
        );
        assert!(prompt.starts_with("You are the Project Manager."));
        assert!(prompt.contains("## Project Request\nA todo app with sharing"));
        assert!(prompt.contains("Write SPEC.md"));
        assert!(prompt.contains("Write TODO.md"));
        assert!(!prompt.contains("Current SPEC.md"));
    }

    #[test]
    fn test_feature_prompt_carries_spec_and_decisions() {
        let context = DispatchContext {
            recent_decisions: vec!["Use SQLite".into()],
            ..DispatchContext::default()
        };
        let prompt = plan_prompt(
            "preamble",
            PlanKind::Feature,
            "  Add dark mode  ",
            Some("# Shop\nSells things"),
            &context,
        );
        assert!(prompt.contains("## Feature Request\nAdd dark mode\n"));
        assert!(prompt.contains("## Current SPEC.md (excerpt)\n# Shop\nSells things"));
        assert!(prompt.contains("- Use SQLite"));
        assert!(prompt.contains("Do not edit or remove existing tasks"));
    }
}
