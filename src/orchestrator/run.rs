//! The coordinating loop.
//!
//! One loop per project. Each step reads the task list, splits oversized
//! tasks, asks the scheduler for units and spawns them into a `JoinSet`.
//! Dispatches wait for a [`DispatchPool`] permit before invoking the worker
//! and hold it until the worker returns. The loop sleeps until a dispatch
//! finishes, a control wakes it, or the run is cancelled.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use uuid::Uuid;

use super::{OrchestratorEvent, ProjectState, RunOutcome, Shared};
use crate::dispatch::DispatchPool;
use crate::errors::OrchestratorError;
use crate::policy::{PolicyAction, RetryPolicy, TaskOutcome, Verdict, extract_failures};
use crate::scheduler::split::apply_splits;
use crate::scheduler::{
    DispatchUnit, Schedule, ScheduleContext, SchedulerConfig, SplitConfig, TaskScheduler,
    plan_splits,
};
use crate::session::{ContextUsage, ResetReason, modified_since};
use crate::tasks::{Role, Task, TaskId, TaskList};
use crate::util::truncate_chars;
use crate::worker::prompt::role_preamble;
use crate::worker::{
    DispatchContext, ModelRouter, Route, WorkItem, WorkerOutcome, WorkerRequest, build_prompt,
};
use crate::workflow::{Transition, WorkflowStatus};

/// How long a stopping run waits for cancelled dispatches to return.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Largest SPEC.md excerpt sent to fresh sessions.
const SPEC_EXCERPT_CHARS: usize = 6_000;

/// Project files maintained by the orchestrator itself; never stale context.
const OWN_FILES: &[&str] = &["TODO.md", "MEMORY.md", "SUMMARY.md"];

struct DispatchResult {
    unit: DispatchUnit,
    outcome: WorkerOutcome,
    prompt_chars: usize,
}

/// Everything a spawned dispatch needs, prepared under the state lock.
struct DispatchJob {
    dispatch_id: Uuid,
    unit: DispatchUnit,
    tasks: Vec<WorkItem>,
    context: DispatchContext,
    preamble: Option<String>,
    resume_token: Option<String>,
    stale_since: Option<SystemTime>,
    stale_cap: usize,
    project_dir: PathBuf,
    route: Route,
}

enum Step {
    Progress,
    Idle,
    Finished,
}

enum End {
    Complete,
    Cancelled,
}

struct RunLoop {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    pool: DispatchPool,
    scheduler: TaskScheduler,
    policy: RetryPolicy,
    split: SplitConfig,
    router: ModelRouter,
    project: String,
    spec_excerpt: Option<String>,
    joins: JoinSet<DispatchResult>,
    active_units: usize,
    last_blocked: Option<Vec<TaskId>>,
    acceptance_announced: bool,
}

pub(crate) async fn run(
    shared: Arc<Shared>,
    cancel: CancellationToken,
    pool: DispatchPool,
) -> Result<RunOutcome, OrchestratorError> {
    let mut run = RunLoop::new(shared, cancel, pool);
    let status = run.shared.state.lock().await.workflow.status;
    run.shared.emit(OrchestratorEvent::RunStarted {
        project: run.project.clone(),
        status,
        max_parallel: run.pool.capacity(),
    });
    let result = run.drive().await;
    run.finish(result).await
}

impl RunLoop {
    fn new(shared: Arc<Shared>, cancel: CancellationToken, pool: DispatchPool) -> Self {
        let toml = &shared.config.toml;
        let spec_excerpt = std::fs::read_to_string(&shared.config.spec_file)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| truncate_chars(s.trim(), SPEC_EXCERPT_CHARS));
        Self {
            scheduler: TaskScheduler::new(SchedulerConfig::from_section(&toml.execution)),
            policy: RetryPolicy::from_section(&toml.retry),
            split: SplitConfig::from(&toml.split),
            router: ModelRouter::from_toml(toml),
            project: shared.config.project_name(),
            spec_excerpt,
            joins: JoinSet::new(),
            active_units: 0,
            last_blocked: None,
            acceptance_announced: false,
            shared,
            cancel,
            pool,
        }
    }

    async fn drive(&mut self) -> Result<End, OrchestratorError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(End::Cancelled);
            }
            match self.step().await? {
                Step::Progress => continue,
                Step::Finished => return Ok(End::Complete),
                Step::Idle => self.wait().await?,
            }
        }
    }

    /// Sleep until a dispatch finishes, a control wakes the loop, or the run
    /// is cancelled.
    async fn wait(&mut self) -> Result<(), OrchestratorError> {
        let joined = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            Some(joined) = self.joins.join_next(), if !self.joins.is_empty() => Some(joined),
            _ = self.shared.wake.notified() => None,
        };
        if let Some(joined) = joined {
            self.on_joined(joined).await?;
        }
        Ok(())
    }

    async fn step(&mut self) -> Result<Step, OrchestratorError> {
        let shared = Arc::clone(&self.shared);
        let paused = *shared.paused.borrow();
        let mut guard = shared.state.lock().await;
        let st = &mut *guard;

        if st.workflow.status != WorkflowStatus::UserAcceptance {
            self.acceptance_announced = false;
        }

        match st.workflow.status {
            WorkflowStatus::Initialized => {
                if let Some(cycle) = st.workflow.start() {
                    st.sessions.begin_cycle();
                    tracing::info!(cycle, "implementation started");
                }
                st.persist_workflow(&shared.config)?;
                shared.emit(OrchestratorEvent::PhaseChanged {
                    from: WorkflowStatus::Initialized,
                    to: WorkflowStatus::InProgress,
                });
                Ok(Step::Progress)
            }
            WorkflowStatus::Done => {
                if self.joins.is_empty() {
                    Ok(Step::Finished)
                } else {
                    Ok(Step::Idle)
                }
            }
            WorkflowStatus::UserAcceptance => {
                if !self.acceptance_announced {
                    self.acceptance_announced = true;
                    tracing::info!("awaiting user acceptance");
                    shared.emit(OrchestratorEvent::AwaitingAcceptance {
                        round: st.workflow.acceptance_rounds + 1,
                    });
                }
                Ok(Step::Idle)
            }
            status => self.schedule(st, status, paused).await,
        }
    }

    async fn schedule(
        &mut self,
        st: &mut ProjectState,
        status: WorkflowStatus,
        paused: bool,
    ) -> Result<Step, OrchestratorError> {
        // Paused: in-flight dispatches finish, nothing new starts and the
        // phase does not advance.
        if paused {
            return Ok(Step::Idle);
        }
        if status.is_gate() && st.workflow.active_section.is_none() {
            let transition = st.workflow.begin_gate(status);
            self.apply_transition(st, status, transition, Vec::new())?;
            return Ok(Step::Progress);
        }

        let scope = if status.is_gate() {
            st.workflow.active_section.clone()
        } else {
            None
        };
        let escalated = st.workflow.escalated_ids();
        let in_flight: HashSet<TaskId> = st.in_flight.keys().copied().collect();

        if !status.is_gate() {
            self.split_oversized(st, &in_flight, &escalated)?;
        }

        let list = st.store.load()?;
        let busy: BTreeSet<Role> = st.in_flight.values().cloned().collect();
        let free_slots = self.pool.capacity().saturating_sub(self.active_units);
        let ctx = ScheduleContext {
            scope: scope.as_deref(),
            in_flight: &in_flight,
            escalated: &escalated,
            busy_roles: &busy,
            free_slots,
        };

        match self.scheduler.next(&list, &ctx) {
            Schedule::Dispatch(units) => {
                self.last_blocked = None;
                for unit in units {
                    self.spawn_dispatch(st, &list, unit);
                }
                Ok(Step::Progress)
            }
            Schedule::Waiting => Ok(Step::Idle),
            Schedule::Blocked { task_ids } => {
                if self.last_blocked.as_ref() != Some(&task_ids) {
                    tracing::warn!(tasks = ?task_ids, "all remaining tasks await escalation decisions");
                    self.shared.emit(OrchestratorEvent::Blocked {
                        task_ids: task_ids.clone(),
                    });
                    self.last_blocked = Some(task_ids);
                }
                Ok(Step::Idle)
            }
            Schedule::Exhausted => {
                if !self.joins.is_empty() {
                    return Ok(Step::Idle);
                }
                self.phase_exhausted(st, status).await
            }
        }
    }

    fn split_oversized(
        &self,
        st: &mut ProjectState,
        in_flight: &HashSet<TaskId>,
        escalated: &HashSet<TaskId>,
    ) -> Result<(), OrchestratorError> {
        let split = &self.split;
        let (_, applied) = st.store.update(|list| {
            let plans = plan_splits(list, None, in_flight, escalated, split);
            apply_splits(list, &plans)
        })?;
        for (task_id, children) in applied {
            tracing::info!(task = %task_id, children = ?children, "split oversized task");
            st.memory.record_action(&format!(
                "{} split into {}",
                task_id,
                children
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            self.shared
                .emit(OrchestratorEvent::TaskSplit { task_id, children });
        }
        Ok(())
    }

    /// The current phase has no open tasks left in scope.
    async fn phase_exhausted(
        &mut self,
        st: &mut ProjectState,
        status: WorkflowStatus,
    ) -> Result<Step, OrchestratorError> {
        if !status.is_gate() {
            let transition = st.workflow.finish_implementation(&st.gates);
            self.apply_transition(st, status, transition, Vec::new())?;
            return Ok(Step::Progress);
        }

        let outputs = st.workflow.gate_outputs.clone();
        let report = self.shared.gate.evaluate(status, &outputs).await?;
        let blocking: Vec<String> = report.blocking().map(|f| f.text.clone()).collect();
        for finding in report.advisory() {
            st.memory
                .record_lesson(&format!("{}: {}", status.title(), finding.text));
        }
        tracing::info!(
            phase = %status,
            passed = report.passed(),
            blocking = blocking.len(),
            "gate evaluated"
        );
        self.shared.emit(OrchestratorEvent::GateEvaluated {
            phase: status,
            passed: report.passed(),
            blocking: blocking.clone(),
            advisory: report.advisory().count(),
        });

        let transition = st.workflow.complete_gate(&report, &st.gates);
        self.apply_transition(st, status, transition, blocking)?;
        st.persist_memory(&self.shared.config)?;
        Ok(Step::Progress)
    }

    /// Inject the tasks a transition calls for, persist, and announce it.
    fn apply_transition(
        &self,
        st: &mut ProjectState,
        from: WorkflowStatus,
        transition: Transition,
        findings: Vec<String>,
    ) -> Result<(), OrchestratorError> {
        match &transition {
            Transition::EnterGate {
                phase,
                section,
                pass,
            } => {
                let gate = Arc::clone(&self.shared.gate);
                let (_, ids) = st.store.update(|list| {
                    let tasks = gate.tasks_for(*phase, list);
                    if tasks.is_empty() {
                        Vec::new()
                    } else {
                        list.add_tasks(section, tasks)
                    }
                })?;
                tracing::info!(phase = %phase, pass, tasks = ?ids, "gate started");
            }
            Transition::Regress {
                from: failed,
                section,
            } => {
                let role = Role::new(&self.shared.config.toml.remediation.role);
                let count = findings.len();
                let (_, ids) = st.store.update(|list| {
                    list.add_tasks(
                        section,
                        findings.into_iter().map(|f| (role.clone(), f)).collect(),
                    )
                })?;
                st.memory.record_action(&format!(
                    "{} gate failed with {} blocking finding(s)",
                    failed.title(),
                    count
                ));
                tracing::warn!(phase = %failed, tasks = ?ids, "remediation tasks injected");
            }
            Transition::AwaitAcceptance => {}
        }
        st.persist_workflow(&self.shared.config)?;
        self.shared.emit(OrchestratorEvent::PhaseChanged {
            from,
            to: st.workflow.status,
        });
        Ok(())
    }

    fn fresh_preamble(&self, role: &Role) -> String {
        let mut preamble = role_preamble(&self.project, role);
        if let Some(ref spec) = self.spec_excerpt {
            preamble.push_str("\n\n## Project Spec (excerpt)\n");
            preamble.push_str(spec);
        }
        preamble
    }

    fn spawn_dispatch(&mut self, st: &mut ProjectState, list: &TaskList, unit: DispatchUnit) {
        let config = &self.shared.config;
        let tasks: Vec<WorkItem> = unit
            .task_ids
            .iter()
            .filter_map(|id| list.task(*id))
            .map(|t| WorkItem {
                id: t.id,
                description: t.description.clone(),
                prior_error: t.last_error.clone(),
            })
            .collect();
        for id in &unit.task_ids {
            st.in_flight.insert(*id, unit.role.clone());
        }
        self.active_units += 1;

        let ticket = st.sessions.prepare(&unit.role);
        if let Some(reason) = ticket.reset {
            self.shared.emit(OrchestratorEvent::SessionReset {
                role: unit.role.clone(),
                reason,
            });
        }

        let memory_cfg = &config.toml.memory;
        let sibling_tasks = unit
            .task_ids
            .first()
            .map(|first| {
                list.open_siblings(*first, memory_cfg.sibling_tasks + unit.task_ids.len())
                    .into_iter()
                    .filter(|t| !unit.task_ids.contains(&t.id))
                    .take(memory_cfg.sibling_tasks)
                    .map(|t| format!("{}: {}", t.id, t.description))
                    .collect()
            })
            .unwrap_or_default();
        let context = DispatchContext {
            recent_decisions: st.memory.recent_decisions(memory_cfg.context_decisions),
            sibling_tasks,
            stale_files: Vec::new(),
        };

        let descriptions: Vec<&str> = tasks.iter().map(|t| t.description.as_str()).collect();
        let route = self.router.route(&unit.role, &descriptions);
        let preamble = ticket
            .is_fresh()
            .then(|| self.fresh_preamble(&unit.role));

        let job = DispatchJob {
            dispatch_id: Uuid::new_v4(),
            unit,
            tasks,
            context,
            preamble,
            resume_token: ticket.resume_token,
            stale_since: ticket.stale_since,
            stale_cap: st.sessions.config().stale_file_cap,
            project_dir: config.project_dir.clone(),
            route,
        };
        tracing::debug!(
            role = %job.unit.role,
            section = %job.unit.section,
            tasks = ?job.unit.task_ids,
            resumed = job.resume_token.is_some(),
            "dispatch queued"
        );
        self.joins.spawn(dispatch(
            Arc::clone(&self.shared),
            self.pool.clone(),
            self.cancel.child_token(),
            job,
        ));
    }

    async fn on_joined(
        &mut self,
        joined: Result<DispatchResult, JoinError>,
    ) -> Result<(), OrchestratorError> {
        let result = joined.map_err(|e| {
            OrchestratorError::Critical(format!("dispatch task failed: {}", e))
        })?;
        self.active_units = self.active_units.saturating_sub(1);
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.state.lock().await;
        let st = &mut *guard;
        for id in &result.unit.task_ids {
            st.in_flight.remove(id);
        }
        self.complete_dispatch(st, result)
    }

    /// Apply a finished dispatch to the task list, sessions, memory and
    /// workflow.
    fn complete_dispatch(
        &self,
        st: &mut ProjectState,
        result: DispatchResult,
    ) -> Result<(), OrchestratorError> {
        let DispatchResult {
            unit,
            outcome,
            prompt_chars,
        } = result;
        let role = &unit.role;

        let per_task: Vec<(TaskId, TaskOutcome)> = match outcome {
            WorkerOutcome::Success {
                output,
                usage,
                session_token,
            } => {
                let usage = usage.unwrap_or(ContextUsage::Estimated {
                    prompt_chars,
                    output_chars: output.chars().count(),
                });
                st.sessions
                    .record_success(role, session_token, usage, unit.task_ids.len() as u32);
                let failures: HashMap<TaskId, String> = if unit.task_ids.len() > 1 {
                    extract_failures(&output)
                        .into_iter()
                        .filter(|(id, _)| unit.task_ids.contains(id))
                        .collect()
                } else {
                    HashMap::new()
                };
                unit.task_ids
                    .iter()
                    .map(|id| match failures.get(id) {
                        Some(reason) => (
                            *id,
                            TaskOutcome::RecoverableError {
                                message: reason.clone(),
                            },
                        ),
                        None => (
                            *id,
                            TaskOutcome::Success {
                                output: output.clone(),
                            },
                        ),
                    })
                    .collect()
            }
            WorkerOutcome::RecoverableError { message } => unit
                .task_ids
                .iter()
                .map(|id| {
                    (
                        *id,
                        TaskOutcome::RecoverableError {
                            message: message.clone(),
                        },
                    )
                })
                .collect(),
            WorkerOutcome::Timeout { elapsed } => unit
                .task_ids
                .iter()
                .map(|id| (*id, TaskOutcome::Timeout { elapsed }))
                .collect(),
            WorkerOutcome::Unrecoverable { message } => {
                tracing::warn!(role = %role, error = %message, "worker session unusable");
                unit.task_ids
                    .iter()
                    .map(|id| {
                        (
                            *id,
                            TaskOutcome::Unrecoverable {
                                message: message.clone(),
                            },
                        )
                    })
                    .collect()
            }
            WorkerOutcome::Cancelled => {
                tracing::debug!(role = %role, tasks = ?unit.task_ids, "dispatch cancelled");
                return Ok(());
            }
        };

        let policy = &self.policy;
        let (_, verdicts) = st.store.update(|list| {
            let mut verdicts: Vec<(Task, Verdict)> = Vec::new();
            for (id, outcome) in &per_task {
                let Some(task) = list.task(*id) else {
                    continue;
                };
                // Completion is idempotent: a task already done stays done.
                if !task.is_open() {
                    continue;
                }
                let task = task.clone();
                let verdict = policy.evaluate(&task, outcome);
                match &verdict.action {
                    PolicyAction::Complete { .. } => {
                        list.mark_done(*id);
                    }
                    PolicyAction::Retry { error_summary, .. } => {
                        list.record_failure(*id, error_summary);
                    }
                    PolicyAction::Escalate(escalation) => {
                        list.set_last_error(*id, &escalation.error);
                    }
                    PolicyAction::Abandon => {}
                }
                verdicts.push((task, verdict));
            }
            verdicts
        })?;

        if verdicts.iter().any(|(_, verdict)| verdict.reset_session) {
            st.sessions.mark_unrecoverable(role);
        }
        for (task, verdict) in verdicts {
            match verdict.action {
                PolicyAction::Complete { decisions } => {
                    for decision in &decisions {
                        st.memory.record_decision(decision);
                    }
                    st.memory.record_action(&format!(
                        "{} completed by {}: {}",
                        task.id, task.role, task.description
                    ));
                    if st.workflow.active_section.as_deref() == Some(task.section.as_str())
                        && let Some((_, TaskOutcome::Success { output })) =
                            per_task.iter().find(|(id, _)| *id == task.id)
                    {
                        st.workflow.record_gate_output(task.id, output);
                    }
                    tracing::info!(task = %task.id, role = %task.role, "task completed");
                    self.shared.emit(OrchestratorEvent::TaskCompleted {
                        task_id: task.id,
                        role: task.role.clone(),
                        description: task.description.clone(),
                    });
                }
                PolicyAction::Retry {
                    attempt,
                    error_summary,
                } => {
                    tracing::warn!(
                        task = %task.id,
                        attempt,
                        max_retries = self.policy.max_retries,
                        error = %error_summary,
                        "task failed, retrying"
                    );
                    self.shared.emit(OrchestratorEvent::TaskRetrying {
                        task_id: task.id,
                        attempt,
                        error: error_summary,
                    });
                }
                PolicyAction::Escalate(escalation) => {
                    tracing::warn!(
                        task = %task.id,
                        kind = %escalation.kind,
                        error = %escalation.error,
                        "task escalated"
                    );
                    st.memory.record_action(&format!(
                        "{} escalated ({}): {}",
                        task.id, escalation.kind, escalation.error
                    ));
                    st.workflow.add_escalation(escalation.clone());
                    self.shared
                        .emit(OrchestratorEvent::EscalationRaised { escalation });
                }
                PolicyAction::Abandon => {}
            }
        }

        st.persist_workflow(&self.shared.config)?;
        st.persist_memory(&self.shared.config)?;
        Ok(())
    }

    /// Wind the run down on every exit path: cancel and drain dispatches,
    /// clear in-flight marks, reset sessions when stopping, release the run
    /// slot and lock, and emit the final event.
    async fn finish(
        mut self,
        result: Result<End, OrchestratorError>,
    ) -> Result<RunOutcome, OrchestratorError> {
        self.cancel.cancel();
        self.pool.close();

        let drain = async {
            while let Some(joined) = self.joins.join_next().await {
                if let Ok(done) = joined {
                    let shared = Arc::clone(&self.shared);
                    let mut guard = shared.state.lock().await;
                    let st = &mut *guard;
                    for id in &done.unit.task_ids {
                        st.in_flight.remove(id);
                    }
                    if let Err(e) = self.complete_dispatch(st, done) {
                        tracing::warn!(error = %e, "failed to record dispatch while stopping");
                    }
                }
            }
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            tracing::warn!("dispatches did not stop in time, aborting");
            self.joins.abort_all();
            while self.joins.join_next().await.is_some() {}
        }
        self.active_units = 0;

        let stopped = !matches!(result, Ok(End::Complete));
        let summary = {
            let mut guard = self.shared.state.lock().await;
            let st = &mut *guard;
            st.in_flight.clear();
            if stopped {
                for role in st.sessions.reset_all(ResetReason::ForceStop) {
                    self.shared.emit(OrchestratorEvent::SessionReset {
                        role,
                        reason: ResetReason::ForceStop,
                    });
                }
            }
            if let Err(e) = st.persist_workflow(&self.shared.config) {
                tracing::warn!(error = %e, "failed to persist workflow state");
            }
            let summary = &self.shared.config.summary_file;
            summary.exists().then(|| summary.clone())
        };

        let stop_reason = self.shared.release_run();
        match result {
            Ok(End::Complete) => {
                tracing::info!(project = %self.project, "work complete");
                self.shared
                    .emit(OrchestratorEvent::WorkComplete { summary });
                Ok(RunOutcome::Complete)
            }
            Ok(End::Cancelled) => {
                let reason = stop_reason.unwrap_or_else(|| "stopped".to_string());
                tracing::info!(project = %self.project, reason = %reason, "work stopped");
                self.shared.emit(OrchestratorEvent::WorkStopped {
                    reason: reason.clone(),
                });
                Ok(RunOutcome::Stopped { reason })
            }
            Err(e) => {
                tracing::error!(project = %self.project, error = %e, "orchestrator halted");
                self.shared.emit(OrchestratorEvent::CriticalError {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

/// One dispatch: wait for a slot, invoke the worker, forward its events.
async fn dispatch(
    shared: Arc<Shared>,
    pool: DispatchPool,
    cancel: CancellationToken,
    job: DispatchJob,
) -> DispatchResult {
    let DispatchJob {
        dispatch_id,
        unit,
        tasks,
        mut context,
        preamble,
        resume_token,
        stale_since,
        stale_cap,
        project_dir,
        route,
    } = job;

    let permit = match pool.acquire(&unit.role, &cancel).await {
        Ok(permit) => permit,
        Err(e) => {
            tracing::debug!(role = %unit.role, error = %e, "dispatch slot not acquired");
            return DispatchResult {
                unit,
                outcome: WorkerOutcome::Cancelled,
                prompt_chars: 0,
            };
        }
    };
    let started = Instant::now();

    if let Some(since) = stale_since {
        let dir = project_dir.clone();
        let mut files = tokio::task::spawn_blocking(move || {
            modified_since(&dir, since, stale_cap + OWN_FILES.len())
        })
        .await
        .unwrap_or_default();
        files.retain(|p| !OWN_FILES.iter().any(|own| p.as_os_str() == *own));
        files.truncate(stale_cap);
        context.stale_files = files;
    }

    let prompt = build_prompt(preamble.as_deref(), &tasks, &context);
    let prompt_chars = prompt.chars().count();
    let request = WorkerRequest {
        dispatch_id,
        role: unit.role.clone(),
        section: unit.section.clone(),
        tasks,
        context,
        preamble,
        resume_token,
        model: route.model.clone(),
        timeout: route.timeout,
        prompt,
    };

    tracing::info!(
        role = %unit.role,
        tasks = ?unit.task_ids,
        resumed = request.is_resumed(),
        timeout_secs = route.timeout.as_secs(),
        "dispatch started"
    );
    shared.emit(OrchestratorEvent::DispatchStarted {
        dispatch_id,
        role: unit.role.clone(),
        section: unit.section.clone(),
        task_ids: unit.task_ids.clone(),
        resumed: request.is_resumed(),
        model: route.model,
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let forward = {
        let shared = Arc::clone(&shared);
        let role = unit.role.clone();
        AbortOnDropHandle::new(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                shared.emit(OrchestratorEvent::WorkerOutput {
                    dispatch_id,
                    role: role.clone(),
                    event,
                });
            }
        }))
    };

    // Both handles abort their task when this dispatch is dropped, so an
    // aborted dispatch never leaves a worker running behind it.
    let worker = Arc::clone(&shared.worker);
    let invocation =
        AbortOnDropHandle::new(tokio::spawn(async move { worker.invoke(request, tx, cancel).await }));
    let outcome = match invocation.await {
        Ok(outcome) => outcome,
        Err(e) => WorkerOutcome::RecoverableError {
            message: format!("worker panicked: {}", e),
        },
    };
    let _ = forward.await;
    drop(permit);

    let elapsed = started.elapsed();
    tracing::info!(
        role = %unit.role,
        tasks = ?unit.task_ids,
        outcome = outcome.label(),
        elapsed_ms = elapsed.as_millis() as u64,
        "dispatch finished"
    );
    shared.emit(OrchestratorEvent::DispatchCompleted {
        dispatch_id,
        role: unit.role.clone(),
        task_ids: unit.task_ids.clone(),
        outcome: outcome.label().to_string(),
        elapsed_ms: elapsed.as_millis() as u64,
    });

    DispatchResult {
        unit,
        outcome,
        prompt_chars,
    }
}
