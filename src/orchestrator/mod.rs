//! Orchestrator root.
//!
//! Owns one project's state and exposes the control interface. `start_work`
//! spawns the coordinating loop (see `run`), which schedules tasks, admits
//! dispatches through the [`DispatchPool`], applies the retry policy to
//! outcomes and drives the workflow state machine. Every control also works
//! against a project with no active run by mutating the persisted state,
//! and reports whether it changed anything.
//!
//! Observers subscribe to a broadcast stream of [`OrchestratorEvent`]s.

pub mod events;
mod plan;
mod run;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::crew_config::{CrewToml, GatesSection};
use crate::dispatch::DispatchPool;
use crate::errors::OrchestratorError;
use crate::memory::{MemoryCaps, MemoryLog};
use crate::policy::{Escalation, Resolution, apply_resolution};
use crate::session::{SessionConfig, SessionTracker};
use crate::tasks::types::single_line;
use crate::tasks::{Role, TaskCounts, TaskId, TaskStore};
use crate::util::FileLock;
use crate::worker::Worker;
use crate::workflow::{QualityGate, WorkflowState, WorkflowStatus};

pub use events::{EVENT_CAPACITY, OrchestratorEvent};
pub use plan::{PLANNER_ROLE, PlanKind, PlanOutcome};

/// How long `force_stop` waits for the loop to wind down.
const STOP_GRACE: Duration = Duration::from_secs(15);

/// Whether a control changed anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Applied,
    NoOp(String),
}

impl ControlOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, ControlOutcome::Applied)
    }
}

/// How a run ended without a critical error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The workflow reached done.
    Complete,
    /// Force-stopped, or stopped by an escalation resolution.
    Stopped { reason: String },
}

/// Handle to an active run.
pub struct RunHandle {
    join: JoinHandle<Result<RunOutcome, OrchestratorError>>,
}

impl RunHandle {
    /// Wait for the run to end.
    pub async fn wait(self) -> Result<RunOutcome, OrchestratorError> {
        self.join
            .await
            .map_err(|e| OrchestratorError::Critical(format!("coordinating loop failed: {}", e)))?
    }
}

/// Point-in-time view of a project.
#[derive(Debug, Clone)]
pub struct ProjectSnapshot {
    pub project: String,
    pub status: WorkflowStatus,
    pub cycle: u32,
    pub counts: TaskCounts,
    pub active_section: Option<String>,
    pub escalations: Vec<Escalation>,
    pub gates: GatesSection,
    pub in_flight: Vec<TaskId>,
    pub running: bool,
    pub paused: bool,
}

/// Mutable project state, guarded by one lock.
pub(crate) struct ProjectState {
    pub(crate) store: TaskStore,
    pub(crate) workflow: WorkflowState,
    pub(crate) sessions: SessionTracker,
    pub(crate) memory: MemoryLog,
    pub(crate) gates: GatesSection,
    /// Tasks currently dispatched, with the role running them.
    pub(crate) in_flight: HashMap<TaskId, Role>,
}

impl ProjectState {
    pub(crate) fn persist_workflow(&self, config: &Config) -> Result<(), OrchestratorError> {
        self.workflow
            .save(&config.state_file)
            .map_err(|source| OrchestratorError::Persist {
                what: "workflow state",
                path: config.state_file.clone(),
                source,
            })
    }

    pub(crate) fn persist_memory(&self, config: &Config) -> Result<(), OrchestratorError> {
        self.memory
            .save(&config.memory_file)
            .map_err(|source| OrchestratorError::Persist {
                what: "memory",
                path: config.memory_file.clone(),
                source,
            })
    }

    /// Write SUMMARY.md; failures are logged, not fatal.
    pub(crate) fn write_summary(&self, config: &Config) -> Option<std::path::PathBuf> {
        let list = match self.store.load() {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read task list for summary");
                return None;
            }
        };
        match crate::summary::write(config, &list, &self.memory, &self.workflow) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "failed to write summary");
                None
            }
        }
    }
}

struct ActiveRun {
    cancel: CancellationToken,
    pool: DispatchPool,
    stop_reason: Option<String>,
    _lock: FileLock,
}

pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) worker: Arc<dyn Worker>,
    pub(crate) gate: Arc<dyn QualityGate>,
    events: broadcast::Sender<OrchestratorEvent>,
    pub(crate) wake: Notify,
    pub(crate) paused: watch::Sender<bool>,
    running: watch::Sender<bool>,
    pub(crate) state: Mutex<ProjectState>,
    run: std::sync::Mutex<Option<ActiveRun>>,
}

impl Shared {
    pub(crate) fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn run_slot(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.run_slot().is_some()
    }

    /// Cancel the active run, if any.
    pub(crate) fn request_stop(&self, reason: &str) -> bool {
        let mut slot = self.run_slot();
        let Some(run) = slot.as_mut() else {
            return false;
        };
        if run.stop_reason.is_none() {
            tracing::info!(reason, "stopping run");
            run.stop_reason = Some(reason.to_string());
        }
        run.cancel.cancel();
        run.pool.close();
        drop(slot);
        self.wake.notify_one();
        true
    }

    /// Release the run slot and its lock at the end of a run.
    pub(crate) fn release_run(&self) -> Option<String> {
        let run = self.run_slot().take();
        self.running.send_replace(false);
        self.paused.send_replace(false);
        run.and_then(|r| r.stop_reason)
    }
}

/// Coordinates one project's workers.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        worker: Arc<dyn Worker>,
        gate: Arc<dyn QualityGate>,
    ) -> Result<Self, OrchestratorError> {
        let sessions = SessionTracker::new(SessionConfig::from_section(&config.toml.session)?);
        let workflow = WorkflowState::load(&config.state_file)?;
        let memory = MemoryLog::load(&config.memory_file, MemoryCaps::from(&config.toml.memory))?;
        let store = TaskStore::new(config.todo_file.clone(), config.todo_lock_file());
        let gates = config.toml.gates;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (paused, _) = watch::channel(false);
        let (running, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                worker,
                gate,
                events,
                wake: Notify::new(),
                paused,
                running,
                state: Mutex::new(ProjectState {
                    store,
                    workflow,
                    sessions,
                    memory,
                    gates,
                    in_flight: HashMap::new(),
                }),
                run: std::sync::Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    pub async fn snapshot(&self) -> Result<ProjectSnapshot, OrchestratorError> {
        let st = self.shared.state.lock().await;
        let list = st.store.load()?;
        let mut in_flight: Vec<TaskId> = st.in_flight.keys().copied().collect();
        in_flight.sort();
        Ok(ProjectSnapshot {
            project: self.shared.config.project_name(),
            status: st.workflow.status,
            cycle: st.workflow.cycle,
            counts: list.counts(),
            active_section: st.workflow.active_section.clone(),
            escalations: st.workflow.escalations.clone(),
            gates: st.gates,
            in_flight,
            running: self.is_running(),
            paused: self.is_paused(),
        })
    }

    /// Start the coordinating loop. Fails with `SchedulingConflict` when a
    /// run is already active for the project, in this process or another.
    pub fn start_work(&self) -> Result<RunHandle, OrchestratorError> {
        let (cancel, pool) = self.claim_run(self.shared.config.toml.execution.max_parallel)?;
        tracing::info!(
            project = %self.shared.config.project_name(),
            max_parallel = pool.capacity(),
            "starting work"
        );
        let join = tokio::spawn(run::run(self.shared.clone(), cancel, pool));
        Ok(RunHandle { join })
    }

    /// Take the project's run slot and run lock. Released by
    /// `Shared::release_run`.
    fn claim_run(
        &self,
        max_parallel: usize,
    ) -> Result<(CancellationToken, DispatchPool), OrchestratorError> {
        let config = &self.shared.config;
        let project = config.project_name();
        let mut slot = self.shared.run_slot();
        if slot.is_some() {
            return Err(OrchestratorError::SchedulingConflict { project });
        }
        config.ensure_directories()?;
        let lock_path = config.run_lock_file();
        let lock = FileLock::try_acquire(&lock_path).map_err(|e| OrchestratorError::Persist {
            what: "run lock",
            path: lock_path.clone(),
            source: e.into(),
        })?;
        let Some(lock) = lock else {
            return Err(OrchestratorError::SchedulingConflict { project });
        };

        let cancel = CancellationToken::new();
        let pool = DispatchPool::new(max_parallel);
        *slot = Some(ActiveRun {
            cancel: cancel.clone(),
            pool: pool.clone(),
            stop_reason: None,
            _lock: lock,
        });
        drop(slot);

        self.shared.paused.send_replace(false);
        self.shared.running.send_replace(true);
        Ok((cancel, pool))
    }

    /// Stop starting new dispatches; in-flight ones finish.
    pub fn pause(&self) -> ControlOutcome {
        if !self.is_running() {
            return ControlOutcome::NoOp("no active run".into());
        }
        let changed = self.shared.paused.send_if_modified(|paused| {
            let was = *paused;
            *paused = true;
            !was
        });
        if !changed {
            return ControlOutcome::NoOp("already paused".into());
        }
        tracing::info!("work paused");
        self.shared.emit(OrchestratorEvent::WorkPaused);
        ControlOutcome::Applied
    }

    pub fn resume(&self) -> ControlOutcome {
        if !self.is_running() {
            return ControlOutcome::NoOp("no active run".into());
        }
        let changed = self.shared.paused.send_if_modified(|paused| {
            let was = *paused;
            *paused = false;
            was
        });
        if !changed {
            return ControlOutcome::NoOp("not paused".into());
        }
        tracing::info!("work resumed");
        self.shared.emit(OrchestratorEvent::WorkResumed);
        self.shared.wake.notify_one();
        ControlOutcome::Applied
    }

    /// Cancel every in-flight dispatch, release all slots, reset all
    /// sessions and end the run. Returns once the loop has wound down.
    pub async fn force_stop(&self) -> ControlOutcome {
        if !self.shared.request_stop("force stop requested") {
            return ControlOutcome::NoOp("no active run".into());
        }
        self.wait_stopped().await;
        ControlOutcome::Applied
    }

    async fn wait_stopped(&self) {
        let mut running = self.shared.running.subscribe();
        if tokio::time::timeout(STOP_GRACE, running.wait_for(|r| !*r))
            .await
            .is_err()
        {
            tracing::warn!("run did not stop within the grace period");
        }
    }

    /// Apply a human decision to a pending escalation.
    pub async fn resolve_escalation(
        &self,
        task_id: TaskId,
        resolution: Resolution,
    ) -> Result<ControlOutcome, OrchestratorError> {
        let config = &self.shared.config;
        let stop = {
            let mut guard = self.shared.state.lock().await;
            let st = &mut *guard;
            let Some(escalation) = st.workflow.escalation(task_id).cloned() else {
                return Err(OrchestratorError::NoPendingEscalation { id: task_id });
            };
            if let Resolution::Modify { description } = &resolution
                && description.trim().is_empty()
            {
                return Err(OrchestratorError::EmptyDescription);
            }

            let (_, effect) = st
                .store
                .update(|list| apply_resolution(list, task_id, &resolution))?;
            let effect = match effect {
                Ok(effect) => effect,
                Err(e) => {
                    // The task vanished from TODO.md; drop the stale escalation.
                    st.workflow.take_escalation(task_id);
                    st.persist_workflow(config)?;
                    return Err(e);
                }
            };
            st.workflow.take_escalation(task_id);

            let note = match &resolution {
                Resolution::Retry => format!("{} retried by user", task_id),
                Resolution::Skip => {
                    format!("{} skipped by user: {}", task_id, escalation.description)
                }
                Resolution::Modify { description } => {
                    format!("{} modified by user: {}", task_id, single_line(description))
                }
                Resolution::Remove => {
                    format!("{} removed by user: {}", task_id, escalation.description)
                }
                Resolution::Stop => format!("Work stopped by user on {}", task_id),
            };
            st.memory.record_action(&note);
            st.persist_workflow(config)?;
            st.persist_memory(config)?;
            tracing::info!(task = %task_id, resolution = %resolution.kind(), "escalation resolved");
            self.shared.emit(OrchestratorEvent::EscalationResolved {
                task_id,
                resolution: resolution.kind(),
            });
            effect.stop
        };

        if stop {
            self.shared
                .request_stop(&format!("stopped on escalation of {}", task_id));
        } else {
            self.shared.wake.notify_one();
        }
        Ok(ControlOutcome::Applied)
    }

    /// Toggle quality gates and persist them to crew.toml.
    pub async fn set_quality_gates(
        &self,
        gates: GatesSection,
    ) -> Result<ControlOutcome, OrchestratorError> {
        let config = &self.shared.config;
        let mut st = self.shared.state.lock().await;
        if st.gates == gates {
            return Ok(ControlOutcome::NoOp("quality gates unchanged".into()));
        }
        let mut toml = CrewToml::load_or_default(&config.crew_dir)?;
        toml.gates = gates;
        let path = config.config_file();
        std::fs::create_dir_all(&config.crew_dir)
            .map_err(anyhow::Error::from)
            .and_then(|_| toml.save(&path))
            .map_err(|source| OrchestratorError::Persist {
                what: "configuration",
                path,
                source,
            })?;
        st.gates = gates;
        tracing::info!(
            testing = gates.testing,
            security_review = gates.security_review,
            qa = gates.qa,
            "quality gates updated"
        );
        self.shared.wake.notify_one();
        Ok(ControlOutcome::Applied)
    }

    /// Manual override: set the workflow status directly, bypassing gates.
    pub async fn set_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<ControlOutcome, OrchestratorError> {
        let config = &self.shared.config;
        let mut guard = self.shared.state.lock().await;
        let st = &mut *guard;
        let cycle = st.workflow.cycle;
        let Some(from) = st.workflow.override_status(status) else {
            return Ok(ControlOutcome::NoOp(format!("status is already {}", status)));
        };
        if st.workflow.cycle != cycle {
            st.sessions.begin_cycle();
        }
        st.memory
            .record_action(&format!("Status manually set from {} to {}", from, status));
        st.persist_workflow(config)?;
        st.persist_memory(config)?;
        self.shared
            .emit(OrchestratorEvent::PhaseChanged { from, to: status });
        if status == WorkflowStatus::Done {
            let summary = st.write_summary(config);
            if !self.is_running() {
                self.shared.emit(OrchestratorEvent::WorkComplete { summary });
            }
        }
        self.shared.wake.notify_one();
        Ok(ControlOutcome::Applied)
    }

    /// Approve user acceptance: the project is done.
    pub async fn approve_acceptance(&self) -> Result<ControlOutcome, OrchestratorError> {
        let config = &self.shared.config;
        let mut guard = self.shared.state.lock().await;
        let st = &mut *guard;
        st.workflow.approve()?;
        st.memory.record_action("Acceptance approved");
        st.persist_workflow(config)?;
        st.persist_memory(config)?;
        self.shared.emit(OrchestratorEvent::PhaseChanged {
            from: WorkflowStatus::UserAcceptance,
            to: WorkflowStatus::Done,
        });
        let summary = st.write_summary(config);
        if !self.is_running() {
            self.shared.emit(OrchestratorEvent::WorkComplete { summary });
        }
        self.shared.wake.notify_one();
        Ok(ControlOutcome::Applied)
    }

    /// Reject user acceptance: each requested change becomes a task and the
    /// project returns to in-progress.
    pub async fn reject_acceptance(
        &self,
        changes: &[String],
    ) -> Result<ControlOutcome, OrchestratorError> {
        let config = &self.shared.config;
        let changes: Vec<String> = changes
            .iter()
            .map(|c| single_line(c))
            .filter(|c| !c.is_empty())
            .collect();

        let mut guard = self.shared.state.lock().await;
        let st = &mut *guard;
        let mut workflow = st.workflow.clone();
        let section = workflow.reject()?;
        if changes.is_empty() {
            return Err(OrchestratorError::NoChangesRequested);
        }

        let role = Role::new(&config.toml.remediation.role);
        let count = changes.len();
        let (_, ids) = st.store.update(|list| {
            list.add_tasks(
                &section,
                changes.into_iter().map(|c| (role.clone(), c)).collect(),
            )
        })?;
        st.workflow = workflow;
        st.memory.record_action(&format!(
            "Acceptance rejected (round {}): {} change(s) requested",
            st.workflow.acceptance_rounds, count
        ));
        st.persist_workflow(config)?;
        st.persist_memory(config)?;
        tracing::info!(section = %section, tasks = ?ids, "acceptance rejected");
        self.shared.emit(OrchestratorEvent::PhaseChanged {
            from: WorkflowStatus::UserAcceptance,
            to: WorkflowStatus::InProgress,
        });
        self.shared.wake.notify_one();
        Ok(ControlOutcome::Applied)
    }
}
