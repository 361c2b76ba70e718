//! End-to-end tests for the orchestrator
//!
//! A scripted worker stands in for the external reasoning engine, so these
//! tests exercise scheduling, retries, escalations, gates, acceptance and
//! session handling through the public API only.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crew::config::Config;
use crew::crew_config::CrewToml;
use crew::errors::OrchestratorError;
use crew::orchestrator::{Orchestrator, OrchestratorEvent, PlanKind, RunOutcome};
use crew::policy::{EscalationKind, Resolution};
use crew::session::ResetReason;
use crew::tasks::{Role, TaskId, TaskList};
use crew::worker::{Worker, WorkerEvent, WorkerOutcome, WorkerRequest};
use crew::workflow::{GateOutput, GateReport, QualityGate, ReportGate, WorkflowStatus};

// =============================================================================
// Helpers
// =============================================================================

/// What the scripted worker does for one invocation.
enum Reply {
    Ok(String),
    Fail(String),
    Timeout,
    Lost(String),
    /// Run until cancelled.
    Hang,
    /// Never return, even when cancelled.
    Stubborn,
}

type Script = Box<dyn Fn(&WorkerRequest, u32) -> Reply + Send + Sync>;

/// Worker driven by a script. The script receives the request and the
/// 1-based attempt number of the request's first task (1 for requests
/// without tasks).
struct ScriptedWorker {
    script: Script,
    requests: Mutex<Vec<WorkerRequest>>,
    attempts: Mutex<HashMap<TaskId, u32>>,
    sessions: Mutex<HashMap<Role, u32>>,
    active_roles: Mutex<HashSet<Role>>,
    role_overlaps: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    /// Invocations dropped before they returned.
    abandoned: AtomicUsize,
}

impl ScriptedWorker {
    fn new(script: impl Fn(&WorkerRequest, u32) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            requests: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            active_roles: Mutex::new(HashSet::new()),
            role_overlaps: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
        })
    }

    fn succeeding() -> Arc<Self> {
        Self::new(|_, _| Reply::Ok("Done.".into()))
    }

    fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn requests_for(&self, id: u32) -> Vec<WorkerRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.task_ids().contains(&TaskId::new(id)))
            .collect()
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn invoke(
        &self,
        request: WorkerRequest,
        events: mpsc::UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> WorkerOutcome {
        // Planning dispatches carry no tasks.
        let attempt = match request.tasks.first() {
            Some(task) => {
                let mut attempts = self.attempts.lock().unwrap();
                let n = attempts.entry(task.id).or_insert(0);
                *n += 1;
                *n
            }
            None => 1,
        };
        self.requests.lock().unwrap().push(request.clone());
        if !self.active_roles.lock().unwrap().insert(request.role.clone()) {
            self.role_overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let reply = (self.script)(&request, attempt);
        if let Reply::Stubborn = reply {
            let _guard = DropCounter(&self.abandoned);
            return std::future::pending::<WorkerOutcome>().await;
        }
        let outcome = tokio::select! {
            _ = cancel.cancelled() => WorkerOutcome::Cancelled,
            outcome = async {
                match reply {
                    Reply::Hang => std::future::pending().await,
                    reply => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        self.finish(&request, reply, &events)
                    }
                }
            } => outcome,
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.active_roles.lock().unwrap().remove(&request.role);
        outcome
    }
}

impl ScriptedWorker {
    fn finish(
        &self,
        request: &WorkerRequest,
        reply: Reply,
        events: &mpsc::UnboundedSender<WorkerEvent>,
    ) -> WorkerOutcome {
        match reply {
            Reply::Ok(output) => {
                let n = {
                    let mut sessions = self.sessions.lock().unwrap();
                    let n = sessions.entry(request.role.clone()).or_insert(0);
                    *n += 1;
                    *n
                };
                let _ = events.send(WorkerEvent::Text {
                    text: output.clone(),
                });
                WorkerOutcome::Success {
                    output,
                    usage: None,
                    session_token: Some(format!("sess-{}-{}", request.role, n)),
                }
            }
            Reply::Fail(message) => WorkerOutcome::RecoverableError { message },
            Reply::Timeout => WorkerOutcome::Timeout {
                elapsed: Duration::from_secs(600),
            },
            Reply::Lost(message) => WorkerOutcome::Unrecoverable { message },
            Reply::Hang | Reply::Stubborn => WorkerOutcome::Cancelled,
        }
    }
}

/// Bumps its counter when dropped.
struct DropCounter<'a>(&'a AtomicUsize);

impl Drop for DropCounter<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Gate whose first `failures` evaluations return an error.
struct FailingGate {
    failures: usize,
    calls: AtomicUsize,
}

impl FailingGate {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl QualityGate for FailingGate {
    fn tasks_for(&self, phase: WorkflowStatus, list: &TaskList) -> Vec<(Role, String)> {
        ReportGate::new().tasks_for(phase, list)
    }

    async fn evaluate(
        &self,
        phase: WorkflowStatus,
        outputs: &[GateOutput],
    ) -> anyhow::Result<GateReport> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            anyhow::bail!("review service unavailable");
        }
        ReportGate::new().evaluate(phase, outputs).await
    }
}

/// Create an initialized project with the given TODO.md. Gates start off.
fn project(todo: &str, tweak: impl FnOnce(&mut CrewToml)) -> (TempDir, Config) {
    let dir = TempDir::new().unwrap();
    crew::init::init_project(dir.path(), Some("demo")).unwrap();
    fs::write(dir.path().join("TODO.md"), todo).unwrap();

    let mut toml = CrewToml::default();
    toml.project.name = Some("demo".into());
    toml.gates.testing = false;
    toml.gates.security_review = false;
    toml.gates.qa = false;
    tweak(&mut toml);

    let config = Config::from_parts(dir.path().canonicalize().unwrap(), toml);
    (dir, config)
}

fn orchestrator(config: Config, worker: &Arc<ScriptedWorker>) -> Orchestrator {
    gated_orchestrator(config, worker, Arc::new(ReportGate::new()))
}

fn gated_orchestrator(
    config: Config,
    worker: &Arc<ScriptedWorker>,
    gate: Arc<dyn QualityGate>,
) -> Orchestrator {
    Orchestrator::new(config, worker.clone(), gate).unwrap()
}

/// Something the test does in answer to an event.
enum Reaction {
    Approve,
    Reject(Vec<String>),
    Resolve(TaskId, Resolution),
    Pause,
    Resume,
    Stop,
}

async fn apply(orchestrator: &Orchestrator, reaction: Reaction) {
    match reaction {
        Reaction::Approve => {
            orchestrator.approve_acceptance().await.unwrap();
        }
        Reaction::Reject(changes) => {
            orchestrator.reject_acceptance(&changes).await.unwrap();
        }
        Reaction::Resolve(id, resolution) => {
            orchestrator.resolve_escalation(id, resolution).await.unwrap();
        }
        Reaction::Pause => {
            assert!(orchestrator.pause().changed());
        }
        Reaction::Resume => {
            assert!(orchestrator.resume().changed());
        }
        Reaction::Stop => {
            orchestrator.force_stop().await;
        }
    }
}

/// Start a run and observe it to the end, reacting to events as they come.
async fn drive(
    orchestrator: &Orchestrator,
    mut react: impl FnMut(&OrchestratorEvent) -> Option<Reaction>,
) -> (Result<RunOutcome, OrchestratorError>, Vec<OrchestratorEvent>) {
    let mut events = orchestrator.subscribe();
    let handle = orchestrator.start_work().unwrap();
    let wait = handle.wait();
    tokio::pin!(wait);

    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            tokio::select! {
                result = &mut wait => break result,
                event = events.recv() => {
                    let Ok(event) = event else { continue };
                    if let Some(reaction) = react(&event) {
                        apply(orchestrator, reaction).await;
                    }
                    seen.push(event);
                }
            }
        }
    })
    .await
    .expect("run did not finish in time");

    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    (result, seen)
}

/// Approve acceptance as soon as it is requested.
fn approve_all(event: &OrchestratorEvent) -> Option<Reaction> {
    matches!(event, OrchestratorEvent::AwaitingAcceptance { .. }).then_some(Reaction::Approve)
}

fn count(events: &[OrchestratorEvent], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}

fn memory(dir: &TempDir) -> String {
    fs::read_to_string(dir.path().join("MEMORY.md")).unwrap()
}

fn todo(dir: &TempDir) -> String {
    fs::read_to_string(dir.path().join("TODO.md")).unwrap()
}

// =============================================================================
// Scheduling
// =============================================================================

mod scheduling {
    use super::*;

    const FIVE_ROLES: &str = "# Demo - TODO\n\n## Build\n\
        - [ ] T1 @engineer Add the login form\n\
        - [ ] T2 @database Create the users table\n\
        - [ ] T3 @ui Style the header\n\
        - [ ] T4 @qa Write the smoke checklist\n\
        - [ ] T5 @docs Document the setup\n";

    #[tokio::test]
    async fn test_runs_all_tasks_in_order_within_the_limit() {
        let (dir, config) = project(FIVE_ROLES, |t| t.execution.max_parallel = 2);
        let worker = ScriptedWorker::succeeding();
        let orch = orchestrator(config, &worker);

        let (result, events) = drive(&orch, approve_all).await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        let order: Vec<u32> = worker
            .requests()
            .iter()
            .map(|r| r.tasks[0].id.number())
            .collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, vec![1, 2, 3, 4, 5]);
        // Two slots: a task may overtake at most its immediate predecessor.
        for (i, n) in order.iter().enumerate() {
            assert!(*n as usize <= i + 2, "T{} started out of order: {:?}", n, order);
        }
        assert!(worker.peak() <= 2, "peak concurrency {}", worker.peak());
        assert_eq!(count(&events, "task_completed"), 5);
        assert_eq!(count(&events, "work_complete"), 1);

        let snapshot = orch.snapshot().await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Done);
        assert_eq!(snapshot.counts.open, 0);
        assert!(!snapshot.running);
        assert!(todo(&dir).contains("- [x] T5 @docs Document the setup"));
        assert!(dir.path().join("SUMMARY.md").exists());
    }

    #[tokio::test]
    async fn test_same_role_never_runs_concurrently() {
        let todo_md = "## Build\n\
            - [ ] T1 @engineer Add the login form\n\
            - [ ] T2 @engineer Add the logout button\n\
            - [ ] T3 @ui Style the header\n\
            - [ ] T4 @engineer Add the signup form\n";
        let (_dir, config) = project(todo_md, |t| t.execution.max_parallel = 3);
        let worker = ScriptedWorker::succeeding();
        let orch = orchestrator(config, &worker);

        let (result, _) = drive(&orch, approve_all).await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        assert_eq!(worker.role_overlaps.load(Ordering::SeqCst), 0);
        assert!(worker.peak() <= 2);
        assert_eq!(worker.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_batching_applies_partial_failures_per_task() {
        let todo_md = "## Build\n\
            - [ ] T1 @engineer Add the login form\n\
            - [ ] T2 @engineer Add the users migration\n";
        let (_dir, config) = project(todo_md, |t| {
            t.execution.max_parallel = 1;
            t.execution.batching = true;
        });
        let worker = ScriptedWorker::new(|req, _| {
            if req.tasks.len() == 2 {
                Reply::Ok("Form added.\n<failed>T2: migration tool missing</failed>".into())
            } else {
                Reply::Ok("Migration added.".into())
            }
        });
        let orch = orchestrator(config, &worker);

        let (result, events) = drive(&orch, approve_all).await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        let requests = worker.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].task_ids(), vec![TaskId::new(1), TaskId::new(2)]);
        assert_eq!(requests[1].task_ids(), vec![TaskId::new(2)]);
        let prior = requests[1].tasks[0].prior_error.as_deref().unwrap();
        assert!(prior.contains("migration tool missing"));
        assert_eq!(count(&events, "task_retrying"), 1);
    }

    #[tokio::test]
    async fn test_second_start_is_a_conflict() {
        let (_dir, config) = project("## Build\n- [ ] T1 @engineer Wait forever\n", |_| {});
        let worker = ScriptedWorker::new(|_, _| Reply::Hang);
        let orch = orchestrator(config.clone(), &worker);

        let handle = orch.start_work().unwrap();
        assert!(matches!(
            orch.start_work(),
            Err(OrchestratorError::SchedulingConflict { .. })
        ));

        let other = orchestrator(config, &worker);
        assert!(matches!(
            other.start_work(),
            Err(OrchestratorError::SchedulingConflict { .. })
        ));

        orch.force_stop().await;
        let outcome = handle.wait().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Stopped { .. }));
    }
}

// =============================================================================
// Retries and escalations
// =============================================================================

mod escalations {
    use super::*;

    #[tokio::test]
    async fn test_timeout_escalates_once_and_retry_requeues() {
        let (_dir, config) = project("## Build\n- [ ] T1 @engineer Slow task\n", |_| {});
        let worker = ScriptedWorker::new(|_, attempt| {
            if attempt == 1 {
                Reply::Timeout
            } else {
                Reply::Ok("Finished.".into())
            }
        });
        let orch = orchestrator(config, &worker);

        let (result, events) = drive(&orch, |event| match event {
            OrchestratorEvent::EscalationRaised { escalation } => {
                assert_eq!(escalation.options.len(), 5);
                assert!(matches!(escalation.kind, EscalationKind::Timeout { .. }));
                Some(Reaction::Resolve(escalation.task_id, Resolution::Retry))
            }
            other => approve_all(other),
        })
        .await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        assert_eq!(count(&events, "escalation_raised"), 1);
        assert_eq!(count(&events, "task_retrying"), 0);
        assert_eq!(worker.requests_for(1).len(), 2);
        assert!(orch.snapshot().await.unwrap().escalations.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate_and_skip_completes() {
        let (dir, config) = project("## Build\n- [ ] T1 @engineer Flaky task\n", |t| {
            t.retry.max_retries = 2;
        });
        let worker = ScriptedWorker::new(|_, attempt| Reply::Fail(format!("tests failed #{attempt}")));
        let orch = orchestrator(config, &worker);

        let (result, events) = drive(&orch, |event| match event {
            OrchestratorEvent::EscalationRaised { escalation } => {
                assert_eq!(
                    escalation.kind,
                    EscalationKind::RetriesExhausted { attempts: 3 }
                );
                Some(Reaction::Resolve(escalation.task_id, Resolution::Skip))
            }
            other => approve_all(other),
        })
        .await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        assert_eq!(count(&events, "task_retrying"), 2);
        let requests = worker.requests_for(1);
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].tasks[0].prior_error, None);
        assert!(
            requests[1].tasks[0]
                .prior_error
                .as_deref()
                .unwrap()
                .contains("tests failed #1")
        );
        assert!(todo(&dir).contains("- [x] T1"));
        assert!(memory(&dir).contains("T1 skipped by user"));
    }

    const TWO_SECTIONS: &str = "## Backend\n- [ ] T1 @engineer Broken task\n\n\
        ## Frontend\n- [ ] T2 @ui Working task\n";

    fn engineer_fails() -> Arc<ScriptedWorker> {
        ScriptedWorker::new(|req, _| {
            if req.role.as_str() == "engineer" {
                Reply::Fail("compile error".into())
            } else {
                Reply::Ok("Styled.".into())
            }
        })
    }

    #[tokio::test]
    async fn test_escalated_section_blocks_later_sections() {
        let (_dir, config) = project(TWO_SECTIONS, |t| t.retry.max_retries = 0);
        let worker = engineer_fails();
        let orch = orchestrator(config, &worker);

        let (result, events) = drive(&orch, |event| match event {
            OrchestratorEvent::Blocked { task_ids } => {
                assert_eq!(task_ids, &vec![TaskId::new(1)]);
                Some(Reaction::Resolve(TaskId::new(1), Resolution::Remove))
            }
            other => approve_all(other),
        })
        .await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        assert_eq!(worker.requests_for(2).len(), 1);
        assert_eq!(count(&events, "blocked"), 1);
        let blocked = events.iter().position(|e| e.name() == "blocked").unwrap();
        let frontend_start = events
            .iter()
            .position(|e| {
                matches!(e, OrchestratorEvent::DispatchStarted { section, .. } if section == "Frontend")
            })
            .unwrap();
        assert!(blocked < frontend_start, "Frontend ran before Backend was resolved");
        assert_eq!(orch.snapshot().await.unwrap().counts.total, 1);
    }

    #[tokio::test]
    async fn test_escalated_task_does_not_block_other_lanes_across_sections() {
        let (_dir, config) = project(TWO_SECTIONS, |t| {
            t.retry.max_retries = 0;
            t.execution.cross_section_parallel = true;
        });
        let worker = engineer_fails();
        let orch = orchestrator(config, &worker);

        let (result, events) = drive(&orch, |event| match event {
            OrchestratorEvent::Blocked { task_ids } => {
                assert_eq!(task_ids, &vec![TaskId::new(1)]);
                Some(Reaction::Resolve(TaskId::new(1), Resolution::Remove))
            }
            other => approve_all(other),
        })
        .await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        assert_eq!(worker.requests_for(2).len(), 1);
        let blocked = events.iter().position(|e| e.name() == "blocked").unwrap();
        let frontend_done = events
            .iter()
            .position(|e| {
                matches!(e, OrchestratorEvent::TaskCompleted { task_id, .. } if *task_id == TaskId::new(2))
            })
            .unwrap();
        assert!(frontend_done < blocked);
    }

    #[tokio::test]
    async fn test_stop_resolution_ends_the_run() {
        let (_dir, config) = project("## Build\n- [ ] T1 @engineer Hopeless\n", |t| {
            t.retry.max_retries = 0;
        });
        let worker = ScriptedWorker::new(|_, _| Reply::Fail("no".into()));
        let orch = orchestrator(config, &worker);

        let (result, events) = drive(&orch, |event| match event {
            OrchestratorEvent::EscalationRaised { escalation } => {
                Some(Reaction::Resolve(escalation.task_id, Resolution::Stop))
            }
            _ => None,
        })
        .await;

        assert!(matches!(result.unwrap(), RunOutcome::Stopped { .. }));
        assert_eq!(count(&events, "work_stopped"), 1);
        assert_eq!(orch.snapshot().await.unwrap().counts.open, 1);
    }
}

// =============================================================================
// Workflow
// =============================================================================

mod workflow {
    use super::*;

    #[tokio::test]
    async fn test_failed_security_gate_regresses_with_remediation_tasks() {
        let (dir, config) = project("## Build\n- [ ] T1 @engineer Add search\n", |t| {
            t.gates.security_review = true;
        });
        let worker = ScriptedWorker::new(|req, _| {
            if req.role.as_str() == "security" && req.section.contains("pass 1") {
                Reply::Ok(
                    "BLOCKING: SQL injection in search\n\
                     BLOCKING: Hardcoded API key\n\
                     ADVISORY: add rate limiting"
                        .into(),
                )
            } else if req.role.as_str() == "security" {
                Reply::Ok("No issues found.".into())
            } else {
                Reply::Ok("Done.".into())
            }
        });
        let orch = orchestrator(config, &worker);

        let (result, events) = drive(&orch, approve_all).await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        let verdicts: Vec<(bool, usize)> = events
            .iter()
            .filter_map(|e| match e {
                OrchestratorEvent::GateEvaluated {
                    phase,
                    passed,
                    blocking,
                    ..
                } => {
                    assert_eq!(*phase, WorkflowStatus::SecurityReview);
                    Some((*passed, blocking.len()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(verdicts, vec![(false, 2), (true, 0)]);
        assert!(events.iter().any(|e| matches!(
            e,
            OrchestratorEvent::PhaseChanged {
                from: WorkflowStatus::SecurityReview,
                to: WorkflowStatus::InProgress,
            }
        )));

        let remediation: Vec<WorkerRequest> = worker
            .requests()
            .into_iter()
            .filter(|r| r.section == "Remediation: Security Review (pass 1)")
            .collect();
        assert_eq!(remediation.len(), 2);
        assert!(remediation.iter().all(|r| r.role.as_str() == "engineer"));
        assert_eq!(remediation[0].tasks[0].description, "SQL injection in search");

        assert!(memory(&dir).contains("add rate limiting"));
        assert_eq!(orch.snapshot().await.unwrap().status, WorkflowStatus::Done);
    }

    #[tokio::test]
    async fn test_rejected_acceptance_adds_feedback_tasks() {
        let (dir, config) = project("## Build\n- [ ] T1 @engineer Build the page\n", |_| {});
        let worker = ScriptedWorker::succeeding();
        let orch = orchestrator(config, &worker);

        let (result, events) = drive(&orch, |event| match event {
            OrchestratorEvent::AwaitingAcceptance { round: 1 } => {
                Some(Reaction::Reject(vec!["Add dark mode".into()]))
            }
            OrchestratorEvent::AwaitingAcceptance { .. } => Some(Reaction::Approve),
            _ => None,
        })
        .await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        assert_eq!(count(&events, "awaiting_acceptance"), 2);
        let feedback = worker.requests_for(2);
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].section, "Acceptance feedback (round 1)");
        assert_eq!(feedback[0].tasks[0].description, "Add dark mode");
        assert!(todo(&dir).contains("## Acceptance feedback (round 1)"));
    }

    #[tokio::test]
    async fn test_controls_outside_their_phase_are_rejected() {
        let (_dir, config) = project("## Build\n- [ ] T1 @engineer Something\n", |_| {});
        let worker = ScriptedWorker::succeeding();
        let orch = orchestrator(config, &worker);

        assert!(matches!(
            orch.approve_acceptance().await,
            Err(OrchestratorError::InvalidTransition { .. })
        ));
        assert!(matches!(
            orch.resolve_escalation(TaskId::new(1), Resolution::Retry).await,
            Err(OrchestratorError::NoPendingEscalation { .. })
        ));
        assert!(!orch.pause().changed());
    }

    #[tokio::test]
    async fn test_gate_error_halts_the_run_and_a_new_run_recovers() {
        let (_dir, config) = project("## Build\n- [ ] T1 @engineer Add search\n", |t| {
            t.gates.security_review = true;
        });
        let worker = ScriptedWorker::succeeding();
        let gate = FailingGate::new(1);
        let orch = gated_orchestrator(config, &worker, gate.clone());

        let (result, events) = drive(&orch, approve_all).await;

        assert!(result.unwrap_err().is_critical());
        assert_eq!(count(&events, "critical_error"), 1);
        assert_eq!(count(&events, "work_complete"), 0);
        let snapshot = orch.snapshot().await.unwrap();
        assert!(snapshot.in_flight.is_empty());
        assert!(!snapshot.running);
        assert_eq!(snapshot.status, WorkflowStatus::SecurityReview);

        let (result, events) = drive(&orch, approve_all).await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        assert_eq!(count(&events, "critical_error"), 0);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 2);
        assert_eq!(orch.snapshot().await.unwrap().status, WorkflowStatus::Done);
    }

    #[tokio::test]
    async fn test_corrupted_task_list_mid_run_is_critical() {
        let original = "## Build\n- [ ] T1 @engineer Build the page\n";
        let (dir, config) = project(original, |_| {});
        let todo_path = dir.path().join("TODO.md");
        let worker = ScriptedWorker::new(move |_, attempt| {
            if attempt == 1 {
                fs::write(&todo_path, "## Build\n- [?] T1 garbled\n").unwrap();
            }
            Reply::Ok("Done.".into())
        });
        let orch = orchestrator(config, &worker);

        let (result, events) = drive(&orch, approve_all).await;

        assert!(result.unwrap_err().is_critical());
        assert_eq!(count(&events, "critical_error"), 1);
        assert!(matches!(
            orch.snapshot().await,
            Err(OrchestratorError::TaskList(_))
        ));

        fs::write(dir.path().join("TODO.md"), original).unwrap();
        let snapshot = orch.snapshot().await.unwrap();
        assert!(snapshot.in_flight.is_empty());
        assert!(!snapshot.running);

        let (result, events) = drive(&orch, approve_all).await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        assert_eq!(count(&events, "critical_error"), 0);
        assert!(todo(&dir).contains("- [x] T1"));
        assert!(orch.snapshot().await.unwrap().in_flight.is_empty());
    }
}

// =============================================================================
// Stop and sessions
// =============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_force_stop_cancels_in_flight_work() {
        let todo_md = "## Build\n\
            - [ ] T1 @engineer Long task\n\
            - [ ] T2 @ui Another long task\n";
        let (_dir, config) = project(todo_md, |t| t.execution.max_parallel = 2);
        let worker = ScriptedWorker::new(|_, _| Reply::Hang);
        let orch = orchestrator(config, &worker);

        let mut started = 0;
        let (result, events) = drive(&orch, |event| {
            if let OrchestratorEvent::DispatchStarted { .. } = event {
                started += 1;
                if started == 2 {
                    return Some(Reaction::Stop);
                }
            }
            None
        })
        .await;

        assert!(matches!(result.unwrap(), RunOutcome::Stopped { .. }));
        assert_eq!(count(&events, "work_stopped"), 1);
        assert_eq!(count(&events, "task_completed"), 0);

        let snapshot = orch.snapshot().await.unwrap();
        assert!(snapshot.in_flight.is_empty());
        assert!(!snapshot.running);
        assert_eq!(snapshot.counts.open, 2);
        assert!(snapshot.escalations.is_empty());
    }

    #[tokio::test]
    async fn test_force_stop_aborts_workers_that_ignore_cancellation() {
        let (_dir, config) = project("## Build\n- [ ] T1 @engineer Stubborn task\n", |_| {});
        let worker = ScriptedWorker::new(|_, _| Reply::Stubborn);
        let orch = orchestrator(config, &worker);

        let (result, _) = drive(&orch, |event| {
            matches!(event, OrchestratorEvent::DispatchStarted { .. }).then_some(Reaction::Stop)
        })
        .await;

        assert!(matches!(result.unwrap(), RunOutcome::Stopped { .. }));
        tokio::time::timeout(Duration::from_secs(2), async {
            while worker.abandoned.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker invocation outlived the run");
        assert_eq!(worker.abandoned.load(Ordering::SeqCst), 1);
        assert!(orch.snapshot().await.unwrap().in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_pause_holds_new_dispatches_until_resume() {
        let todo_md = "## Build\n\
            - [ ] T1 @engineer First\n\
            - [ ] T2 @ui Second\n";
        let (_dir, config) = project(todo_md, |t| t.execution.max_parallel = 1);
        let worker = ScriptedWorker::succeeding();
        let orch = orchestrator(config, &worker);

        let (result, events) = drive(&orch, |event| match event {
            OrchestratorEvent::DispatchStarted { task_ids, .. } if task_ids[0] == TaskId::new(1) => {
                Some(Reaction::Pause)
            }
            OrchestratorEvent::TaskCompleted { task_id, .. } if *task_id == TaskId::new(1) => {
                Some(Reaction::Resume)
            }
            other => approve_all(other),
        })
        .await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        let position = |name: &str| events.iter().position(|e| e.name() == name).unwrap();
        let second_start = events
            .iter()
            .position(|e| {
                matches!(e, OrchestratorEvent::DispatchStarted { task_ids, .. }
                    if task_ids[0] == TaskId::new(2))
            })
            .unwrap();
        assert!(position("work_paused") < position("work_resumed"));
        assert!(position("work_resumed") < second_start);
        assert!(!orch.is_paused());
    }

    #[tokio::test]
    async fn test_sessions_resume_until_the_task_cap() {
        let todo_md = "## Build\n\
            - [ ] T1 @engineer First\n\
            - [ ] T2 @engineer Second\n\
            - [ ] T3 @engineer Third\n";
        let (_dir, config) = project(todo_md, |t| {
            t.execution.max_parallel = 1;
            t.session.max_tasks_per_session = 2;
        });
        let worker = ScriptedWorker::succeeding();
        let orch = orchestrator(config, &worker);

        let (result, events) = drive(&orch, approve_all).await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        let requests = worker.requests();
        assert_eq!(requests.len(), 3);

        assert_eq!(requests[0].resume_token, None);
        assert!(requests[0].preamble.is_some());

        assert_eq!(requests[1].resume_token.as_deref(), Some("sess-engineer-1"));
        assert!(requests[1].preamble.is_none());

        assert_eq!(requests[2].resume_token, None);
        assert!(requests[2].preamble.is_some());
        assert!(events.iter().any(|e| matches!(
            e,
            OrchestratorEvent::SessionReset {
                reason: ResetReason::TaskCap,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_lost_session_resets_before_the_retry() {
        let todo_md = "## Build\n\
            - [ ] T1 @engineer First\n\
            - [ ] T2 @engineer Second\n";
        let (_dir, config) = project(todo_md, |t| t.execution.max_parallel = 1);
        let worker = ScriptedWorker::new(|req, attempt| {
            if req.tasks[0].id == TaskId::new(2) && attempt == 1 {
                Reply::Lost("session expired".into())
            } else {
                Reply::Ok("Done.".into())
            }
        });
        let orch = orchestrator(config, &worker);

        let (result, events) = drive(&orch, approve_all).await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        let second = worker.requests_for(2);
        assert_eq!(second.len(), 2);
        assert!(second[0].resume_token.is_some());
        assert_eq!(second[1].resume_token, None);
        assert!(events.iter().any(|e| matches!(
            e,
            OrchestratorEvent::SessionReset {
                reason: ResetReason::UnrecoverableError,
                ..
            }
        )));
    }
}

// =============================================================================
// Planning
// =============================================================================

mod planning {
    use super::*;

    /// Worker whose manager appends `tasks` to TODO.md and writes SPEC.md.
    fn planner(dir: &TempDir, tasks: &'static str) -> Arc<ScriptedWorker> {
        let todo_path = dir.path().join("TODO.md");
        let spec_path = dir.path().join("SPEC.md");
        ScriptedWorker::new(move |req, _| {
            if req.role.as_str() != "manager" {
                return Reply::Ok("Done.".into());
            }
            let mut todo = fs::read_to_string(&todo_path).unwrap();
            todo.push_str(tasks);
            fs::write(&todo_path, todo).unwrap();
            fs::write(&spec_path, "# Shop\n\nDark mode: follow the system theme.\n").unwrap();
            Reply::Ok("<decision>Themes live in CSS variables</decision>".into())
        })
    }

    #[tokio::test]
    async fn test_feature_plan_opens_a_cycle_with_fresh_sessions() {
        let (dir, config) = project("## Build\n- [ ] T1 @engineer Build the page\n", |_| {});
        let worker = planner(&dir, "\n## Dark mode\n- [ ] @engineer Add a theme toggle\n");
        let orch = orchestrator(config, &worker);

        let (result, _) = drive(&orch, approve_all).await;
        assert_eq!(result.unwrap(), RunOutcome::Complete);
        assert_eq!(orch.snapshot().await.unwrap().cycle, 1);

        let mut events = orch.subscribe();
        let plan = orch.plan(PlanKind::Feature, "Add dark mode").await.unwrap();
        assert_eq!(plan.cycle, 2);
        assert_eq!(plan.open_tasks, 1);
        assert_eq!(plan.added, 1);

        let manager = worker.requests().pop().unwrap();
        assert_eq!(manager.role.as_str(), "manager");
        assert!(manager.tasks.is_empty());
        assert_eq!(manager.resume_token, None);
        assert!(manager.prompt.contains("## Feature Request\nAdd dark mode"));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.iter().any(|e| matches!(
            e,
            OrchestratorEvent::PhaseChanged {
                from: WorkflowStatus::Done,
                to: WorkflowStatus::InProgress,
            }
        )));
        assert!(seen.contains(&OrchestratorEvent::PlanReady {
            cycle: 2,
            open_tasks: 1,
        }));

        let snapshot = orch.snapshot().await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::InProgress);
        assert!(!snapshot.running);
        assert!(todo(&dir).contains("- [ ] T2 @engineer Add a theme toggle"));
        assert!(memory(&dir).contains("Themes live in CSS variables"));

        let (result, events) = drive(&orch, approve_all).await;

        assert_eq!(result.unwrap(), RunOutcome::Complete);
        let toggle = worker.requests_for(2);
        assert_eq!(toggle.len(), 1);
        assert_eq!(toggle[0].resume_token, None);
        assert!(toggle[0].preamble.is_some());
        assert!(events.iter().any(|e| matches!(
            e,
            OrchestratorEvent::SessionReset {
                reason: ResetReason::NewCycle,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_failed_plan_keeps_the_cycle() {
        let (_dir, config) = project("## Build\n- [x] T1 @engineer Done\n", |_| {});
        let worker = ScriptedWorker::new(|_, _| Reply::Fail("no network".into()));
        let orch = orchestrator(config, &worker);

        assert!(matches!(
            orch.plan(PlanKind::Project, "   ").await,
            Err(OrchestratorError::EmptyPlanRequest)
        ));
        assert!(matches!(
            orch.plan(PlanKind::Project, "A shop").await,
            Err(OrchestratorError::PlanFailed(_))
        ));

        let snapshot = orch.snapshot().await.unwrap();
        assert_eq!(snapshot.cycle, 0);
        assert_eq!(snapshot.status, WorkflowStatus::Initialized);
        assert!(!snapshot.running);
        assert_eq!(worker.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_plan_without_open_tasks_fails() {
        let (dir, config) = project("## Build\n- [x] T1 @engineer Done\n", |_| {});
        let worker = planner(&dir, "");
        let orch = orchestrator(config, &worker);

        assert!(matches!(
            orch.plan(PlanKind::Project, "A shop").await,
            Err(OrchestratorError::PlanFailed(_))
        ));
        assert_eq!(orch.snapshot().await.unwrap().cycle, 0);
    }

    #[tokio::test]
    async fn test_plan_during_a_run_is_a_conflict() {
        let (_dir, config) = project("## Build\n- [ ] T1 @engineer Long task\n", |_| {});
        let worker = ScriptedWorker::new(|_, _| Reply::Hang);
        let orch = orchestrator(config, &worker);

        let handle = orch.start_work().unwrap();
        assert!(matches!(
            orch.plan(PlanKind::Feature, "Add search").await,
            Err(OrchestratorError::SchedulingConflict { .. })
        ));
        orch.force_stop().await;
        assert!(matches!(handle.wait().await.unwrap(), RunOutcome::Stopped { .. }));
    }
}
