//! Workflow state machine.
//!
//! The project moves initialized → in-progress → [testing] →
//! [security-review] → [qa] → user-acceptance → done. Bracketed phases are
//! gates, each toggleable. A gate with blocking findings sends the project
//! back to in-progress with remediation tasks; once those close, gating
//! restarts from the first enabled gate. A rejected acceptance pass also
//! returns to in-progress with the requested changes as tasks. A manual
//! override may set any status directly.
//!
//! The state lives in `.crew/state.json` together with pending escalations,
//! so controls can act on a project with no active run.

pub mod gates;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::crew_config::GatesSection;
use crate::errors::OrchestratorError;
use crate::policy::Escalation;
use crate::tasks::TaskId;
use crate::util::{truncate_chars, write_atomic};

pub use gates::{Finding, FindingSeverity, GateOutput, GateReport, QualityGate, ReportGate, parse_findings};

/// Longest worker output kept per gate task.
const GATE_OUTPUT_CHARS: usize = 20_000;

/// Gate phases in the order they run.
pub const GATE_ORDER: [WorkflowStatus; 3] = [
    WorkflowStatus::Testing,
    WorkflowStatus::SecurityReview,
    WorkflowStatus::Qa,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    #[default]
    Initialized,
    InProgress,
    Testing,
    SecurityReview,
    Qa,
    UserAcceptance,
    Done,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 7] = [
        WorkflowStatus::Initialized,
        WorkflowStatus::InProgress,
        WorkflowStatus::Testing,
        WorkflowStatus::SecurityReview,
        WorkflowStatus::Qa,
        WorkflowStatus::UserAcceptance,
        WorkflowStatus::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Initialized => "initialized",
            WorkflowStatus::InProgress => "in-progress",
            WorkflowStatus::Testing => "testing",
            WorkflowStatus::SecurityReview => "security-review",
            WorkflowStatus::Qa => "qa",
            WorkflowStatus::UserAcceptance => "user-acceptance",
            WorkflowStatus::Done => "done",
        }
    }

    /// Human-readable phase name, used for gate section headings.
    pub fn title(&self) -> &'static str {
        match self {
            WorkflowStatus::Initialized => "Initialized",
            WorkflowStatus::InProgress => "Implementation",
            WorkflowStatus::Testing => "Testing",
            WorkflowStatus::SecurityReview => "Security Review",
            WorkflowStatus::Qa => "QA",
            WorkflowStatus::UserAcceptance => "User Acceptance",
            WorkflowStatus::Done => "Done",
        }
    }

    pub fn is_gate(&self) -> bool {
        GATE_ORDER.contains(self)
    }

    /// Whether the gate toggles enable this phase. Non-gate phases are
    /// always enabled.
    pub fn enabled_in(&self, gates: &GatesSection) -> bool {
        match self {
            WorkflowStatus::Testing => gates.testing,
            WorkflowStatus::SecurityReview => gates.security_review,
            WorkflowStatus::Qa => gates.qa,
            _ => true,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        WorkflowStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .with_context(|| {
                let names: Vec<&str> = WorkflowStatus::ALL.iter().map(|s| s.as_str()).collect();
                format!("Unknown workflow status '{}' (expected one of: {})", s, names.join(", "))
            })
    }
}

/// First enabled gate after `after` (or from the start), else
/// user-acceptance.
pub fn next_phase(after: Option<WorkflowStatus>, gates: &GatesSection) -> WorkflowStatus {
    let start = after
        .and_then(|phase| GATE_ORDER.iter().position(|g| *g == phase))
        .map(|i| i + 1)
        .unwrap_or(0);
    GATE_ORDER[start..]
        .iter()
        .copied()
        .find(|phase| phase.enabled_in(gates))
        .unwrap_or(WorkflowStatus::UserAcceptance)
}

/// A status change made by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Entered a gate; its review tasks go into `section`.
    EnterGate {
        phase: WorkflowStatus,
        section: String,
        pass: u32,
    },
    /// A gate failed; remediation tasks go into `section`.
    Regress {
        from: WorkflowStatus,
        section: String,
    },
    AwaitAcceptance,
}

/// Persisted workflow state for one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub status: WorkflowStatus,
    /// Project or feature cycle; bumped whenever work (re)starts from
    /// initialized or done.
    #[serde(default)]
    pub cycle: u32,
    /// Passes per gate phase, keyed by status name.
    #[serde(default)]
    pub gate_passes: BTreeMap<String, u32>,
    /// Section holding the current gate's review tasks.
    #[serde(default)]
    pub active_section: Option<String>,
    /// Outputs of completed review tasks in the active gate section.
    #[serde(default)]
    pub gate_outputs: Vec<GateOutput>,
    #[serde(default)]
    pub acceptance_rounds: u32,
    /// Pending escalations, oldest first.
    #[serde(default)]
    pub escalations: Vec<Escalation>,
    pub updated_at: DateTime<Utc>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            status: WorkflowStatus::Initialized,
            cycle: 0,
            gate_passes: BTreeMap::new(),
            active_section: None,
            gate_outputs: Vec::new(),
            acceptance_rounds: 0,
            escalations: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

impl WorkflowState {
    /// Load state, or start fresh when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow state: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse workflow state: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize workflow state")?;
        write_atomic(path, &json)
            .with_context(|| format!("Failed to write workflow state: {}", path.display()))
    }

    fn set_status(&mut self, status: WorkflowStatus) -> WorkflowStatus {
        let from = self.status;
        self.status = status;
        self.updated_at = Utc::now();
        if from != status {
            tracing::info!(from = %from, to = %status, "workflow status changed");
        }
        from
    }

    /// Begin work: initialized or done moves to in-progress and opens a new
    /// cycle. Returns the new cycle number when one started.
    pub fn start(&mut self) -> Option<u32> {
        match self.status {
            WorkflowStatus::Initialized | WorkflowStatus::Done => {
                self.cycle += 1;
                self.active_section = None;
                self.gate_outputs.clear();
                self.set_status(WorkflowStatus::InProgress);
                Some(self.cycle)
            }
            _ => None,
        }
    }

    /// Open a new cycle from any status, as a fresh plan does. Gate pass
    /// counts carry over so review sections keep unique names. Returns the
    /// previous status and the new cycle.
    pub fn begin_cycle(&mut self) -> (WorkflowStatus, u32) {
        self.cycle += 1;
        self.active_section = None;
        self.gate_outputs.clear();
        let from = self.set_status(WorkflowStatus::InProgress);
        (from, self.cycle)
    }

    pub fn passes(&self, phase: WorkflowStatus) -> u32 {
        self.gate_passes.get(phase.as_str()).copied().unwrap_or(0)
    }

    /// Enter a gate phase, opening a new pass and its review section.
    pub fn begin_gate(&mut self, phase: WorkflowStatus) -> Transition {
        let pass = self.passes(phase) + 1;
        self.gate_passes.insert(phase.as_str().to_string(), pass);
        let section = format!("{} (pass {})", phase.title(), pass);
        self.active_section = Some(section.clone());
        self.gate_outputs.clear();
        self.set_status(phase);
        Transition::EnterGate {
            phase,
            section,
            pass,
        }
    }

    /// The in-progress phase ran out of work.
    pub fn finish_implementation(&mut self, gates: &GatesSection) -> Transition {
        self.advance(next_phase(None, gates))
    }

    fn advance(&mut self, next: WorkflowStatus) -> Transition {
        if next.is_gate() {
            self.begin_gate(next)
        } else {
            self.active_section = None;
            self.gate_outputs.clear();
            self.set_status(WorkflowStatus::UserAcceptance);
            Transition::AwaitAcceptance
        }
    }

    /// Record the output of a review task in the active gate section.
    pub fn record_gate_output(&mut self, task_id: TaskId, output: &str) {
        self.gate_outputs.push(GateOutput {
            task_id,
            output: truncate_chars(output, GATE_OUTPUT_CHARS),
        });
    }

    /// Apply a gate verdict for the current phase.
    pub fn complete_gate(&mut self, report: &GateReport, gates: &GatesSection) -> Transition {
        let phase = self.status;
        self.gate_outputs.clear();
        if report.passed() {
            tracing::info!(phase = %phase, advisory = report.advisory().count(), "gate passed");
            return self.advance(next_phase(Some(phase), gates));
        }
        let section = format!("Remediation: {} (pass {})", phase.title(), self.passes(phase));
        tracing::warn!(
            phase = %phase,
            blocking = report.blocking().count(),
            "gate failed, returning to implementation"
        );
        self.active_section = None;
        self.set_status(WorkflowStatus::InProgress);
        Transition::Regress {
            from: phase,
            section,
        }
    }

    /// Approval moves user-acceptance to done.
    pub fn approve(&mut self) -> Result<(), OrchestratorError> {
        if self.status != WorkflowStatus::UserAcceptance {
            return Err(OrchestratorError::InvalidTransition {
                action: "approve acceptance",
                status: self.status,
            });
        }
        self.set_status(WorkflowStatus::Done);
        Ok(())
    }

    /// Rejection returns to in-progress; the returned section name receives
    /// the requested changes.
    pub fn reject(&mut self) -> Result<String, OrchestratorError> {
        if self.status != WorkflowStatus::UserAcceptance {
            return Err(OrchestratorError::InvalidTransition {
                action: "reject acceptance",
                status: self.status,
            });
        }
        self.acceptance_rounds += 1;
        self.set_status(WorkflowStatus::InProgress);
        Ok(format!("Acceptance feedback (round {})", self.acceptance_rounds))
    }

    /// Manual override, bypassing gate evaluation. Returns the previous
    /// status, or `None` when nothing changed.
    pub fn override_status(&mut self, status: WorkflowStatus) -> Option<WorkflowStatus> {
        if self.status == status && self.active_section.is_none() {
            return None;
        }
        if status == WorkflowStatus::InProgress
            && matches!(self.status, WorkflowStatus::Initialized | WorkflowStatus::Done)
        {
            self.cycle += 1;
        }
        self.active_section = None;
        self.gate_outputs.clear();
        Some(self.set_status(status))
    }

    pub fn escalation(&self, task_id: TaskId) -> Option<&Escalation> {
        self.escalations.iter().find(|e| e.task_id == task_id)
    }

    /// Add an escalation, replacing any earlier one for the same task.
    pub fn add_escalation(&mut self, escalation: Escalation) {
        self.escalations.retain(|e| e.task_id != escalation.task_id);
        self.escalations.push(escalation);
        self.updated_at = Utc::now();
    }

    pub fn take_escalation(&mut self, task_id: TaskId) -> Option<Escalation> {
        let idx = self.escalations.iter().position(|e| e.task_id == task_id)?;
        self.updated_at = Utc::now();
        Some(self.escalations.remove(idx))
    }

    pub fn escalated_ids(&self) -> HashSet<TaskId> {
        self.escalations.iter().map(|e| e.task_id).collect()
    }
}
