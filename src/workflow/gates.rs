//! Quality gates.
//!
//! A gate phase first asks its [`QualityGate`] for review tasks. Those run
//! through the normal scheduler; once they are exhausted the gate turns
//! their outputs into a [`GateReport`]. Blocking findings fail the gate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use super::WorkflowStatus;
use crate::tasks::types::single_line;
use crate::tasks::{Role, TaskId, TaskList};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    /// Must be fixed before the project moves on.
    Blocking,
    /// Worth remembering; does not fail the gate.
    Advisory,
}

impl fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FindingSeverity::Blocking => write!(f, "blocking"),
            FindingSeverity::Advisory => write!(f, "advisory"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: FindingSeverity,
    pub text: String,
}

/// Output of one completed review task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutput {
    pub task_id: TaskId,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub phase: WorkflowStatus,
    pub findings: Vec<Finding>,
}

impl GateReport {
    pub fn pass(phase: WorkflowStatus) -> Self {
        Self {
            phase,
            findings: Vec::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.blocking().next().is_none()
    }

    pub fn blocking(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == FindingSeverity::Blocking)
    }

    pub fn advisory(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == FindingSeverity::Advisory)
    }
}

/// Per-phase review contract.
#[async_trait]
pub trait QualityGate: Send + Sync {
    /// Review tasks to run when `phase` begins.
    fn tasks_for(&self, phase: WorkflowStatus, list: &TaskList) -> Vec<(Role, String)>;

    /// Verdict for `phase` from the outputs of its review tasks.
    async fn evaluate(
        &self,
        phase: WorkflowStatus,
        outputs: &[GateOutput],
    ) -> anyhow::Result<GateReport>;
}

/// Parse `BLOCKING:` and `ADVISORY:` lines out of worker output.
///
/// Lines may carry a list bullet. Duplicate findings are reported once.
pub fn parse_findings(output: &str) -> Vec<Finding> {
    let mut seen = HashSet::new();
    let mut findings = Vec::new();
    for line in output.lines() {
        let line = line
            .trim()
            .trim_start_matches(['-', '*'])
            .trim_start()
            .trim_matches('`');
        let (severity, rest) = if let Some(rest) = line.strip_prefix("BLOCKING:") {
            (FindingSeverity::Blocking, rest)
        } else if let Some(rest) = line.strip_prefix("ADVISORY:") {
            (FindingSeverity::Advisory, rest)
        } else {
            continue;
        };
        let text = single_line(rest);
        if text.is_empty() || !seen.insert((severity, text.clone())) {
            continue;
        }
        findings.push(Finding { severity, text });
    }
    findings
}

/// Default gate: one review task per phase for the matching role, with
/// findings read from the reviewer's report lines.
#[derive(Debug, Clone, Default)]
pub struct ReportGate;

impl ReportGate {
    pub fn new() -> Self {
        Self
    }

    fn review_task(phase: WorkflowStatus) -> Option<(Role, &'static str)> {
        match phase {
            WorkflowStatus::Testing => Some((
                Role::from("testing"),
                "Write and run tests for the features completed so far and report every failing or missing behavior",
            )),
            WorkflowStatus::SecurityReview => Some((
                Role::from("security"),
                "Review the codebase for security vulnerabilities (injection, auth flaws, exposed secrets, unsafe input handling) and report each issue",
            )),
            WorkflowStatus::Qa => Some((
                Role::from("qa"),
                "Verify the implemented features against SPEC.md end to end and report every defect or gap",
            )),
            _ => None,
        }
    }
}

#[async_trait]
impl QualityGate for ReportGate {
    fn tasks_for(&self, phase: WorkflowStatus, _list: &TaskList) -> Vec<(Role, String)> {
        Self::review_task(phase)
            .map(|(role, desc)| {
                vec![(
                    role,
                    format!("{desc}; list findings as BLOCKING: <issue> or ADVISORY: <note> lines"),
                )]
            })
            .unwrap_or_default()
    }

    async fn evaluate(
        &self,
        phase: WorkflowStatus,
        outputs: &[GateOutput],
    ) -> anyhow::Result<GateReport> {
        let mut seen = HashSet::new();
        let findings = outputs
            .iter()
            .flat_map(|o| parse_findings(&o.output))
            .filter(|f| seen.insert((f.severity, f.text.clone())))
            .collect();
        Ok(GateReport { phase, findings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_findings_reads_prefixed_lines() {
        let output = "Reviewed 12 files.\n\
                      BLOCKING: SQL injection in /login\n\
                      - BLOCKING: Session cookie lacks HttpOnly\n\
                      * ADVISORY: Add rate limiting\n\
                      Blocking: lowercase is prose, not a finding\n\
                      BLOCKING:   \n\
                      BLOCKING: SQL injection in /login\n";
        let findings = parse_findings(output);
        assert_eq!(findings.len(), 3);
        assert_eq!(findings[0].severity, FindingSeverity::Blocking);
        assert_eq!(findings[0].text, "SQL injection in /login");
        assert_eq!(findings[1].text, "Session cookie lacks HttpOnly");
        assert_eq!(findings[2].severity, FindingSeverity::Advisory);
    }

    #[test]
    fn test_report_passes_without_blocking_findings() {
        let report = GateReport {
            phase: WorkflowStatus::Qa,
            findings: vec![Finding {
                severity: FindingSeverity::Advisory,
                text: "tidy up".into(),
            }],
        };
        assert!(report.passed());
        assert_eq!(report.advisory().count(), 1);
        assert!(GateReport::pass(WorkflowStatus::Qa).passed());
    }

    #[test]
    fn test_report_gate_tasks_per_phase() {
        let gate = ReportGate::new();
        let list = TaskList::new();
        let tasks = gate.tasks_for(WorkflowStatus::SecurityReview, &list);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].0, Role::from("security"));
        assert!(tasks[0].1.contains("BLOCKING:"));
        assert_eq!(gate.tasks_for(WorkflowStatus::Testing, &list)[0].0, Role::from("testing"));
        assert!(gate.tasks_for(WorkflowStatus::InProgress, &list).is_empty());
    }

    #[tokio::test]
    async fn test_report_gate_merges_outputs() {
        let gate = ReportGate::new();
        let outputs = vec![
            GateOutput {
                task_id: TaskId::new(7),
                output: "BLOCKING: missing CSRF token\nADVISORY: log auth failures".into(),
            },
            GateOutput {
                task_id: TaskId::new(8),
                output: "BLOCKING: missing CSRF token\nBLOCKING: plaintext passwords".into(),
            },
        ];
        let report = gate.evaluate(WorkflowStatus::SecurityReview, &outputs).await.unwrap();
        assert!(!report.passed());
        let blocking: Vec<_> = report.blocking().map(|f| f.text.as_str()).collect();
        assert_eq!(blocking, vec!["missing CSRF token", "plaintext passwords"]);
    }
}
