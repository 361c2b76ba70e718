//! Controls applied to an idle project — `crew resolve`, `crew set-status`,
//! `crew gates`, `crew accept` and `crew reject`.
//!
//! While `crew run` is active it owns the project and answers escalations
//! and acceptance interactively; these commands refuse to race it.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use crew::orchestrator::ControlOutcome;
use crew::policy::Resolution;
use crew::tasks::TaskId;
use crew::workflow::WorkflowStatus;

use super::super::{ResolveAction, Toggle};
use super::project::open_idle;

fn report(outcome: ControlOutcome, applied: impl FnOnce()) {
    match outcome {
        ControlOutcome::Applied => applied(),
        ControlOutcome::NoOp(reason) => println!("Nothing to do: {}", reason),
    }
}

pub fn resolution_for(action: ResolveAction, description: Option<String>) -> Result<Resolution> {
    Ok(match action {
        ResolveAction::Retry => Resolution::Retry,
        ResolveAction::Skip => Resolution::Skip,
        ResolveAction::Remove => Resolution::Remove,
        ResolveAction::Stop => Resolution::Stop,
        ResolveAction::Modify => {
            let Some(description) = description else {
                anyhow::bail!("`modify` needs --description \"<new task description>\"");
            };
            Resolution::Modify { description }
        }
    })
}

pub async fn cmd_resolve(
    project_dir: &Path,
    task: &str,
    action: ResolveAction,
    description: Option<String>,
) -> Result<()> {
    let task_id: TaskId = task.parse().map_err(anyhow::Error::msg)?;
    let resolution = resolution_for(action, description)?;
    let kind = resolution.kind();

    let (orchestrator, _lock) = open_idle(project_dir)?;
    let outcome = orchestrator.resolve_escalation(task_id, resolution).await?;
    report(outcome, || {
        println!("{} resolved: {}", style(task_id).bold(), kind);
        println!("Run `crew run` to continue.");
    });
    Ok(())
}

pub async fn cmd_set_status(project_dir: &Path, status: &str) -> Result<()> {
    let status: WorkflowStatus = status.parse().with_context(|| {
        let names: Vec<&str> = WorkflowStatus::ALL.iter().map(|s| s.as_str()).collect();
        format!("Expected one of: {}", names.join(", "))
    })?;

    let (orchestrator, _lock) = open_idle(project_dir)?;
    let outcome = orchestrator.set_status(status).await?;
    report(outcome, || {
        println!("Status set to {}", style(status.title()).cyan());
    });
    Ok(())
}

pub async fn cmd_gates(
    project_dir: &Path,
    testing: Option<Toggle>,
    security: Option<Toggle>,
    qa: Option<Toggle>,
) -> Result<()> {
    let (orchestrator, _lock) = open_idle(project_dir)?;
    let mut gates = orchestrator.snapshot().await?.gates;
    if let Some(t) = testing {
        gates.testing = t.enabled();
    }
    if let Some(t) = security {
        gates.security_review = t.enabled();
    }
    if let Some(t) = qa {
        gates.qa = t.enabled();
    }

    let outcome = orchestrator.set_quality_gates(gates).await?;
    if let ControlOutcome::NoOp(reason) = &outcome {
        println!("Nothing to do: {}", reason);
    }
    println!(
        "Quality gates: testing {}, security review {}, qa {}",
        if gates.testing { "on" } else { "off" },
        if gates.security_review { "on" } else { "off" },
        if gates.qa { "on" } else { "off" }
    );
    Ok(())
}

pub async fn cmd_accept(project_dir: &Path) -> Result<()> {
    let (orchestrator, _lock) = open_idle(project_dir)?;
    let outcome = orchestrator.approve_acceptance().await?;
    report(outcome, || {
        println!("{}", style("Accepted. Project is done.").green().bold());
        let summary = &orchestrator.config().summary_file;
        if summary.exists() {
            println!("Summary: {}", summary.display());
        }
    });
    Ok(())
}

pub async fn cmd_reject(project_dir: &Path, changes: &[String]) -> Result<()> {
    let (orchestrator, _lock) = open_idle(project_dir)?;
    let outcome = orchestrator.reject_acceptance(changes).await?;
    report(outcome, || {
        println!(
            "Rejected with {} requested change(s). Run `crew run` to address them.",
            changes.len()
        );
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modify_requires_description() {
        assert!(resolution_for(ResolveAction::Modify, None).is_err());
        assert_eq!(
            resolution_for(ResolveAction::Modify, Some("Smaller task".into())).unwrap(),
            Resolution::Modify {
                description: "Smaller task".into()
            }
        );
    }

    #[test]
    fn test_simple_actions_map_directly() {
        assert_eq!(
            resolution_for(ResolveAction::Skip, None).unwrap(),
            Resolution::Skip
        );
        assert_eq!(
            resolution_for(ResolveAction::Stop, Some("ignored".into())).unwrap(),
            Resolution::Stop
        );
    }
}
