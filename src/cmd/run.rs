//! `crew run`: drive the project with a terminal observer.
//!
//! Escalations and user acceptance are answered with prompts when stdin is
//! a terminal. Without one, a run that can make no progress without a human
//! stops and prints the command that unblocks it.

use anyhow::Result;
use console::{Term, style};
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;

use crew::orchestrator::{Orchestrator, OrchestratorEvent, RunOutcome};
use crew::policy::{Escalation, Resolution, ResolutionKind};
use crew::ui::{RunDisplay, render_escalation};

use super::project::{load_config, open_orchestrator};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_parallel: Option<usize>,
    pub cross_section: bool,
    /// Approve user acceptance without asking.
    pub yes: bool,
    pub verbose: bool,
}

fn prompt_resolution(escalation: &Escalation) -> Result<Resolution> {
    println!();
    println!("{}", style("Escalation needs a decision").red().bold());
    println!("  {}", render_escalation(escalation).replace('\n', "\n  "));
    println!();

    let options: Vec<ResolutionKind> = if escalation.options.is_empty() {
        ResolutionKind::ALL.to_vec()
    } else {
        escalation.options.clone()
    };
    let labels: Vec<&str> = options
        .iter()
        .map(|o| match o {
            ResolutionKind::Retry => "Retry - reset the attempt count and try again",
            ResolutionKind::Skip => "Skip - mark complete without doing it",
            ResolutionKind::Modify => "Modify - rewrite the task and try again",
            ResolutionKind::Remove => "Remove - drop the task from the list",
            ResolutionKind::Stop => "Stop - halt all work",
        })
        .collect();
    let choice = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("How should {} proceed?", escalation.task_id))
        .items(&labels)
        .default(0)
        .interact()?;

    Ok(match options[choice] {
        ResolutionKind::Retry => Resolution::Retry,
        ResolutionKind::Skip => Resolution::Skip,
        ResolutionKind::Remove => Resolution::Remove,
        ResolutionKind::Stop => Resolution::Stop,
        ResolutionKind::Modify => {
            let description: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("New task description")
                .with_initial_text(escalation.description.clone())
                .interact_text()?;
            Resolution::Modify { description }
        }
    })
}

/// `Ok(None)` approves; `Ok(Some(changes))` rejects.
fn prompt_acceptance(round: u32) -> Result<Option<Vec<String>>> {
    println!();
    println!(
        "{}",
        style(format!("User acceptance (round {})", round)).cyan().bold()
    );
    let approve = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Accept the work as complete?")
        .default(true)
        .interact()?;
    if approve {
        return Ok(None);
    }

    let mut changes = Vec::new();
    loop {
        let change: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Requested change (empty to finish)")
            .allow_empty(true)
            .interact_text()?;
        if change.trim().is_empty() {
            if changes.is_empty() {
                println!("Enter at least one change, or accept the work.");
                continue;
            }
            break;
        }
        changes.push(change);
    }
    Ok(Some(changes))
}

struct Observer {
    orchestrator: Orchestrator,
    display: RunDisplay,
    interactive: bool,
    yes: bool,
}

impl Observer {
    async fn resolve(&self, escalation: &Escalation) -> Result<()> {
        if !self.interactive {
            self.display.print_line(format!(
                "  Resolve later with `crew resolve {} <{}>`",
                escalation.task_id,
                escalation
                    .options
                    .iter()
                    .map(|o| o.as_str())
                    .collect::<Vec<_>>()
                    .join("|")
            ));
            return Ok(());
        }
        loop {
            let resolution = self.display.suspend(|| prompt_resolution(escalation))?;
            match self
                .orchestrator
                .resolve_escalation(escalation.task_id, resolution)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if !e.is_critical() => {
                    self.display
                        .print_line(format!("{} {}", style("Not applied:").yellow(), e));
                    let pending = self.orchestrator.snapshot().await?.escalations;
                    if pending.iter().all(|p| p.task_id != escalation.task_id) {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn acceptance(&self, round: u32) -> Result<()> {
        if self.yes {
            self.orchestrator.approve_acceptance().await?;
            return Ok(());
        }
        if !self.interactive {
            self.display.print_line(
                "  Answer with `crew accept` or `crew reject --change \"...\"`, then run again",
            );
            self.orchestrator.force_stop().await;
            return Ok(());
        }
        match self.display.suspend(|| prompt_acceptance(round))? {
            None => {
                self.orchestrator.approve_acceptance().await?;
            }
            Some(changes) => {
                self.orchestrator.reject_acceptance(&changes).await?;
            }
        }
        Ok(())
    }

    async fn on_event(&mut self, event: OrchestratorEvent) -> Result<()> {
        self.display.handle(&event);
        match event {
            OrchestratorEvent::EscalationRaised { escalation } => self.resolve(&escalation).await,
            OrchestratorEvent::Blocked { .. } if !self.interactive => {
                self.display.print_line(
                    "  Nothing can proceed without a decision; stopping. Resolve the escalations and run again.",
                );
                self.orchestrator.force_stop().await;
                Ok(())
            }
            OrchestratorEvent::AwaitingAcceptance { round } => self.acceptance(round).await,
            _ => Ok(()),
        }
    }
}

pub async fn cmd_run(project_dir: &Path, options: RunOptions) -> Result<()> {
    let mut config = load_config(project_dir)?;
    config.verbose = options.verbose;
    if let Some(k) = options.max_parallel {
        config.toml.execution.max_parallel = k;
    }
    if options.cross_section {
        config.toml.execution.cross_section_parallel = true;
    }
    for warning in config.toml.validate() {
        eprintln!("{} {}", style("warning:").yellow(), warning);
    }
    if config.toml.execution.max_parallel == 0 {
        anyhow::bail!("execution.max_parallel must be at least 1");
    }

    let orchestrator = open_orchestrator(config)?;
    let mut events = orchestrator.subscribe();
    let snapshot = orchestrator.snapshot().await?;
    let counts = snapshot.counts;
    let mut observer = Observer {
        orchestrator: orchestrator.clone(),
        display: RunDisplay::new(
            counts.done as u64,
            (counts.total - counts.split) as u64,
            options.verbose,
        ),
        interactive: Term::stdout().is_term() && Term::stderr().is_term(),
        yes: options.yes,
    };

    let handle = orchestrator.start_work()?;
    let wait = handle.wait();
    tokio::pin!(wait);

    // Escalations left over from an earlier run.
    for escalation in &snapshot.escalations {
        observer
            .display
            .handle(&OrchestratorEvent::EscalationRaised {
                escalation: escalation.clone(),
            });
        observer.resolve(escalation).await?;
    }

    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            _ = tokio::signal::ctrl_c() => {
                observer.display.print_line(style("Stopping...").yellow().to_string());
                orchestrator.force_stop().await;
            }
            event = events.recv() => match event {
                Ok(event) => observer.on_event(event).await?,
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "observer lagged behind the event stream");
                }
                Err(RecvError::Closed) => {}
            },
        }
    };

    // Show whatever arrived after the loop ended.
    while let Ok(event) = events.try_recv() {
        observer.display.handle(&event);
    }
    observer.display.finish();

    match result? {
        RunOutcome::Complete => Ok(()),
        RunOutcome::Stopped { reason } => {
            println!("Run stopped: {}", reason);
            Ok(())
        }
    }
}
