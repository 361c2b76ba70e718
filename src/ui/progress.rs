use crate::orchestrator::OrchestratorEvent;
use crate::policy::Escalation;
use crate::ui::icons::{
    ACCEPT, BLOCKER, CHECK, CROSS, ESCALATION, PAUSE, PHASE, RESET, RETRY, REVIEW, RUNNING,
    SPARKLE, SPLIT,
};
use crate::util::truncate_chars;
use crate::worker::WorkerEvent;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Longest worker text snippet shown in a spinner.
const SNIPPET_CHARS: usize = 80;

/// Terminal observer for a run, rendered via `indicatif`.
///
/// A task bar tracks completed tasks for the whole list; each in-flight
/// dispatch gets its own spinner showing the role, task ids and the
/// worker's latest activity. Everything else is printed above the bars.
pub struct RunDisplay {
    multi: MultiProgress,
    task_bar: ProgressBar,
    dispatches: HashMap<Uuid, ProgressBar>,
    verbose: bool,
}

impl RunDisplay {
    pub fn new(done: u64, total: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let bar_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░");
        let task_bar = multi.add(ProgressBar::new(total));
        task_bar.set_style(bar_style);
        task_bar.set_prefix("Tasks");
        task_bar.set_position(done);

        Self {
            multi,
            task_bar,
            dispatches: HashMap::new(),
            verbose,
        }
    }

    /// Print a line above the bars, falling back to stderr if the rich UI
    /// is unavailable.
    pub fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Hide the bars while `f` runs, for interactive prompts.
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.multi.suspend(f)
    }

    pub fn set_totals(&self, done: u64, total: u64) {
        self.task_bar.set_length(total);
        self.task_bar.set_position(done);
    }

    fn start_dispatch(&mut self, id: Uuid, label: String) {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style);
        bar.set_prefix(label);
        bar.set_message(style("starting...").dim().to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        self.dispatches.insert(id, bar);
    }

    fn finish_dispatch(&mut self, id: &Uuid) {
        if let Some(bar) = self.dispatches.remove(id) {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
    }

    fn worker_activity(&self, id: &Uuid, event: &WorkerEvent) {
        let Some(bar) = self.dispatches.get(id) else {
            return;
        };
        match event {
            WorkerEvent::ToolUse { description, .. } => {
                bar.set_message(style(description).yellow().to_string());
                if self.verbose {
                    self.print_line(format!("    {} {}", style("→").dim(), style(description).dim()));
                }
            }
            WorkerEvent::Text { text } => {
                let snippet = truncate_chars(text.lines().last().unwrap_or("").trim(), SNIPPET_CHARS);
                if !snippet.is_empty() {
                    bar.set_message(style(snippet).dim().to_string());
                }
            }
            WorkerEvent::SessionStarted { .. } => {}
        }
    }

    /// Update the display for one orchestrator event.
    pub fn handle(&mut self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::DispatchStarted {
                dispatch_id,
                role,
                task_ids,
                ..
            } => {
                let ids: Vec<String> = task_ids.iter().map(|id| id.to_string()).collect();
                self.start_dispatch(*dispatch_id, format!("{:>10} {}", role.as_str(), ids.join(",")));
            }
            OrchestratorEvent::DispatchCompleted { dispatch_id, .. } => {
                self.finish_dispatch(dispatch_id);
            }
            OrchestratorEvent::WorkerOutput {
                dispatch_id, event, ..
            } => {
                self.worker_activity(dispatch_id, event);
            }
            OrchestratorEvent::TaskCompleted { .. } => {
                self.task_bar.inc(1);
            }
            OrchestratorEvent::TaskSplit { children, .. } => {
                // The parent no longer counts; its parts do.
                let len = self.task_bar.length().unwrap_or(0);
                self.task_bar
                    .set_length((len + children.len() as u64).saturating_sub(1));
            }
            OrchestratorEvent::PhaseChanged { to, .. } => {
                self.task_bar.set_message(to.title().to_string());
            }
            OrchestratorEvent::WorkComplete { .. }
            | OrchestratorEvent::WorkStopped { .. }
            | OrchestratorEvent::CriticalError { .. } => {
                let ids: Vec<Uuid> = self.dispatches.keys().copied().collect();
                for id in ids {
                    self.finish_dispatch(&id);
                }
            }
            _ => {}
        }
        if let Some(line) = describe(event, self.verbose) {
            self.print_line(line);
        }
    }

    pub fn finish(&self) {
        self.task_bar.finish();
    }
}

/// One-line description of an event, or `None` for events shown only on
/// the bars.
pub fn describe(event: &OrchestratorEvent, verbose: bool) -> Option<String> {
    let line = match event {
        OrchestratorEvent::RunStarted {
            project,
            status,
            max_parallel,
        } => format!(
            "{}{} ({}, up to {} in parallel)",
            RUNNING,
            style(project).bold(),
            status.title(),
            max_parallel
        ),
        OrchestratorEvent::PhaseChanged { from, to } => format!(
            "{}{} → {}",
            PHASE,
            style(from.title()).dim(),
            style(to.title()).cyan().bold()
        ),
        OrchestratorEvent::DispatchStarted {
            role,
            task_ids,
            resumed,
            model,
            ..
        } if verbose => {
            let ids: Vec<String> = task_ids.iter().map(|id| id.to_string()).collect();
            format!(
                "  {} {} {}{}{}",
                style("dispatch").dim(),
                style(role).cyan(),
                ids.join(", "),
                if *resumed { " (resumed)" } else { "" },
                model
                    .as_deref()
                    .map(|m| format!(" [{}]", m))
                    .unwrap_or_default()
            )
        }
        OrchestratorEvent::TaskCompleted {
            task_id,
            role,
            description,
        } => format!(
            "  {}{} {} {}",
            CHECK,
            style(task_id).green(),
            style(format!("@{}", role)).dim(),
            description
        ),
        OrchestratorEvent::TaskRetrying {
            task_id,
            attempt,
            error,
        } => format!(
            "  {}{} attempt {} failed: {}",
            RETRY,
            style(task_id).yellow(),
            attempt,
            style(error).dim()
        ),
        OrchestratorEvent::TaskSplit { task_id, children } => {
            let ids: Vec<String> = children.iter().map(|id| id.to_string()).collect();
            format!("  {}{} split into {}", SPLIT, task_id, ids.join(", "))
        }
        OrchestratorEvent::EscalationRaised { escalation } => format!(
            "{}{} {} ({}): {}",
            ESCALATION,
            style(escalation.task_id).red().bold(),
            escalation.description,
            escalation.kind,
            style(&escalation.error).red()
        ),
        OrchestratorEvent::EscalationResolved {
            task_id,
            resolution,
        } => format!("  {} resolved: {}", task_id, resolution),
        OrchestratorEvent::SessionReset { role, reason } => {
            format!("  {}{} session reset ({})", RESET, role, reason)
        }
        OrchestratorEvent::GateEvaluated {
            phase,
            passed,
            blocking,
            advisory,
        } => {
            let mut line = if *passed {
                format!(
                    "{}{} passed ({} advisory)",
                    REVIEW,
                    style(phase.title()).green(),
                    advisory
                )
            } else {
                format!(
                    "{}{} found {} blocking issue(s)",
                    REVIEW,
                    style(phase.title()).red(),
                    blocking.len()
                )
            };
            for finding in blocking {
                line.push_str(&format!("\n    {} {}", style("-").red(), finding));
            }
            line
        }
        OrchestratorEvent::Blocked { task_ids } => {
            let ids: Vec<String> = task_ids.iter().map(|id| id.to_string()).collect();
            format!(
                "{}Waiting on escalations: {}",
                BLOCKER,
                style(ids.join(", ")).red()
            )
        }
        OrchestratorEvent::AwaitingAcceptance { round } => {
            format!("{}Ready for user acceptance (round {})", ACCEPT, round)
        }
        OrchestratorEvent::PlanReady { cycle, open_tasks } => format!(
            "{}Plan ready: {} open task(s), cycle {}",
            SPARKLE,
            style(open_tasks).bold(),
            cycle
        ),
        OrchestratorEvent::WorkPaused => format!("{}Paused", PAUSE),
        OrchestratorEvent::WorkResumed => format!("{}Resumed", RUNNING),
        OrchestratorEvent::WorkStopped { reason } => {
            format!("{}Stopped: {}", PAUSE, reason)
        }
        OrchestratorEvent::WorkComplete { summary } => match summary {
            Some(path) => format!("{}Work complete. Summary: {}", SPARKLE, path.display()),
            None => format!("{}Work complete", SPARKLE),
        },
        OrchestratorEvent::CriticalError { message } => {
            format!("{}{}", CROSS, style(message).red().bold())
        }
        _ => return None,
    };
    Some(line)
}

/// Multi-line rendering of an escalation for prompts and `crew status`.
pub fn render_escalation(escalation: &Escalation) -> String {
    let options: Vec<&str> = escalation.options.iter().map(|o| o.as_str()).collect();
    format!(
        "{} @{} {}\n    {}: {}\n    raised {}\n    options: {}",
        escalation.task_id,
        escalation.role,
        escalation.description,
        escalation.kind,
        escalation.error,
        escalation.raised_at.format("%Y-%m-%d %H:%M"),
        options.join(", ")
    )
}
