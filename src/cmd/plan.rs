//! `crew plan` and `crew feature`: have the manager write the plan.

use anyhow::Result;
use console::style;
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;

use crew::orchestrator::PlanKind;
use crew::ui::RunDisplay;

use super::project::{load_config, open_orchestrator};

pub async fn cmd_plan(project_dir: &Path, kind: PlanKind, request: &str, verbose: bool) -> Result<()> {
    let mut config = load_config(project_dir)?;
    config.verbose = verbose;
    let orchestrator = open_orchestrator(config)?;
    let mut events = orchestrator.subscribe();
    let counts = orchestrator.snapshot().await?.counts;
    let mut display = RunDisplay::new(counts.done as u64, (counts.total - counts.split) as u64, verbose);

    let plan = orchestrator.plan(kind, request);
    tokio::pin!(plan);
    let result = loop {
        tokio::select! {
            result = &mut plan => break result,
            _ = tokio::signal::ctrl_c() => {
                display.print_line(style("Stopping...").yellow().to_string());
                orchestrator.force_stop().await;
            }
            event = events.recv() => match event {
                Ok(event) => display.handle(&event),
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "observer lagged behind the event stream");
                }
                Err(RecvError::Closed) => {}
            },
        }
    };
    while let Ok(event) = events.try_recv() {
        display.handle(&event);
    }
    display.finish();

    let outcome = result?;
    println!(
        "{} written: {} open task(s), {} new. Cycle {}.",
        match kind {
            PlanKind::Project => "Plan",
            PlanKind::Feature => "Feature plan",
        },
        outcome.open_tasks,
        outcome.added,
        outcome.cycle
    );
    println!("Review TODO.md, then run `crew run` to start work.");
    Ok(())
}
