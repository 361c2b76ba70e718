use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crew::orchestrator::PlanKind;

mod cmd;

#[derive(Parser)]
#[command(name = "crew")]
#[command(version, about = "Multi-role agent orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a crew project (TODO.md, MEMORY.md, .crew/)
    Init {
        /// Project name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Work through the task list until done or stopped
    Run {
        /// Maximum concurrent dispatches
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Let sections run in parallel with each other
        #[arg(long)]
        cross_section: bool,

        /// Approve user acceptance without asking
        #[arg(long)]
        yes: bool,
    },
    /// Have the manager write SPEC.md and TODO.md for a new project
    Plan {
        /// What to build
        #[arg(required = true)]
        request: Vec<String>,
    },
    /// Have the manager plan a feature on the existing project
    Feature {
        /// The feature to add
        #[arg(required = true)]
        request: Vec<String>,
    },
    /// Show workflow status, task counts and pending escalations
    Status,
    /// List tasks by section
    Tasks,
    /// Resolve a pending escalation
    Resolve {
        /// Task id, e.g. T3
        task: String,

        action: ResolveAction,

        /// New description, for `modify`
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Set the workflow status directly, bypassing quality gates
    SetStatus {
        /// initialized, in-progress, testing, security-review, qa, user-acceptance or done
        status: String,
    },
    /// Turn quality gates on or off
    Gates {
        #[arg(long)]
        testing: Option<Toggle>,

        #[arg(long)]
        security: Option<Toggle>,

        #[arg(long)]
        qa: Option<Toggle>,
    },
    /// Accept the work at user acceptance
    Accept,
    /// Reject the work at user acceptance with requested changes
    Reject {
        /// A requested change; repeat for several
        #[arg(short, long = "change", required = true)]
        changes: Vec<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResolveAction {
    Retry,
    Skip,
    Modify,
    Remove,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn enabled(self) -> bool {
        self == Toggle::On
    }
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_dir = crew::init::is_initialized(&project_dir)
        .then(|| project_dir.join(crew::config::CREW_DIR).join("logs"));
    let _log_guard = crew::logging::init(&crew::logging::LogOptions::from_env(cli.verbose, log_dir));

    match cli.command {
        Commands::Init { name } => cmd::cmd_init(&project_dir, name.as_deref())?,
        Commands::Run {
            max_parallel,
            cross_section,
            yes,
        } => {
            cmd::cmd_run(
                &project_dir,
                cmd::RunOptions {
                    max_parallel,
                    cross_section,
                    yes,
                    verbose: cli.verbose,
                },
            )
            .await?
        }
        Commands::Plan { request } => {
            cmd::cmd_plan(&project_dir, PlanKind::Project, &request.join(" "), cli.verbose).await?
        }
        Commands::Feature { request } => {
            cmd::cmd_plan(&project_dir, PlanKind::Feature, &request.join(" "), cli.verbose).await?
        }
        Commands::Status => cmd::cmd_status(&project_dir).await?,
        Commands::Tasks => cmd::cmd_tasks(&project_dir)?,
        Commands::Resolve {
            task,
            action,
            description,
        } => cmd::cmd_resolve(&project_dir, &task, action, description).await?,
        Commands::SetStatus { status } => cmd::cmd_set_status(&project_dir, &status).await?,
        Commands::Gates {
            testing,
            security,
            qa,
        } => cmd::cmd_gates(&project_dir, testing, security, qa).await?,
        Commands::Accept => cmd::cmd_accept(&project_dir).await?,
        Commands::Reject { changes } => cmd::cmd_reject(&project_dir, &changes).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command)?,
    }

    Ok(())
}
