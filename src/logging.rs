//! Tracing subscriber setup for the `crew` binary.
//!
//! Two layers share one registry:
//! - stderr, kept quiet (`warn`) unless `--verbose`, so it does not fight
//!   the run display
//! - `.crew/logs/crew.log`, filtered by `CREW_LOG` (default `crew=info`),
//!   written through a non-blocking appender
//!
//! `CREW_LOG_JSON=1` switches both layers to JSON lines.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

pub const LOG_ENV: &str = "CREW_LOG";
pub const LOG_JSON_ENV: &str = "CREW_LOG_JSON";
pub const LOG_FILE: &str = "crew.log";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub json: bool,
    /// Directory for the log file; no file layer when `None`.
    pub log_dir: Option<PathBuf>,
}

impl LogOptions {
    pub fn from_env(verbose: bool, log_dir: Option<PathBuf>) -> Self {
        let json = std::env::var(LOG_JSON_ENV)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self {
            verbose,
            json,
            log_dir,
        }
    }

    fn default_directive(&self) -> &'static str {
        if self.verbose { "crew=debug" } else { "crew=info" }
    }

    fn file_filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(self.default_directive()))
    }

    fn stderr_filter(&self) -> EnvFilter {
        if self.verbose {
            EnvFilter::new(self.default_directive())
        } else {
            EnvFilter::new("crew=warn")
        }
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process so buffered file output is flushed on exit.
/// Subsequent calls are no-ops.
pub fn init(options: &LogOptions) -> Option<WorkerGuard> {
    let stderr_text = (!options.json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .with_filter(options.stderr_filter())
    });
    let stderr_json = options.json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(options.stderr_filter())
    });

    let mut guard = None;
    let mut file_text = None;
    let mut file_json = None;
    if let Some(ref dir) = options.log_dir
        && std::fs::create_dir_all(dir).is_ok()
    {
        let (writer, g) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE));
        guard = Some(g);
        if options.json {
            file_json = Some(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_filter(options.file_filter()),
            );
        } else {
            file_text = Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(options.file_filter()),
            );
        }
    }

    let _ = tracing_subscriber::registry()
        .with(stderr_text)
        .with(stderr_json)
        .with(file_text)
        .with(file_json)
        .try_init();
    guard
}
