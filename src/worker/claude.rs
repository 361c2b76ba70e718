//! Worker backed by the Claude CLI in stream-json mode.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::stream::{ContentBlock, StreamEvent, describe_tool_use};
use super::{Worker, WorkerEvent, WorkerOutcome, WorkerRequest};
use crate::config::Config;
use crate::session::ContextUsage;
use crate::util::truncate_chars;

/// Phrases in worker errors that mean the session itself is gone.
const SESSION_ERROR_MARKERS: &[&str] = &[
    "no conversation found",
    "session not found",
    "invalid session",
    "session expired",
    "prompt is too long",
    "context length",
];

#[derive(Debug, Clone)]
pub struct ClaudeWorkerConfig {
    pub cmd: String,
    pub skip_permissions: bool,
    pub project_dir: PathBuf,
    /// Where prompt and output logs go; `None` disables them.
    pub log_dir: Option<PathBuf>,
}

impl ClaudeWorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cmd: config.toml.worker_cmd(),
            skip_permissions: config.toml.worker.skip_permissions,
            project_dir: config.project_dir.clone(),
            log_dir: Some(config.log_dir.clone()),
        }
    }
}

pub struct ClaudeWorker {
    config: ClaudeWorkerConfig,
}

#[derive(Debug, Default)]
struct StreamSummary {
    text: String,
    result: Option<String>,
    is_error: bool,
    session_id: Option<String>,
    usage: Option<ContextUsage>,
}

enum RunEnd {
    Finished(std::io::Result<StreamSummary>),
    TimedOut,
    Cancelled,
}

impl ClaudeWorker {
    pub fn new(config: ClaudeWorkerConfig) -> Self {
        Self { config }
    }

    /// CLI flags for a request.
    pub fn flags(&self, request: &WorkerRequest) -> Vec<String> {
        let mut flags = Vec::new();
        if self.config.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        if let Some(ref token) = request.resume_token {
            flags.push("--resume".to_string());
            flags.push(token.clone());
        }
        if let Some(ref model) = request.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        flags
    }

    fn log_path(&self, request: &WorkerRequest, suffix: &str) -> Option<PathBuf> {
        let dir = self.config.log_dir.as_ref()?;
        let ids: Vec<String> = request.tasks.iter().map(|t| t.id.to_string()).collect();
        let short = request.dispatch_id.simple().to_string();
        Some(dir.join(format!(
            "{}-{}-{}-{}",
            request.role,
            ids.join("_"),
            &short[..8],
            suffix
        )))
    }

    fn write_log(&self, request: &WorkerRequest, suffix: &str, content: &str) {
        let Some(path) = self.log_path(request, suffix) else {
            return;
        };
        if let Err(e) = std::fs::create_dir_all(path.parent().unwrap_or(&path))
            .and_then(|_| std::fs::write(&path, content))
        {
            tracing::warn!(path = %path.display(), error = %e, "failed to write worker log");
        }
    }

    async fn read_stream(
        stdout: tokio::process::ChildStdout,
        events: &mpsc::UnboundedSender<WorkerEvent>,
    ) -> std::io::Result<StreamSummary> {
        let mut reader = BufReader::new(stdout).lines();
        let mut summary = StreamSummary::default();

        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEvent>(&line) {
                Ok(StreamEvent::System { session_id, .. }) => {
                    if let Some(id) = session_id
                        && summary.session_id.is_none()
                    {
                        let _ = events.send(WorkerEvent::SessionStarted { token: id.clone() });
                        summary.session_id = Some(id);
                    }
                }
                Ok(StreamEvent::Assistant {
                    message,
                    session_id,
                }) => {
                    if summary.session_id.is_none() {
                        summary.session_id = session_id;
                    }
                    for block in message.content {
                        match block {
                            ContentBlock::ToolUse { name, input } => {
                                let description = describe_tool_use(&name, &input);
                                let _ = events.send(WorkerEvent::ToolUse {
                                    tool: name,
                                    description,
                                });
                            }
                            ContentBlock::Text { text } => {
                                summary.text.push_str(&text);
                                summary.text.push('\n');
                                let _ = events.send(WorkerEvent::Text { text });
                            }
                            ContentBlock::Other => {}
                        }
                    }
                }
                Ok(StreamEvent::Result {
                    result,
                    is_error,
                    session_id,
                    usage,
                    ..
                }) => {
                    summary.result = result;
                    summary.is_error = is_error;
                    if session_id.is_some() {
                        summary.session_id = session_id;
                    }
                    summary.usage = usage.map(|u| ContextUsage::Reported {
                        input_tokens: u.total_input(),
                        output_tokens: u.output_tokens,
                    });
                }
                Ok(StreamEvent::User { .. }) => {}
                Err(_) => {
                    // Not stream-json; keep it as plain output.
                    summary.text.push_str(&line);
                    summary.text.push('\n');
                }
            }
        }
        Ok(summary)
    }
}

fn is_session_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    SESSION_ERROR_MARKERS.iter().any(|m| lower.contains(m))
}

#[async_trait]
impl Worker for ClaudeWorker {
    async fn invoke(
        &self,
        request: WorkerRequest,
        events: mpsc::UnboundedSender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> WorkerOutcome {
        let flags = self.flags(&request);
        self.write_log(&request, "prompt.md", &request.prompt);
        tracing::info!(
            role = %request.role,
            tasks = ?request.task_ids(),
            resumed = request.is_resumed(),
            model = request.model.as_deref().unwrap_or("default"),
            "spawning worker"
        );

        let mut child = match Command::new(&self.config.cmd)
            .args(&flags)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.config.project_dir)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return WorkerOutcome::Unrecoverable {
                    message: format!("failed to spawn '{}': {}", self.config.cmd, e),
                };
            }
        };

        let start = Instant::now();

        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(request.prompt.as_bytes()).await?;
                stdin.shutdown().await
            }
            .await;
            if let Err(e) = written {
                let _ = child.kill().await;
                return WorkerOutcome::RecoverableError {
                    message: format!("failed to write prompt to worker: {}", e),
                };
            }
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return WorkerOutcome::Unrecoverable {
                message: "worker stdout unavailable".to_string(),
            };
        };

        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => RunEnd::Cancelled,
            res = tokio::time::timeout(request.timeout, Self::read_stream(stdout, &events)) => {
                match res {
                    Ok(summary) => RunEnd::Finished(summary),
                    Err(_) => RunEnd::TimedOut,
                }
            }
        };

        let summary = match end {
            RunEnd::Cancelled => {
                let _ = child.kill().await;
                tracing::info!(role = %request.role, "worker cancelled");
                return WorkerOutcome::Cancelled;
            }
            RunEnd::TimedOut => {
                let _ = child.kill().await;
                let elapsed = start.elapsed();
                tracing::warn!(role = %request.role, elapsed_secs = elapsed.as_secs(), "worker timed out");
                return WorkerOutcome::Timeout { elapsed };
            }
            RunEnd::Finished(Err(e)) => {
                let _ = child.kill().await;
                return WorkerOutcome::RecoverableError {
                    message: format!("failed to read worker output: {}", e),
                };
            }
            RunEnd::Finished(Ok(summary)) => summary,
        };

        let status = match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                let _ = child.kill().await;
                None
            }
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let output = summary.result.clone().unwrap_or_else(|| summary.text.clone());
        self.write_log(&request, "output.log", &output);

        let exit_ok = status.is_some_and(|s| s.success());
        if summary.is_error || !exit_ok {
            let detail = if summary.is_error {
                output.clone()
            } else {
                format!(
                    "worker exited with {}: {}",
                    status
                        .and_then(|s| s.code())
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".into()),
                    stderr.trim()
                )
            };
            let message = truncate_chars(detail.trim(), 2000);
            if request.is_resumed() && (is_session_error(&message) || is_session_error(&stderr)) {
                return WorkerOutcome::Unrecoverable { message };
            }
            return WorkerOutcome::RecoverableError { message };
        }

        if output.trim().is_empty() {
            return WorkerOutcome::RecoverableError {
                message: "worker finished without output".to_string(),
            };
        }

        WorkerOutcome::Success {
            output,
            usage: summary.usage,
            session_token: summary.session_id,
        }
    }
}
