//! Tags workers emit in their output.
//!
//! - `<decision>Use PostgreSQL for persistence</decision>` records a decision
//! - `<failed>T3: migration could not run</failed>` marks one task of a batch
//!   as failed while the rest of the batch succeeded

use regex::Regex;
use std::sync::LazyLock;

use crate::tasks::TaskId;
use crate::tasks::types::single_line;

static DECISION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<decision>(.*?)</decision>").unwrap());

static FAILED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<failed>\s*([Tt]\d+)\s*:?\s*(.*?)</failed>").unwrap());

/// Decisions stated in worker output, in order, whitespace-collapsed.
pub fn extract_decisions(output: &str) -> Vec<String> {
    DECISION_REGEX
        .captures_iter(output)
        .map(|c| single_line(&c[1]))
        .filter(|d| !d.is_empty())
        .collect()
}

/// Per-task failures reported inside a batch dispatch.
pub fn extract_failures(output: &str) -> Vec<(TaskId, String)> {
    FAILED_REGEX
        .captures_iter(output)
        .filter_map(|c| {
            let id = c[1].parse().ok()?;
            let reason = single_line(&c[2]);
            let reason = if reason.is_empty() {
                "reported as failed without a reason".to_string()
            } else {
                reason
            };
            Some((id, reason))
        })
        .collect()
}
