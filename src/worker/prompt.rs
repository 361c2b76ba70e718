//! Dispatch prompt rendering.
//!
//! A fresh session gets the role definition up front. A resumed session
//! already holds it, so only the delta goes out: the stale-file warning,
//! current context and the task itself.

use std::fmt::Write as _;

use super::roles::profile;
use super::{DispatchContext, WorkItem};
use crate::tasks::Role;

/// Role introduction and preamble for a fresh session.
pub fn role_preamble(project: &str, role: &Role) -> String {
    let p = profile(role);
    format!(
        "You are the {} on a multi-role development team building {}.\n\
         Teammates with other roles work on the same project at the same time.\n\
         The project specification is in SPEC.md and the task list in TODO.md; read only what your task needs.\n\n{}",
        p.title, project, p.preamble
    )
}

/// Render the full instruction for a dispatch.
pub fn build_prompt(preamble: Option<&str>, tasks: &[WorkItem], context: &DispatchContext) -> String {
    let mut out = String::new();

    if let Some(preamble) = preamble {
        out.push_str(preamble.trim_end());
        out.push_str("\n\n");
    }

    if !context.stale_files.is_empty() {
        out.push_str("## Files Changed Since Your Last Task\n");
        out.push_str(
            "Other roles modified these files after you last worked. Re-read them before editing; do not overwrite their changes from memory.\n",
        );
        for path in &context.stale_files {
            let _ = writeln!(out, "- {}", path.display());
        }
        out.push('\n');
    }

    if !context.recent_decisions.is_empty() || !context.sibling_tasks.is_empty() {
        out.push_str("## Current Context\n");
        if !context.recent_decisions.is_empty() {
            out.push_str("Recent decisions:\n");
            for d in &context.recent_decisions {
                let _ = writeln!(out, "- {}", d);
            }
        }
        if !context.sibling_tasks.is_empty() {
            out.push_str("Other open tasks in this section (not yours to do now):\n");
            for t in &context.sibling_tasks {
                let _ = writeln!(out, "- {}", t);
            }
        }
        out.push('\n');
    }

    if tasks.len() == 1 {
        out.push_str("## Your Task\n");
    } else {
        out.push_str("## Your Tasks\n");
    }
    for task in tasks {
        let _ = writeln!(out, "{}: {}", task.id, task.description);
        if let Some(ref err) = task.prior_error {
            let _ = writeln!(
                out,
                "  Previous attempt failed: {}. Take a different approach.",
                err
            );
        }
    }
    out.push('\n');

    out.push_str("## Instructions\n");
    out.push_str("- Complete the work in the project directory and verify it.\n");
    out.push_str("- Record any decision teammates should follow as <decision>...</decision>.\n");
    if tasks.len() > 1 {
        out.push_str(
            "- Work through the tasks in order. For any task you could not complete, output <failed>T<n>: reason</failed>.\n",
        );
    }
    out
}
