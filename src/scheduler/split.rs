//! Splitting oversized tasks before dispatch.

use std::collections::HashSet;

use crate::crew_config::SplitSection;
use crate::tasks::complexity::{clauses, estimate, strip_annotations};
use crate::tasks::{TaskId, TaskList};

#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub enabled: bool,
    pub threshold: u32,
    pub max_parts: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 6,
            max_parts: 4,
        }
    }
}

impl From<&SplitSection> for SplitConfig {
    fn from(section: &SplitSection) -> Self {
        Self {
            enabled: section.enabled,
            threshold: section.threshold,
            max_parts: section.max_parts,
        }
    }
}

/// A task to replace with smaller ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    pub task_id: TaskId,
    pub score: u32,
    pub parts: Vec<String>,
}

/// Merge trailing clauses so there are at most `max` parts.
fn fold_parts(mut parts: Vec<String>, max: usize) -> Vec<String> {
    if parts.len() <= max || max < 2 {
        return parts;
    }
    let tail = parts.split_off(max - 1).join("; ");
    parts.push(tail);
    parts
}

/// Plan splits for dispatchable tasks in scope whose complexity estimate
/// exceeds the threshold. Tasks produced by a split are never split again,
/// and tasks that do not break into at least two clauses are left whole.
pub fn plan_splits(
    list: &TaskList,
    scope: Option<&str>,
    in_flight: &HashSet<TaskId>,
    escalated: &HashSet<TaskId>,
    config: &SplitConfig,
) -> Vec<SplitPlan> {
    if !config.enabled {
        return Vec::new();
    }
    list.tasks()
        .filter(|t| scope.is_none_or(|s| t.section == s))
        .filter(|t| t.is_open() && t.split_from.is_none())
        .filter(|t| !in_flight.contains(&t.id) && !escalated.contains(&t.id))
        .filter_map(|t| {
            let score = estimate(&t.description).score();
            if score <= config.threshold {
                return None;
            }
            let parts = fold_parts(clauses(&strip_annotations(&t.description)), config.max_parts);
            if parts.len() < 2 {
                return None;
            }
            Some(SplitPlan {
                task_id: t.id,
                score,
                parts,
            })
        })
        .collect()
}

/// Apply plans to the list, returning `(parent, children)` pairs.
pub fn apply_splits(list: &mut TaskList, plans: &[SplitPlan]) -> Vec<(TaskId, Vec<TaskId>)> {
    plans
        .iter()
        .filter_map(|plan| {
            let children = list.split(plan.task_id, &plan.parts);
            (!children.is_empty()).then_some((plan.task_id, children))
        })
        .collect()
}
