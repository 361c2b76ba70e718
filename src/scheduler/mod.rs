//! Task scheduler: picks the next dispatch units from the task list.
//!
//! Sections are lanes. Without cross-section parallelism only the earliest
//! section with an open task is a lane; with it every such section is, and
//! lanes are served round-robin. Inside a lane tasks are offered strictly in
//! declaration order: a task whose role is already busy holds back the tasks
//! behind it, so dispatch order within a section matches the document.

pub mod split;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::crew_config::ExecutionSection;
use crate::tasks::{Role, Task, TaskId, TaskList};

pub use split::{SplitConfig, SplitPlan, plan_splits};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cross_section_parallel: bool,
    pub batching: bool,
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cross_section_parallel: false,
            batching: false,
            batch_size: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn from_section(section: &ExecutionSection) -> Self {
        Self {
            cross_section_parallel: section.cross_section_parallel,
            batching: section.batching,
            batch_size: section.batch_size.max(1),
        }
    }

    fn effective_batch_size(&self) -> usize {
        if self.batching { self.batch_size.max(1) } else { 1 }
    }
}

/// One invocation of the worker: one task, or a batch of same-role tasks
/// from one section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchUnit {
    pub role: Role,
    pub section: String,
    pub task_ids: Vec<TaskId>,
}

/// What the coordinating loop should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Start these units now.
    Dispatch(Vec<DispatchUnit>),
    /// Nothing new can start; dispatches are in flight.
    Waiting,
    /// Nothing is in flight and every remaining task is escalated.
    Blocked { task_ids: Vec<TaskId> },
    /// No open tasks remain in scope.
    Exhausted,
}

/// Run-time facts the scheduler needs besides the task list.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleContext<'a> {
    /// Restrict scheduling to one section (gate phases).
    pub scope: Option<&'a str>,
    pub in_flight: &'a HashSet<TaskId>,
    pub escalated: &'a HashSet<TaskId>,
    pub busy_roles: &'a BTreeSet<Role>,
    pub free_slots: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TaskScheduler {
    config: SchedulerConfig,
}

struct Lane<'a> {
    section: &'a str,
    queue: Vec<&'a Task>,
    cursor: usize,
    stalled: bool,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Choose the next units to dispatch.
    pub fn next(&self, list: &TaskList, ctx: &ScheduleContext<'_>) -> Schedule {
        let in_scope: Vec<_> = list
            .sections
            .iter()
            .filter(|s| ctx.scope.is_none_or(|scope| s.name == scope))
            .filter(|s| s.has_open_tasks())
            .collect();
        if in_scope.is_empty() {
            return Schedule::Exhausted;
        }

        // Sections run in declaration order: the earliest section with open
        // work is the only lane, even when all of it awaits a human. Across
        // sections, a section whose only open tasks are escalated is not a
        // lane, so it holds back nothing but itself.
        let lane_sections: Vec<_> = if self.config.cross_section_parallel {
            in_scope
                .iter()
                .copied()
                .filter(|s| {
                    s.tasks
                        .iter()
                        .any(|t| t.is_open() && !ctx.escalated.contains(&t.id))
                })
                .collect()
        } else {
            in_scope.iter().copied().take(1).collect()
        };

        let mut lanes: Vec<Lane<'_>> = lane_sections
            .iter()
            .map(|s| Lane {
                section: &s.name,
                queue: s
                    .tasks
                    .iter()
                    .filter(|t| {
                        t.is_open() && !ctx.in_flight.contains(&t.id) && !ctx.escalated.contains(&t.id)
                    })
                    .collect(),
                cursor: 0,
                stalled: false,
            })
            .collect();

        let batch_size = self.config.effective_batch_size();
        let mut busy: BTreeSet<Role> = ctx.busy_roles.clone();
        let mut units = Vec::new();
        let mut slots = ctx.free_slots;

        while slots > 0 {
            let mut progressed = false;
            for lane in lanes.iter_mut() {
                if slots == 0 {
                    break;
                }
                if lane.stalled || lane.cursor >= lane.queue.len() {
                    continue;
                }
                let head = lane.queue[lane.cursor];
                if busy.contains(&head.role) {
                    lane.stalled = true;
                    continue;
                }
                let mut task_ids = vec![head.id];
                let mut next = lane.cursor + 1;
                while task_ids.len() < batch_size
                    && next < lane.queue.len()
                    && lane.queue[next].role == head.role
                {
                    task_ids.push(lane.queue[next].id);
                    next += 1;
                }
                lane.cursor = next;
                busy.insert(head.role.clone());
                units.push(DispatchUnit {
                    role: head.role.clone(),
                    section: lane.section.to_string(),
                    task_ids,
                });
                slots -= 1;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        if !units.is_empty() {
            tracing::debug!(units = units.len(), "scheduled dispatch units");
            return Schedule::Dispatch(units);
        }
        if !ctx.in_flight.is_empty() {
            return Schedule::Waiting;
        }

        if lanes.iter().all(|lane| lane.queue.is_empty()) {
            let sections = if lane_sections.is_empty() {
                &in_scope
            } else {
                &lane_sections
            };
            let escalated: Vec<TaskId> = sections
                .iter()
                .flat_map(|s| s.tasks.iter())
                .filter(|t| t.is_open())
                .map(|t| t.id)
                .collect();
            return Schedule::Blocked { task_ids: escalated };
        }
        Schedule::Waiting
    }
}
