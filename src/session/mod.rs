//! Per-role worker session tracking.
//!
//! Each role keeps one conversational session with the external worker.
//! Before a dispatch the tracker decides whether the session can be resumed
//! or must be reset; after a successful dispatch it records the resumption
//! token and the context consumed.

pub mod budget;
pub mod stale;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

use crate::crew_config::SessionSection;
use crate::tasks::Role;

pub use budget::{ContextLimit, ContextUsage, parse_context_limit};
pub use stale::modified_since;

/// Why a session was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    /// A new project or feature cycle started.
    NewCycle,
    /// The previous invocation for the role failed at the session level.
    UnrecoverableError,
    /// Consumption reached the configured share of the budget.
    ContextBudget,
    /// Task count since the last reset reached the cap.
    TaskCap,
    ForceStop,
}

impl std::fmt::Display for ResetReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResetReason::NewCycle => "new cycle",
            ResetReason::UnrecoverableError => "unrecoverable error",
            ResetReason::ContextBudget => "context budget reached",
            ResetReason::TaskCap => "task cap reached",
            ResetReason::ForceStop => "force stop",
        };
        f.write_str(s)
    }
}

/// Resolved session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Resume sessions at all; when off every dispatch starts fresh.
    pub continuity: bool,
    pub max_context_chars: usize,
    pub reset_threshold: ContextLimit,
    pub max_tasks_per_session: u32,
    pub stale_file_cap: usize,
    pub chars_per_token: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            continuity: true,
            max_context_chars: 800_000,
            reset_threshold: ContextLimit::default(),
            max_tasks_per_session: 10,
            stale_file_cap: 20,
            chars_per_token: 4,
        }
    }
}

impl SessionConfig {
    pub fn from_section(section: &SessionSection) -> anyhow::Result<Self> {
        Ok(Self {
            continuity: section.continuity,
            max_context_chars: section.max_context_chars,
            reset_threshold: parse_context_limit(&section.reset_threshold)?,
            max_tasks_per_session: section.max_tasks_per_session,
            stale_file_cap: section.stale_file_cap,
            chars_per_token: section.chars_per_token.max(1),
        })
    }

    fn reset_at_chars(&self) -> usize {
        self.reset_threshold.effective_limit(self.max_context_chars)
    }
}

/// Conversational state for one role.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub role: Role,
    pub resume_token: Option<String>,
    pub consumed_chars: usize,
    pub tasks_since_reset: u32,
    /// Cycle the session belongs to.
    pub cycle: u32,
    /// When the role last completed a task.
    pub last_completed_at: Option<SystemTime>,
    unrecoverable: bool,
}

impl Session {
    fn new(role: Role, cycle: u32) -> Self {
        Self {
            role,
            resume_token: None,
            consumed_chars: 0,
            tasks_since_reset: 0,
            cycle,
            last_completed_at: None,
            unrecoverable: false,
        }
    }

    fn clear(&mut self, cycle: u32) {
        self.resume_token = None;
        self.consumed_chars = 0;
        self.tasks_since_reset = 0;
        self.cycle = cycle;
        self.unrecoverable = false;
    }

    fn is_pristine(&self) -> bool {
        self.resume_token.is_none() && self.consumed_chars == 0 && self.tasks_since_reset == 0
    }
}

/// Result of preparing a role's session for a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTicket {
    pub role: Role,
    /// Token to resume with; `None` means a fresh session.
    pub resume_token: Option<String>,
    /// Set when this dispatch forced a reset.
    pub reset: Option<ResetReason>,
    /// For resumed sessions, files modified after this instant may be stale
    /// in the worker's view.
    pub stale_since: Option<SystemTime>,
}

impl SessionTicket {
    pub fn is_fresh(&self) -> bool {
        self.resume_token.is_none()
    }
}

/// Tracks sessions for every role in a project.
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    config: SessionConfig,
    sessions: HashMap<Role, Session>,
    cycle: u32,
}

impl SessionTracker {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            cycle: 0,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Start a new project or feature cycle; existing sessions reset lazily
    /// on their next dispatch.
    pub fn begin_cycle(&mut self) -> u32 {
        self.cycle += 1;
        tracing::debug!(cycle = self.cycle, "session cycle started");
        self.cycle
    }

    pub fn session(&self, role: &Role) -> Option<&Session> {
        self.sessions.get(role)
    }

    /// Reset reason that applies to a session right now, if any.
    fn due_reset(&self, session: &Session) -> Option<ResetReason> {
        if session.cycle != self.cycle {
            Some(ResetReason::NewCycle)
        } else if session.unrecoverable {
            Some(ResetReason::UnrecoverableError)
        } else if session.consumed_chars >= self.config.reset_at_chars() {
            Some(ResetReason::ContextBudget)
        } else if session.tasks_since_reset >= self.config.max_tasks_per_session {
            Some(ResetReason::TaskCap)
        } else {
            None
        }
    }

    /// Decide how the next dispatch for `role` uses its session, applying
    /// any due reset first.
    pub fn prepare(&mut self, role: &Role) -> SessionTicket {
        let cycle = self.cycle;
        let due = self
            .sessions
            .get(role)
            .and_then(|session| self.due_reset(session));
        let session = self
            .sessions
            .entry(role.clone())
            .or_insert_with(|| Session::new(role.clone(), cycle));

        let mut reset = None;
        if let Some(reason) = due {
            if !session.is_pristine() {
                tracing::info!(role = %role, reason = %reason, "resetting worker session");
                reset = Some(reason);
            }
            session.clear(cycle);
        }

        let resume_token = if self.config.continuity {
            session.resume_token.clone()
        } else {
            None
        };
        let stale_since = resume_token.as_ref().and(session.last_completed_at);

        SessionTicket {
            role: role.clone(),
            resume_token,
            reset,
            stale_since,
        }
    }

    /// Record a successful invocation covering `tasks` tasks.
    pub fn record_success(
        &mut self,
        role: &Role,
        token: Option<String>,
        usage: ContextUsage,
        tasks: u32,
    ) {
        let cycle = self.cycle;
        let chars_per_token = self.config.chars_per_token;
        let continuity = self.config.continuity;
        let session = self
            .sessions
            .entry(role.clone())
            .or_insert_with(|| Session::new(role.clone(), cycle));

        if continuity && let Some(token) = token {
            session.resume_token = Some(token);
        }
        session.consumed_chars += usage.chars(chars_per_token);
        session.tasks_since_reset += tasks;
        session.last_completed_at = Some(SystemTime::now());
        tracing::debug!(
            role = %role,
            consumed_chars = session.consumed_chars,
            tasks_since_reset = session.tasks_since_reset,
            reported = usage.is_reported(),
            "session usage recorded"
        );
    }

    /// Flag the role's session for reset before its next dispatch.
    pub fn mark_unrecoverable(&mut self, role: &Role) {
        if let Some(session) = self.sessions.get_mut(role) {
            session.unrecoverable = true;
        }
    }

    /// Reset one role's session now. Returns whether it held any state.
    pub fn reset(&mut self, role: &Role, reason: ResetReason) -> bool {
        let cycle = self.cycle;
        match self.sessions.get_mut(role) {
            Some(session) => {
                let had_state = !session.is_pristine();
                session.clear(cycle);
                if had_state {
                    tracing::info!(role = %role, reason = %reason, "worker session reset");
                }
                had_state
            }
            None => false,
        }
    }

    /// Reset every session, returning the roles that held state.
    pub fn reset_all(&mut self, reason: ResetReason) -> Vec<Role> {
        let mut roles: Vec<Role> = self.sessions.keys().cloned().collect();
        roles.sort();
        roles.retain(|role| self.reset(role, reason));
        roles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_chars: usize, max_tasks: u32) -> SessionTracker {
        SessionTracker::new(SessionConfig {
            max_context_chars: max_chars,
            max_tasks_per_session: max_tasks,
            ..SessionConfig::default()
        })
    }

    fn small_usage() -> ContextUsage {
        ContextUsage::Estimated {
            prompt_chars: 10,
            output_chars: 10,
        }
    }

    #[test]
    fn test_first_dispatch_is_fresh() {
        let mut t = tracker(1000, 10);
        let role = Role::from("engineer");
        let ticket = t.prepare(&role);
        assert!(ticket.is_fresh());
        assert_eq!(ticket.reset, None);
        assert_eq!(ticket.stale_since, None);
    }

    #[test]
    fn test_resumes_after_success() {
        let mut t = tracker(1000, 10);
        let role = Role::from("engineer");
        t.prepare(&role);
        t.record_success(&role, Some("sess-1".into()), small_usage(), 1);

        let ticket = t.prepare(&role);
        assert_eq!(ticket.resume_token.as_deref(), Some("sess-1"));
        assert!(ticket.stale_since.is_some());
        assert_eq!(t.session(&role).unwrap().consumed_chars, 20);
    }

    #[test]
    fn test_context_budget_reset() {
        let mut t = tracker(1000, 10);
        let role = Role::from("engineer");
        t.record_success(
            &role,
            Some("s".into()),
            ContextUsage::Reported {
                input_tokens: 150,
                output_tokens: 50,
            },
            1,
        );
        // 200 tokens * 4 = 800 chars = 80% of 1000
        let ticket = t.prepare(&role);
        assert!(ticket.is_fresh());
        assert_eq!(ticket.reset, Some(ResetReason::ContextBudget));
        let session = t.session(&role).unwrap();
        assert_eq!(session.consumed_chars, 0);
        assert_eq!(session.tasks_since_reset, 0);
    }

    #[test]
    fn test_task_cap_reset() {
        let mut t = tracker(1_000_000, 2);
        let role = Role::from("ui");
        t.record_success(&role, Some("s".into()), small_usage(), 1);
        assert!(!t.prepare(&role).is_fresh());
        t.record_success(&role, Some("s".into()), small_usage(), 1);
        let ticket = t.prepare(&role);
        assert_eq!(ticket.reset, Some(ResetReason::TaskCap));
        assert!(ticket.is_fresh());
    }

    #[test]
    fn test_unrecoverable_resets_on_next_dispatch() {
        let mut t = tracker(1_000_000, 10);
        let role = Role::from("database");
        t.record_success(&role, Some("s".into()), small_usage(), 1);
        t.mark_unrecoverable(&role);
        let ticket = t.prepare(&role);
        assert_eq!(ticket.reset, Some(ResetReason::UnrecoverableError));
        assert!(ticket.is_fresh());
    }

    #[test]
    fn test_new_cycle_resets() {
        let mut t = tracker(1_000_000, 10);
        let role = Role::from("engineer");
        t.record_success(&role, Some("s".into()), small_usage(), 1);
        t.begin_cycle();
        let ticket = t.prepare(&role);
        assert_eq!(ticket.reset, Some(ResetReason::NewCycle));
        assert!(ticket.is_fresh());
        assert_eq!(t.session(&role).unwrap().cycle, 1);
    }

    #[test]
    fn test_reset_clears_token_and_counters() {
        let mut t = tracker(1_000_000, 10);
        let role = Role::from("engineer");
        t.record_success(&role, Some("s".into()), small_usage(), 3);
        assert!(t.reset(&role, ResetReason::ForceStop));
        let session = t.session(&role).unwrap();
        assert_eq!(session.resume_token, None);
        assert_eq!(session.consumed_chars, 0);
        assert_eq!(session.tasks_since_reset, 0);
        assert!(t.prepare(&role).is_fresh());
        assert!(!t.reset(&role, ResetReason::ForceStop));
    }

    #[test]
    fn test_reset_all_reports_roles_with_state() {
        let mut t = tracker(1_000_000, 10);
        t.record_success(&Role::from("ui"), Some("a".into()), small_usage(), 1);
        t.record_success(&Role::from("engineer"), Some("b".into()), small_usage(), 1);
        t.prepare(&Role::from("qa"));
        let roles = t.reset_all(ResetReason::ForceStop);
        assert_eq!(roles, vec![Role::from("engineer"), Role::from("ui")]);
    }

    #[test]
    fn test_continuity_disabled_never_resumes() {
        let mut t = SessionTracker::new(SessionConfig {
            continuity: false,
            ..SessionConfig::default()
        });
        let role = Role::from("engineer");
        t.record_success(&role, Some("s".into()), small_usage(), 1);
        assert!(t.prepare(&role).is_fresh());
    }
}
