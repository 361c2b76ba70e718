//! Project memory kept in `MEMORY.md`.
//!
//! Three bounded logs, newest first: decisions workers stated, actions taken
//! (completions, skips, removals), and lessons (advisory gate findings).
//! Recent decisions are fed back into each dispatch as context.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use regex::Regex;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::LazyLock;

use crate::crew_config::MemorySection;
use crate::tasks::types::single_line;
use crate::util::write_atomic;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

static ENTRY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^- \[(\d{4}-\d{2}-\d{2} \d{2}:\d{2})\] (.+)$").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Log {
    Decisions,
    Actions,
    Lessons,
}

impl Log {
    fn heading(&self) -> &'static str {
        match self {
            Log::Decisions => "Decisions",
            Log::Actions => "Actions Log",
            Log::Lessons => "Lessons Learned",
        }
    }

    fn from_heading(heading: &str) -> Option<Self> {
        match heading.trim().to_lowercase().as_str() {
            "decisions" => Some(Log::Decisions),
            "actions log" | "actions" => Some(Log::Actions),
            "lessons learned" | "lessons" => Some(Log::Lessons),
            _ => None,
        }
    }
}

/// One timestamped memory line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    pub at: DateTime<Local>,
    pub text: String,
}

impl MemoryEntry {
    fn now(text: &str) -> Self {
        Self {
            at: Local::now(),
            text: single_line(text),
        }
    }
}

/// Bounds for each log.
#[derive(Debug, Clone, Copy)]
pub struct MemoryCaps {
    pub decisions: usize,
    pub actions: usize,
    pub lessons: usize,
}

impl Default for MemoryCaps {
    fn default() -> Self {
        Self {
            decisions: 20,
            actions: 100,
            lessons: 50,
        }
    }
}

impl From<&MemorySection> for MemoryCaps {
    fn from(section: &MemorySection) -> Self {
        Self {
            decisions: section.decisions_cap,
            actions: section.actions_cap,
            lessons: section.lessons_cap,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    caps: MemoryCaps,
    decisions: VecDeque<MemoryEntry>,
    actions: VecDeque<MemoryEntry>,
    lessons: VecDeque<MemoryEntry>,
}

impl MemoryLog {
    pub fn new(caps: MemoryCaps) -> Self {
        Self {
            caps,
            ..Self::default()
        }
    }

    /// Load `MEMORY.md`; a missing file is an empty log. Lines that are not
    /// timestamped entries under a known heading are ignored.
    pub fn load(path: &Path, caps: MemoryCaps) -> Result<Self> {
        let mut log = Self::new(caps);
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(log),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read memory file: {}", path.display()));
            }
        };

        let mut current = None;
        for line in content.lines() {
            if let Some(heading) = line.strip_prefix("## ") {
                current = Log::from_heading(heading);
                continue;
            }
            let (Some(which), Some(caps)) = (current, ENTRY_REGEX.captures(line.trim_end())) else {
                continue;
            };
            let Ok(naive) = NaiveDateTime::parse_from_str(&caps[1], TIMESTAMP_FORMAT) else {
                continue;
            };
            let Some(at) = Local.from_local_datetime(&naive).earliest() else {
                continue;
            };
            log.entries_mut(which).push_back(MemoryEntry {
                at,
                text: caps[2].to_string(),
            });
        }
        for which in [Log::Decisions, Log::Actions, Log::Lessons] {
            log.enforce_cap(which);
        }
        Ok(log)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.render())
            .with_context(|| format!("Failed to write memory file: {}", path.display()))
    }

    fn entries_mut(&mut self, which: Log) -> &mut VecDeque<MemoryEntry> {
        match which {
            Log::Decisions => &mut self.decisions,
            Log::Actions => &mut self.actions,
            Log::Lessons => &mut self.lessons,
        }
    }

    fn entries(&self, which: Log) -> &VecDeque<MemoryEntry> {
        match which {
            Log::Decisions => &self.decisions,
            Log::Actions => &self.actions,
            Log::Lessons => &self.lessons,
        }
    }

    fn cap(&self, which: Log) -> usize {
        match which {
            Log::Decisions => self.caps.decisions,
            Log::Actions => self.caps.actions,
            Log::Lessons => self.caps.lessons,
        }
    }

    fn enforce_cap(&mut self, which: Log) {
        let cap = self.cap(which);
        self.entries_mut(which).truncate(cap);
    }

    fn push(&mut self, which: Log, text: &str) {
        let entry = MemoryEntry::now(text);
        if entry.text.is_empty() {
            return;
        }
        self.entries_mut(which).push_front(entry);
        self.enforce_cap(which);
    }

    /// Record a decision; the oldest decision is evicted beyond the cap.
    pub fn record_decision(&mut self, text: &str) {
        self.push(Log::Decisions, text);
    }

    pub fn record_action(&mut self, text: &str) {
        self.push(Log::Actions, text);
    }

    pub fn record_lesson(&mut self, text: &str) {
        self.push(Log::Lessons, text);
    }

    /// The `n` most recent decisions, newest first.
    pub fn recent_decisions(&self, n: usize) -> Vec<String> {
        self.decisions.iter().take(n).map(|e| e.text.clone()).collect()
    }

    pub fn decisions(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.decisions.iter()
    }

    pub fn actions(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.actions.iter()
    }

    pub fn lessons(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.lessons.iter()
    }

    pub fn render(&self) -> String {
        let mut out = String::from("# Project Memory\n\n");
        out.push_str("This file tracks decisions, actions, and lessons learned.\n");
        for which in [Log::Decisions, Log::Actions, Log::Lessons] {
            let _ = write!(out, "\n## {}\n\n", which.heading());
            for entry in self.entries(which) {
                let _ = writeln!(
                    out,
                    "- [{}] {}",
                    entry.at.format(TIMESTAMP_FORMAT),
                    entry.text
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_decisions_are_bounded_newest_first() {
        let mut log = MemoryLog::new(MemoryCaps {
            decisions: 3,
            ..MemoryCaps::default()
        });
        for i in 1..=5 {
            log.record_decision(&format!("decision {i}"));
        }
        assert_eq!(
            log.recent_decisions(10),
            vec!["decision 5", "decision 4", "decision 3"]
        );
        assert_eq!(log.recent_decisions(1), vec!["decision 5"]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MEMORY.md");
        let mut log = MemoryLog::new(MemoryCaps::default());
        log.record_decision("Use PostgreSQL");
        log.record_action("T1 completed by engineer: Build API");
        log.record_lesson("Validate inputs at the boundary");
        log.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("## Decisions"));
        assert!(text.contains("Use PostgreSQL"));

        let loaded = MemoryLog::load(&path, MemoryCaps::default()).unwrap();
        assert_eq!(loaded.recent_decisions(5), vec!["Use PostgreSQL"]);
        assert_eq!(loaded.actions().count(), 1);
        assert_eq!(loaded.lessons().count(), 1);
    }

    #[test]
    fn test_load_ignores_prose_and_applies_caps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MEMORY.md");
        std::fs::write(
            &path,
            "# Project Memory\n\n## Decisions\n\nSome prose.\n- [2026-01-02 10:00] B\n- [2026-01-01 10:00] A\n- not an entry\n",
        )
        .unwrap();
        let loaded = MemoryLog::load(
            &path,
            MemoryCaps {
                decisions: 1,
                ..MemoryCaps::default()
            },
        )
        .unwrap();
        assert_eq!(loaded.recent_decisions(5), vec!["B"]);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let log = MemoryLog::load(&dir.path().join("MEMORY.md"), MemoryCaps::default()).unwrap();
        assert!(log.recent_decisions(5).is_empty());
    }
}
