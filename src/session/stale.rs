//! Detect project files changed since a role last finished a task.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::{DirEntry, WalkDir};

/// Directories never reported as stale context.
const SKIP_DIRS: &[&str] = &[".git", ".crew", "target", "node_modules", "__pycache__", ".venv"];

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIP_DIRS.contains(&name))
}

/// Files under `root` modified after `since`, newest first, at most `cap`.
/// Paths are relative to `root`.
pub fn modified_since(root: &Path, since: SystemTime, cap: usize) -> Vec<PathBuf> {
    if cap == 0 {
        return Vec::new();
    }

    let mut changed: Vec<(SystemTime, PathBuf)> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !is_skipped(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            if modified <= since {
                return None;
            }
            let rel = e.path().strip_prefix(root).ok()?.to_path_buf();
            Some((modified, rel))
        })
        .collect();

    changed.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    changed.truncate(cap);
    changed.into_iter().map(|(_, path)| path).collect()
}
