//! File-backed task list with serialized read-modify-write.

use std::path::{Path, PathBuf};

use super::parser;
use super::types::TaskList;
use crate::errors::TaskListError;
use crate::util::{FileLock, write_atomic};

/// `TODO.md` on disk, guarded by an advisory lock file.
///
/// Every mutation goes through [`TaskStore::update`], which holds the lock
/// across re-read, change and atomic write, so two completions landing at
/// the same time cannot lose each other's update.
#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_path: lock_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the task list. A missing file is an empty list.
    pub fn load(&self) -> Result<TaskList, TaskListError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => parser::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TaskList::new()),
            Err(source) => Err(TaskListError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Overwrite the task list.
    pub fn save(&self, list: &TaskList) -> Result<(), TaskListError> {
        let _lock = self.lock()?;
        self.write(list)
    }

    /// Apply `f` to the freshly read list under the lock and persist the
    /// result if it changed.
    pub fn update<R>(&self, f: impl FnOnce(&mut TaskList) -> R) -> Result<(TaskList, R), TaskListError> {
        let _lock = self.lock()?;
        let mut list = self.load()?;
        let before = list.clone();
        let result = f(&mut list);
        if list != before {
            self.write(&list)?;
        }
        Ok((list, result))
    }

    fn lock(&self) -> Result<FileLock, TaskListError> {
        FileLock::acquire(&self.lock_path).map_err(|source| TaskListError::Lock {
            path: self.lock_path.clone(),
            source,
        })
    }

    fn write(&self, list: &TaskList) -> Result<(), TaskListError> {
        write_atomic(&self.path, &parser::serialize(list)).map_err(|source| TaskListError::Io {
            path: self.path.clone(),
            source,
        })
    }
}
