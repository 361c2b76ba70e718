//! Task list model: the `TODO.md` checklist as structured records.
//!
//! | Submodule | Purpose |
//! |-----------|---------|
//! | `types` | `Task`, `Section`, `TaskList` and the mutations the scheduler applies |
//! | `parser` | strict parse / canonical serialize of the checklist document |
//! | `store` | locked read-modify-write against the file on disk |
//! | `complexity` | keyword estimate used for splitting and model routing |

pub mod complexity;
pub mod parser;
pub mod store;
pub mod types;

pub use complexity::{Complexity, ComplexityClass, classify, estimate, strip_annotations};
pub use parser::{parse, serialize};
pub use store::TaskStore;
pub use types::{
    DEFAULT_ROLE, DEFAULT_SECTION, Role, Section, Task, TaskCounts, TaskId, TaskList, TaskState,
};
