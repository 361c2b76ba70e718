//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                        |
//! |-----------------|---------------------------------------------------------|
//! | `project`       | `Init`                                                  |
//! | `run`           | `Run`                                                   |
//! | `plan`          | `Plan`, `Feature`                                       |
//! | `status`        | `Status`, `Tasks`                                       |
//! | `control`       | `Resolve`, `SetStatus`, `Gates`, `Accept`, `Reject`     |
//! | `config`        | `Config`                                                |

pub mod config;
pub mod control;
pub mod plan;
pub mod project;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use control::{cmd_accept, cmd_gates, cmd_reject, cmd_resolve, cmd_set_status};
pub use plan::cmd_plan;
pub use project::cmd_init;
pub use run::{RunOptions, cmd_run};
pub use status::{cmd_status, cmd_tasks};
