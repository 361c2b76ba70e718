pub mod config;
pub mod crew_config;
pub mod dispatch;
pub mod errors;
pub mod init;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod policy;
pub mod scheduler;
pub mod session;
pub mod summary;
pub mod tasks;
pub mod ui;
pub mod util;
pub mod workflow;
pub mod worker;
