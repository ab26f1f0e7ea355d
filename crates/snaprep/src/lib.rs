pub mod capabilities;
pub mod config;
pub mod dataset;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod log_sanitize;
pub mod logging;
pub mod planner;
pub mod report;
pub mod retention;
pub mod runner;
pub mod session;
pub mod target;
pub mod transfer;
pub mod usage;

pub use error::{Error, Result};

/// Name used for the run identifier, the syslog tag default and report subjects.
pub const PROGRAM_NAME: &str = "snaprep";
