//! chmigrate command-line tool.
//!
//! Resolves the run configuration, sets up logging, runs the migration
//! through [`chmigrate_core::Migrator`] and writes the JSON report.

pub mod config;
pub mod logging;
pub mod report;
pub mod run;

pub use config::{Args, ConfigError, FileConfig, LogConfig, Mode, RunConfig};
pub use report::{MigrationInfo, Report, Summary};
