//! Console and file log sinks.

use crate::config::LogConfig;
use chrono::{DateTime, Local};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Name of the log file for a run started at `started`.
pub fn log_file_name(started: DateTime<Local>) -> String {
    format!("ch_migration_{}.log", started.format("%Y%m%d_%H%M%S"))
}

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(level: &str) -> String {
    format!("chmigrate={level}")
}

/// Install the global subscriber: a console layer plus a plain-text layer
/// writing to a new file in `config.path`. Returns the log file path.
pub fn init(config: &LogConfig, started: DateTime<Local>) -> anyhow::Result<PathBuf> {
    let path = create_log_file_path(&config.path, started)?;
    let file = File::create(&path)?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.level))),
        )
        .with(fmt::layer())
        .with(
            fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()?;

    Ok(path)
}

fn create_log_file_path(dir: &Path, started: DateTime<Local>) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    Ok(dir.join(log_file_name(started)))
}
