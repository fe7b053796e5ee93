//! Run configuration.
//!
//! Values come from, in order of precedence: command-line flags, environment
//! variables, the TOML file named by `--config`, and the defaults below.

use chmigrate_client::config::{DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TIMEOUT, DEFAULT_USER};
use chmigrate_client::ClientConfig;
use chmigrate_core::migration::{
    DEFAULT_CHECKPOINT_FILE, DEFAULT_INSERT_INTERVAL, DEFAULT_LOCK_TIMEOUT, DEFAULT_STORAGE_POLICY,
};
use chmigrate_core::lock::DEFAULT_LOCK_DIR;
use chmigrate_core::MigrationConfig;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default directory for log files.
pub const DEFAULT_LOG_PATH: &str = "./logs";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default directory for run reports.
pub const DEFAULT_REPORT_PATH: &str = "./reports";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Errors building the run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this tool.
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Single-table mode needs a table.
    #[error("--table is required in single mode")]
    MissingTable,

    /// A value is out of range.
    #[error("invalid {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

impl ConfigError {
    fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            name,
            message: message.into(),
        }
    }
}

/// What to migrate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// One table (`--table`).
    #[default]
    Single,
    /// Every eligible table of the database.
    Full,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Single => write!(f, "single"),
            Mode::Full => write!(f, "full"),
        }
    }
}

/// `[clickhouse]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClickHouseSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Option<u64>,
}

/// `[s3]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct S3Section {
    pub policy: Option<String>,
}

/// `[migration]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MigrationSection {
    pub insert_interval: Option<f64>,
    pub resume: Option<bool>,
    pub lock_timeout: Option<u64>,
    pub checkpoint_file: Option<PathBuf>,
    pub lock_dir: Option<PathBuf>,
}

/// `[logging]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub path: Option<PathBuf>,
}

/// `[report]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportSection {
    pub path: Option<PathBuf>,
}

/// Contents of the TOML config file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub clickhouse: ClickHouseSection,
    pub s3: S3Section,
    pub migration: MigrationSection,
    pub logging: LoggingSection,
    pub report: ReportSection,
}

impl FileConfig {
    /// Parse TOML text.
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Level for this tool's own targets, unless `RUST_LOG` is set.
    pub level: String,
    /// Directory receiving the log file.
    pub path: PathBuf,
}

/// Fully resolved configuration of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: Mode,
    pub database: String,
    /// Table for single mode; `None` in full mode.
    pub table: Option<String>,
    pub client: ClientConfig,
    pub migration: MigrationConfig,
    pub checkpoint_file: PathBuf,
    pub lock_dir: PathBuf,
    pub log: LogConfig,
    pub report_path: PathBuf,
}

/// Command-line arguments.
#[derive(Parser, Debug, Default)]
#[command(name = "chmigrate")]
#[command(
    version,
    about = "Move ClickHouse tables onto an S3-backed storage policy",
    long_about = None
)]
pub struct Args {
    /// What to migrate.
    #[arg(long, value_enum)]
    pub mode: Mode,

    /// Database to migrate.
    #[arg(long = "db")]
    pub database: String,

    /// Table to migrate (single mode).
    #[arg(long)]
    pub table: Option<String>,

    /// TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// ClickHouse host.
    #[arg(long, env = "CH_HOST")]
    pub host: Option<String>,

    /// ClickHouse HTTP port.
    #[arg(long, env = "CH_PORT")]
    pub port: Option<u16>,

    /// ClickHouse user.
    #[arg(long, env = "CH_USER")]
    pub user: Option<String>,

    /// ClickHouse password.
    #[arg(long, env = "CH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Target storage policy.
    #[arg(long = "s3-policy", env = "S3_POLICY")]
    pub storage_policy: Option<String>,

    /// Pause between partition copies, in seconds.
    #[arg(long, env = "MIGRATION_INSERT_INTERVAL")]
    pub insert_interval: Option<f64>,

    /// Continue tables that failed in an earlier run.
    #[arg(long, env = "MIGRATION_RESUME")]
    pub resume: bool,

    /// Directory for log files.
    #[arg(long, env = "LOG_PATH")]
    pub log_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Directory for run reports.
    #[arg(long, env = "REPORT_PATH")]
    pub report_path: Option<PathBuf>,

    /// Checkpoint file.
    #[arg(long)]
    pub checkpoint_file: Option<PathBuf>,

    /// Directory for table lock files.
    #[arg(long)]
    pub lock_dir: Option<PathBuf>,

    /// Seconds to wait for a table lock.
    #[arg(long)]
    pub lock_timeout: Option<u64>,

    /// Timeout for one ClickHouse request, in seconds.
    #[arg(long)]
    pub request_timeout: Option<u64>,
}

impl Args {
    /// Load the config file, if any, and resolve the run configuration.
    pub fn into_config(self) -> Result<RunConfig, ConfigError> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        self.merge(file)
    }

    /// Resolve the run configuration over the values of a config file.
    pub fn merge(self, file: FileConfig) -> Result<RunConfig, ConfigError> {
        let table = match self.mode {
            Mode::Single => match self.table {
                Some(table) if !table.trim().is_empty() => Some(table),
                _ => return Err(ConfigError::MissingTable),
            },
            Mode::Full => None,
        };
        if self.database.trim().is_empty() {
            return Err(ConfigError::invalid("database", "must not be empty"));
        }

        let ch = file.clickhouse;
        let request_timeout = self
            .request_timeout
            .or(ch.request_timeout)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        if request_timeout.is_zero() {
            return Err(ConfigError::invalid("request timeout", "must be positive"));
        }
        let client = ClientConfig::new(
            self.host.or(ch.host).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            self.port.or(ch.port).unwrap_or(DEFAULT_PORT),
        )
        .with_credentials(
            self.user.or(ch.user).unwrap_or_else(|| DEFAULT_USER.to_string()),
            self.password.or(ch.password).unwrap_or_default(),
        )
        .with_timeout(request_timeout);

        let policy = self
            .storage_policy
            .or(file.s3.policy)
            .unwrap_or_else(|| DEFAULT_STORAGE_POLICY.to_string());
        if policy.trim().is_empty() {
            return Err(ConfigError::invalid("storage policy", "must not be empty"));
        }

        let mig = file.migration;
        let insert_interval = match self.insert_interval.or(mig.insert_interval) {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|e| ConfigError::invalid("insert interval", e.to_string()))?,
            None => DEFAULT_INSERT_INTERVAL,
        };
        let lock_timeout = self
            .lock_timeout
            .or(mig.lock_timeout)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LOCK_TIMEOUT);
        let migration = MigrationConfig::new(policy)
            .with_insert_interval(insert_interval)
            .with_lock_timeout(lock_timeout)
            .with_resume(self.resume || mig.resume.unwrap_or(false));

        let level = self
            .log_level
            .or(file.logging.level)
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
            .to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::invalid(
                "log level",
                format!("`{level}` is not one of {}", LOG_LEVELS.join(", ")),
            ));
        }

        Ok(RunConfig {
            mode: self.mode,
            database: self.database,
            table,
            client,
            migration,
            checkpoint_file: self
                .checkpoint_file
                .or(mig.checkpoint_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_FILE)),
            lock_dir: self
                .lock_dir
                .or(mig.lock_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_DIR)),
            log: LogConfig {
                level,
                path: self
                    .log_path
                    .or(file.logging.path)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH)),
            },
            report_path: self
                .report_path
                .or(file.report.path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_PATH)),
        })
    }
}
