//! Per-table migration outcome.

use crate::validator::PartitionCheck;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final status of one table migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Data moved and the backup table swapped in.
    Completed,
    /// The table already uses the target storage policy.
    Skipped,
    /// Another process is migrating the table.
    Locked,
    /// The lock could not be acquired within the timeout.
    LockFailed,
    /// The migration stopped on an error.
    Failed,
}

impl MigrationStatus {
    /// Whether the status counts as a failure of the run.
    pub fn is_failure(&self) -> bool {
        matches!(self, MigrationStatus::Failed | MigrationStatus::LockFailed)
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Completed => write!(f, "completed"),
            MigrationStatus::Skipped => write!(f, "skipped"),
            MigrationStatus::Locked => write!(f, "locked"),
            MigrationStatus::LockFailed => write!(f, "lock_failed"),
            MigrationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of migrating one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Database name.
    pub database: String,
    /// Table name.
    pub table: String,
    /// Final status.
    pub status: MigrationStatus,
    /// When the attempt started.
    pub start_time: DateTime<Utc>,
    /// When the attempt finished.
    pub end_time: Option<DateTime<Utc>>,
    /// Partitions the table had, including ones migrated by earlier runs.
    pub total_partitions: usize,
    /// Partitions migrated, including ones migrated by earlier runs.
    pub completed_partitions: usize,
    /// Rows the backup table must hold once every partition is moved.
    pub total_rows: u64,
    /// Rows moved by this attempt.
    pub migrated_rows: u64,
    /// Error detail for failed attempts.
    pub error: Option<String>,
    /// One entry per partition verified by this attempt.
    pub check_results: Vec<PartitionCheck>,
    /// Cluster of a distributed table.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cluster: Option<String>,
    /// Results of the local tables behind a distributed table.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub local_tables: Vec<MigrationResult>,
}

impl MigrationResult {
    /// Start a result for `database.table`; status is `failed` until set.
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            status: MigrationStatus::Failed,
            start_time: Utc::now(),
            end_time: None,
            total_partitions: 0,
            completed_partitions: 0,
            total_rows: 0,
            migrated_rows: 0,
            error: None,
            check_results: Vec::new(),
            cluster: None,
            local_tables: Vec::new(),
        }
    }

    /// Set the final status and stamp the end time.
    pub fn finish(mut self, status: MigrationStatus) -> Self {
        self.status = status;
        self.end_time = Some(Utc::now());
        self
    }

    /// Finish as `failed` with an error message.
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.finish(MigrationStatus::Failed)
    }

    /// Seconds between start and end, if finished.
    pub fn duration_secs(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds() as f64 / 1000.0)
    }
}
