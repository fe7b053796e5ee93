//! JSON run report.

use crate::config::{Mode, RunConfig};
use chmigrate_core::{MigrationResult, MigrationStatus};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Server a run talked to. Never carries the password.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
}

/// What was run, and against which server.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationInfo {
    pub mode: Mode,
    pub database: String,
    /// The table, or `all` in full mode.
    pub table: String,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    pub s3_policy: String,
    pub clickhouse_config: ServerInfo,
}

impl MigrationInfo {
    /// Describe a run started at `start_time`.
    pub fn new(config: &RunConfig, start_time: DateTime<Local>) -> Self {
        Self {
            mode: config.mode,
            database: config.database.clone(),
            table: config.table.clone().unwrap_or_else(|| "all".to_string()),
            start_time,
            end_time: None,
            s3_policy: config.migration.storage_policy.clone(),
            clickhouse_config: ServerInfo {
                host: config.client.host.clone(),
                port: config.client.port,
                user: config.client.user.clone(),
            },
        }
    }
}

/// Local tables behind the distributed tables of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistributedSummary {
    pub total_distributed_tables: usize,
    pub total_local_tables: usize,
    pub completed_local_tables: usize,
    pub failed_local_tables: usize,
    pub skipped_local_tables: usize,
}

/// Counts over the results of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total_tables: usize,
    pub completed_tables: usize,
    pub failed_tables: usize,
    pub skipped_tables: usize,
    pub locked_tables: usize,
    pub lock_failed_tables: usize,
    pub total_rows: u64,
    pub migrated_rows: u64,
    pub distributed_tables: DistributedSummary,
}

impl Summary {
    /// Tally `results`.
    pub fn from_results(results: &[MigrationResult]) -> Self {
        let mut summary = Summary {
            total_tables: results.len(),
            ..Default::default()
        };

        for result in results {
            match result.status {
                MigrationStatus::Completed => summary.completed_tables += 1,
                MigrationStatus::Failed => summary.failed_tables += 1,
                MigrationStatus::Skipped => summary.skipped_tables += 1,
                MigrationStatus::Locked => summary.locked_tables += 1,
                MigrationStatus::LockFailed => summary.lock_failed_tables += 1,
            }
            summary.total_rows += result.total_rows;
            summary.migrated_rows += result.migrated_rows;

            let dist = &mut summary.distributed_tables;
            if result.cluster.is_some() {
                dist.total_distributed_tables += 1;
            }
            for local in &result.local_tables {
                dist.total_local_tables += 1;
                match local.status {
                    MigrationStatus::Completed => dist.completed_local_tables += 1,
                    MigrationStatus::Skipped => dist.skipped_local_tables += 1,
                    _ => dist.failed_local_tables += 1,
                }
            }
        }

        summary
    }

    /// Whether the run has to exit non-zero.
    pub fn has_failures(&self) -> bool {
        self.failed_tables > 0 || self.lock_failed_tables > 0
    }
}

/// The report written at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub migration_info: MigrationInfo,
    pub results: Vec<MigrationResult>,
    pub summary: Summary,
}

impl Report {
    /// Build a report, stamping the end time.
    pub fn new(mut info: MigrationInfo, results: Vec<MigrationResult>) -> Self {
        info.end_time = Some(Local::now());
        let summary = Summary::from_results(&results);
        Self {
            migration_info: info,
            results,
            summary,
        }
    }

    /// Write the report as `clickhouse_s3_migration_report_<ts>.json` in `dir`.
    pub fn write(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let name = format!(
            "clickhouse_s3_migration_report_{}.json",
            self.migration_info.start_time.format("%Y%m%d_%H%M%S")
        );
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    /// Log the summary and every table that did not finish cleanly.
    pub fn log_summary(&self) {
        let s = &self.summary;
        info!(
            total = s.total_tables,
            completed = s.completed_tables,
            failed = s.failed_tables,
            skipped = s.skipped_tables,
            locked = s.locked_tables,
            lock_failed = s.lock_failed_tables,
            total_rows = s.total_rows,
            migrated_rows = s.migrated_rows,
            "Migration summary"
        );
        let dist = &s.distributed_tables;
        if dist.total_local_tables > 0 {
            info!(
                distributed = dist.total_distributed_tables,
                local_tables = dist.total_local_tables,
                completed = dist.completed_local_tables,
                failed = dist.failed_local_tables,
                skipped = dist.skipped_local_tables,
                "Local tables of distributed tables"
            );
        }

        for result in &self.results {
            if result.status.is_failure() || result.status == MigrationStatus::Locked {
                warn!(
                    database = %result.database,
                    table = %result.table,
                    status = %result.status,
                    error = result.error.as_deref().unwrap_or(""),
                    "Table not migrated"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Args, FileConfig};

    fn config() -> RunConfig {
        Args {
            mode: Mode::Full,
            database: "dws".into(),
            password: Some("hunter2".into()),
            ..Default::default()
        }
        .merge(FileConfig::default())
        .unwrap()
    }

    fn result(table: &str, status: MigrationStatus, rows: u64) -> MigrationResult {
        let mut result = MigrationResult::new("dws", table);
        result.total_rows = rows;
        result.migrated_rows = rows;
        result.finish(status)
    }

    #[test]
    fn test_summary_counts() {
        let mut facade = result("events", MigrationStatus::Completed, 10);
        facade.cluster = Some("ck".into());
        facade.local_tables = vec![result("events_local", MigrationStatus::Completed, 10)];

        let results = vec![
            result("a", MigrationStatus::Completed, 5),
            result("b", MigrationStatus::Skipped, 0),
            result("c", MigrationStatus::Locked, 0),
            facade,
        ];
        let summary = Summary::from_results(&results);

        assert_eq!(summary.total_tables, 4);
        assert_eq!(summary.completed_tables, 2);
        assert_eq!(summary.skipped_tables, 1);
        assert_eq!(summary.locked_tables, 1);
        assert_eq!(summary.migrated_rows, 15);
        assert_eq!(summary.distributed_tables.total_distributed_tables, 1);
        assert_eq!(summary.distributed_tables.total_local_tables, 1);
        assert_eq!(summary.distributed_tables.completed_local_tables, 1);
        assert!(!summary.has_failures());
    }

    #[test]
    fn test_lock_failed_is_a_failure() {
        let summary = Summary::from_results(&[result("a", MigrationStatus::LockFailed, 0)]);
        assert!(summary.has_failures());
    }

    #[test]
    fn test_report_written_without_password() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let report = Report::new(
            MigrationInfo::new(&config, Local::now()),
            vec![result("a", MigrationStatus::Failed, 0)],
        );

        let path = report.write(dir.path()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("clickhouse_s3_migration_report_"));
        assert!(name.ends_with(".json"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("hunter2"));

        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["migration_info"]["mode"], "full");
        assert_eq!(json["migration_info"]["table"], "all");
        assert_eq!(json["migration_info"]["s3_policy"], "s3");
        assert_eq!(json["results"][0]["status"], "failed");
        assert_eq!(json["migration_info"]["clickhouse_config"]["port"], 8123);
        assert_eq!(json["summary"]["failed_tables"], 1);
    }
}
