//! One migration run: preflight, migrate, report.

use crate::config::{Mode, RunConfig};
use crate::report::{MigrationInfo, Report};
use anyhow::Context;
use chmigrate_core::{
    preflight, Checkpoint, ClickHouse, FileCheckpointRepository, FileLockConfig, FileTableLock,
    Migrator,
};
use chrono::{DateTime, Local};
use std::sync::Arc;
use tracing::info;

/// Run the migration described by `config` against `client`.
///
/// An error means the run stopped before producing per-table results:
/// the server or the storage policy failed preflight, the checkpoint file
/// is unreadable, or the tables of the database could not be listed.
pub async fn execute(
    client: Arc<dyn ClickHouse>,
    config: &RunConfig,
    started: DateTime<Local>,
) -> anyhow::Result<Report> {
    let info = MigrationInfo::new(config, started);

    preflight::verify_connection(client.as_ref())
        .await
        .context("ClickHouse connection check failed")?;
    preflight::verify_storage_policy(client.as_ref(), &config.migration.storage_policy)
        .await
        .context("storage policy check failed")?;

    let repository = Arc::new(FileCheckpointRepository::new(&config.checkpoint_file));
    let checkpoint = Checkpoint::load(repository)
        .with_context(|| format!("cannot load checkpoint {}", config.checkpoint_file.display()))?;
    let locks = Arc::new(FileTableLock::new(FileLockConfig::new(&config.lock_dir)));

    let mut migrator = Migrator::new(client, locks, checkpoint, config.migration.clone());

    let results = match (config.mode, config.table.as_deref()) {
        (Mode::Single, Some(table)) => {
            info!(database = %config.database, table, "Starting single table migration");
            vec![migrator.migrate_table(&config.database, table).await]
        }
        _ => migrator
            .migrate_database(&config.database)
            .await
            .with_context(|| format!("cannot list tables of {}", config.database))?,
    };

    Ok(Report::new(info, results))
}
