//! Migration executor - drives tables onto the target storage policy.
//!
//! Per table: lock, fetch the definition, create the backup table with the
//! target policy, then copy, verify and drop one partition at a time,
//! recording each in the checkpoint. Once every partition is moved the
//! whole-table counts are checked and the backup is renamed into place.

use super::error::{CountScope, MigrationError};
use super::result::{MigrationResult, MigrationStatus};
use super::state::{Checkpoint, TableStatus};
use crate::client::ClickHouse;
use crate::ddl::TableDefinition;
use crate::lock::{LockGuard, TableLock};
use crate::partition::{
    list_partitions, resolve_partition_key, to_drop_literal, to_where_predicate, PartitionValue,
};
use crate::sql::{qualified, quote_literal};
use crate::validator::{row_count, verify, PartitionCheck};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default target storage policy.
pub const DEFAULT_STORAGE_POLICY: &str = "s3";

/// Suffix of the backup table name.
pub const DEFAULT_BACKUP_SUFFIX: &str = "_backup_s3";

/// Default pause after each partition copy.
pub const DEFAULT_INSERT_INTERVAL: Duration = Duration::from_secs(1);

/// Default time to wait for a table lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3600);

/// Migration executor configuration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Storage policy tables are moved onto.
    pub storage_policy: String,
    /// Suffix appended to a table name to name its backup table.
    pub backup_suffix: String,
    /// Pause after each partition copy.
    pub insert_interval: Duration,
    /// How long to wait for a table lock.
    pub lock_timeout: Duration,
    /// The operator asked to continue interrupted tables. Checkpoint
    /// progress is honored either way; this only changes what is logged.
    pub resume: bool,
}

impl MigrationConfig {
    /// Create a configuration targeting `storage_policy`.
    pub fn new(storage_policy: impl Into<String>) -> Self {
        Self {
            storage_policy: storage_policy.into(),
            ..Self::default()
        }
    }

    /// Set the pause after each partition copy.
    pub fn with_insert_interval(mut self, interval: Duration) -> Self {
        self.insert_interval = interval;
        self
    }

    /// Set the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set whether the run was started to continue interrupted tables.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Set the backup table suffix.
    pub fn with_backup_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.backup_suffix = suffix.into();
        self
    }

    /// Backup table name for `table`.
    pub fn backup_table(&self, table: &str) -> String {
        format!("{}{}", table, self.backup_suffix)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            storage_policy: DEFAULT_STORAGE_POLICY.to_string(),
            backup_suffix: DEFAULT_BACKUP_SUFFIX.to_string(),
            insert_interval: DEFAULT_INSERT_INTERVAL,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            resume: false,
        }
    }
}

/// A finished table attempt, with the error if it must stop the run.
pub(crate) struct Attempt {
    pub(crate) result: MigrationResult,
    pub(crate) fatal: Option<MigrationError>,
}

impl Attempt {
    pub(crate) fn done(result: MigrationResult) -> Self {
        Self {
            result,
            fatal: None,
        }
    }
}

/// Migration executor.
pub struct Migrator {
    pub(crate) client: Arc<dyn ClickHouse>,
    locks: Arc<dyn TableLock>,
    checkpoint: Checkpoint,
    pub(crate) config: MigrationConfig,
}

impl Migrator {
    /// Create a migrator.
    pub fn new(
        client: Arc<dyn ClickHouse>,
        locks: Arc<dyn TableLock>,
        checkpoint: Checkpoint,
        config: MigrationConfig,
    ) -> Self {
        Self {
            client,
            locks,
            checkpoint,
            config,
        }
    }

    /// Checkpoint as updated by the migrations so far.
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Configuration in use.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Migrate one table.
    ///
    /// Never fails: every error is contained in a `failed` result.
    pub async fn migrate_table(&mut self, database: &str, table: &str) -> MigrationResult {
        self.attempt_table(database, table).await.result
    }

    /// Migrate every eligible table of a database, one after another.
    ///
    /// Table failures do not stop the run, except a lost connection, after
    /// which the remaining tables are not attempted.
    pub async fn migrate_database(
        &mut self,
        database: &str,
    ) -> Result<Vec<MigrationResult>, MigrationError> {
        let tables = self.eligible_tables(database).await?;
        info!(database, tables = tables.len(), "Starting full database migration");

        let mut results = Vec::with_capacity(tables.len());
        for (idx, table) in tables.iter().enumerate() {
            info!(
                database,
                table = %table,
                "Migrating table {}/{}",
                idx + 1,
                tables.len()
            );
            let attempt = self.attempt_table(database, table).await;
            results.push(attempt.result);

            if let Some(err) = attempt.fatal {
                error!(
                    database,
                    table = %table,
                    error = %err,
                    remaining = tables.len() - idx - 1,
                    "Fatal error, not attempting remaining tables"
                );
                break;
            }
        }

        Ok(results)
    }

    /// Tables a full-database run considers: MergeTree family and
    /// Distributed engines, minus leftover backup tables.
    pub async fn eligible_tables(&self, database: &str) -> Result<Vec<String>, MigrationError> {
        let statement = format!(
            "SELECT name FROM system.tables WHERE database = {} AND (engine LIKE '%MergeTree' OR engine = 'Distributed') ORDER BY name",
            quote_literal(database)
        );
        let rows = self.client.query(&statement).await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let name = row.get_string(0)?;
            if name.ends_with(&self.config.backup_suffix) {
                debug!(database, table = %name, "Ignoring backup table");
                continue;
            }
            tables.push(name);
        }
        Ok(tables)
    }

    pub(crate) async fn attempt_table(&mut self, database: &str, table: &str) -> Attempt {
        let engine = match self.table_engine(database, table).await {
            Ok(Some(engine)) => engine,
            Ok(None) => {
                let err = MigrationError::schema(database, table, "table does not exist");
                return self.failed(MigrationResult::new(database, table), err);
            }
            Err(err) => return self.failed(MigrationResult::new(database, table), err),
        };

        if engine.name == "Distributed" {
            return self
                .migrate_distributed(database, table, &engine.full)
                .await;
        }
        self.migrate_local(database, table).await
    }

    /// Run the protocol for a table that stores its own data.
    pub(crate) async fn migrate_local(&mut self, database: &str, table: &str) -> Attempt {
        let mut result = MigrationResult::new(database, table);

        match self.locks.is_held(database, table) {
            Ok(true) => {
                warn!(database, table, "Table is being migrated by another process");
                result.error = Some(
                    MigrationError::LockContention {
                        database: database.to_string(),
                        table: table.to_string(),
                    }
                    .to_string(),
                );
                return Attempt::done(result.finish(MigrationStatus::Locked));
            }
            Ok(false) => {}
            Err(err) => return self.failed(result, err.into()),
        }

        let token = match self
            .locks
            .try_acquire(database, table, self.config.lock_timeout)
            .await
        {
            Ok(Some(token)) => token,
            Ok(None) => {
                warn!(
                    database,
                    table,
                    timeout_secs = self.config.lock_timeout.as_secs(),
                    "Could not acquire table lock"
                );
                result.error = Some(format!(
                    "lock not acquired within {}s",
                    self.config.lock_timeout.as_secs()
                ));
                return Attempt::done(result.finish(MigrationStatus::LockFailed));
            }
            Err(err) => return self.failed(result, err.into()),
        };
        let guard = LockGuard::new(Arc::clone(&self.locks), token);

        let outcome = self.run_locked(database, table, &mut result).await;
        if outcome.is_err() {
            if let Err(err) = self.checkpoint.mark_failed(database, table) {
                error!(database, table, error = %err, "Failed to record table failure");
            }
        }
        drop(guard);

        match outcome {
            Ok(status) => {
                info!(
                    database,
                    table,
                    status = %status,
                    partitions = result.completed_partitions,
                    migrated_rows = result.migrated_rows,
                    "Table migration finished"
                );
                Attempt::done(result.finish(status))
            }
            Err(err) => self.failed(result, err),
        }
    }

    async fn run_locked(
        &mut self,
        database: &str,
        table: &str,
        result: &mut MigrationResult,
    ) -> Result<MigrationStatus, MigrationError> {
        let policy = self.config.storage_policy.clone();
        let mut definition = self.show_create(database, table).await?;
        definition.qualify(database);

        if definition.uses_storage_policy(&policy) {
            info!(database, table, policy = %policy, "Table already uses target policy, skipping");
            return Ok(MigrationStatus::Skipped);
        }

        self.checkpoint.refresh(database, table)?;
        let recorded = self.checkpoint.progress(database, table).map(|p| p.status);
        match recorded {
            Some(TableStatus::Completed) => {
                warn!(
                    database,
                    table,
                    "Checkpoint marks table completed but it is not on the target policy, starting over"
                );
                self.checkpoint.reset(database, table)?;
            }
            Some(TableStatus::Failed) => {
                if self.config.resume {
                    info!(database, table, "Resuming previously failed table");
                } else {
                    warn!(
                        database,
                        table,
                        "Table failed in an earlier run, continuing from its checkpoint"
                    );
                }
                self.checkpoint.mark_running(database, table)?;
            }
            Some(TableStatus::Running) | None => {}
        }

        let has_record = self.checkpoint.progress(database, table).is_some();
        let done: BTreeSet<PartitionValue> = self
            .checkpoint
            .progress(database, table)
            .map(|p| p.completed_partitions.clone())
            .unwrap_or_default();

        let backup = self.config.backup_table(table);
        let (mut backup_definition, rule) =
            definition.backup_definition(&self.config.backup_suffix, &policy);
        backup_definition.rename(backup.clone());

        // With a checkpoint record, the backup may hold partitions already
        // dropped from the source, recorded or not.
        let resuming = has_record && self.table_exists(database, &backup).await?;
        if resuming {
            info!(
                database,
                table,
                backup = %backup,
                completed = done.len(),
                "Resuming into existing backup table"
            );
        } else if !done.is_empty() {
            return Err(MigrationError::BackupTable {
                database: database.to_string(),
                table: backup,
                message: format!(
                    "missing while {} partition(s) are recorded as migrated",
                    done.len()
                ),
            });
        } else {
            self.create_backup(database, &backup, &backup_definition)
                .await?;
            debug!(database, table, backup = %backup, rule = ?rule, "Backup table created");
        }
        self.checkpoint.initialize(database, table)?;

        let live = list_partitions(self.client.as_ref(), database, table).await?;
        result.total_partitions = live
            .iter()
            .filter(|p| !done.contains(p))
            .count()
            + done.len();
        result.completed_partitions = done.len();

        if live.is_empty() && done.is_empty() {
            info!(database, table, "Table has no partitions, swapping directly");
            let remaining = row_count(self.client.as_ref(), database, table, None).await?;
            if remaining != 0 {
                return Err(MigrationError::ConsistencyMismatch {
                    scope: CountScope::Table,
                    src_count: remaining,
                    dst_count: 0,
                    expected: 0,
                });
            }
            self.swap(database, table, &backup).await?;
            self.checkpoint.mark_completed(database, table)?;
            return Ok(MigrationStatus::Completed);
        }

        let key = resolve_partition_key(self.client.as_ref(), database, table).await?;
        let pending = self.checkpoint.pending_partitions(database, table, &live);

        if resuming {
            // Partial copies of an interrupted partition must not be counted.
            for partition in &pending {
                self.drop_partition(database, &backup, partition).await?;
            }
        }

        let src_rows = row_count(self.client.as_ref(), database, table, None).await?;
        let backup_rows = row_count(self.client.as_ref(), database, &backup, None).await?;
        result.total_rows = src_rows + backup_rows;

        info!(
            database,
            table,
            key = %key,
            partitions = result.total_partitions,
            pending = pending.len(),
            total_rows = result.total_rows,
            "Migrating partitions"
        );

        for (idx, partition) in pending.iter().enumerate() {
            let started = Instant::now();
            let predicate = to_where_predicate(&key, partition)?;

            self.client
                .command(&format!(
                    "INSERT INTO {} SELECT * FROM {} WHERE {}",
                    qualified(database, &backup),
                    qualified(database, table),
                    predicate
                ))
                .await?;

            if !self.config.insert_interval.is_zero() {
                tokio::time::sleep(self.config.insert_interval).await;
            }

            let scope = Some((&key, partition));
            let src_count = row_count(self.client.as_ref(), database, table, scope).await?;
            let dst_count = row_count(self.client.as_ref(), database, &backup, scope).await?;
            let passed = verify(src_count, dst_count);

            result.check_results.push(PartitionCheck {
                partition: partition.to_string(),
                src_count,
                dst_count,
                passed,
                cost_time: started.elapsed().as_secs_f64(),
            });

            if !passed {
                error!(
                    database,
                    table,
                    partition = %partition,
                    src_count,
                    dst_count,
                    "Partition row counts differ, source partition kept"
                );
                return Err(MigrationError::ConsistencyMismatch {
                    scope: CountScope::Partition(partition.to_string()),
                    src_count,
                    dst_count,
                    expected: src_count,
                });
            }

            self.drop_partition(database, table, partition).await?;
            self.checkpoint
                .record_partition_done(database, table, partition)?;

            result.completed_partitions += 1;
            result.migrated_rows += dst_count;
            info!(
                database,
                table,
                partition = %partition,
                rows = dst_count,
                "Partition migrated ({}/{})",
                idx + 1,
                pending.len()
            );
        }

        let src_after = row_count(self.client.as_ref(), database, table, None).await?;
        let dst_after = row_count(self.client.as_ref(), database, &backup, None).await?;
        if src_after != 0 || dst_after != result.total_rows {
            error!(
                database,
                table,
                src_count = src_after,
                dst_count = dst_after,
                expected = result.total_rows,
                "Final verification failed"
            );
            return Err(MigrationError::ConsistencyMismatch {
                scope: CountScope::Table,
                src_count: src_after,
                dst_count: dst_after,
                expected: result.total_rows,
            });
        }

        self.swap(database, table, &backup).await?;
        self.checkpoint.mark_completed(database, table)?;
        Ok(MigrationStatus::Completed)
    }

    async fn show_create(
        &self,
        database: &str,
        table: &str,
    ) -> Result<TableDefinition, MigrationError> {
        let rows = self
            .client
            .query(&format!("SHOW CREATE TABLE {}", qualified(database, table)))
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| MigrationError::schema(database, table, "empty SHOW CREATE TABLE"))?;
        TableDefinition::parse(&row.get_string(0)?)
    }

    pub(crate) async fn table_engine(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Option<Engine>, MigrationError> {
        let statement = format!(
            "SELECT engine, engine_full FROM system.tables WHERE database = {} AND name = {}",
            quote_literal(database),
            quote_literal(table)
        );
        let rows = self.client.query(&statement).await?;
        match rows.first() {
            Some(row) => Ok(Some(Engine {
                name: row.get_string(0)?,
                full: row.get_string(1)?,
            })),
            None => Ok(None),
        }
    }

    async fn table_exists(&self, database: &str, table: &str) -> Result<bool, MigrationError> {
        let statement = format!(
            "SELECT name FROM system.tables WHERE database = {} AND name = {}",
            quote_literal(database),
            quote_literal(table)
        );
        Ok(!self.client.query(&statement).await?.is_empty())
    }

    async fn create_backup(
        &self,
        database: &str,
        backup: &str,
        definition: &TableDefinition,
    ) -> Result<(), MigrationError> {
        self.client
            .command(&format!(
                "DROP TABLE IF EXISTS {}",
                qualified(database, backup)
            ))
            .await?;
        self.client.command(&definition.to_string()).await?;

        if !self.table_exists(database, backup).await? {
            return Err(MigrationError::BackupTable {
                database: database.to_string(),
                table: backup.to_string(),
                message: "not found after CREATE TABLE".to_string(),
            });
        }
        Ok(())
    }

    async fn drop_partition(
        &self,
        database: &str,
        table: &str,
        partition: &PartitionValue,
    ) -> Result<(), MigrationError> {
        self.client
            .command(&format!(
                "ALTER TABLE {} DROP PARTITION {}",
                qualified(database, table),
                to_drop_literal(partition.as_str())
            ))
            .await?;
        Ok(())
    }

    async fn swap(&self, database: &str, table: &str, backup: &str) -> Result<(), MigrationError> {
        self.client
            .command(&format!("DROP TABLE {}", qualified(database, table)))
            .await?;

        let rename = format!(
            "RENAME TABLE {} TO {}",
            qualified(database, backup),
            qualified(database, table)
        );
        if let Err(err) = self.client.command(&rename).await {
            error!(
                database,
                table,
                backup,
                "Source table dropped but rename failed; all data is in the backup table, run `{}` manually",
                rename
            );
            return Err(err.into());
        }

        info!(database, table, "Swapped backup table into place");
        Ok(())
    }

    /// Log the failure with remediation steps and build the failed attempt.
    pub(crate) fn failed(&self, result: MigrationResult, err: MigrationError) -> Attempt {
        let database = result.database.clone();
        let table = result.table.clone();

        error!(database = %database, table = %table, error = %err, "Table migration failed");
        match &err {
            MigrationError::Connection(_) => {
                error!("Check that ClickHouse is reachable, then rerun; the checkpoint keeps migrated partitions");
            }
            _ => {
                error!(
                    database = %database,
                    table = %table,
                    "Remediation: inspect backup table {}, fix the cause and rerun, \
                     or restore {} from a ClickHouse backup",
                    qualified(&database, &self.config.backup_table(&table)),
                    qualified(&database, &table)
                );
            }
        }

        let fatal = err.is_fatal();
        let result = result.fail(err.to_string());
        Attempt {
            result,
            fatal: fatal.then_some(err),
        }
    }
}

/// Engine name and full engine declaration from `system.tables`.
#[derive(Debug, Clone)]
pub(crate) struct Engine {
    pub(crate) name: String,
    pub(crate) full: String,
}
