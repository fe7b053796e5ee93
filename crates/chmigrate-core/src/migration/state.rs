//! Checkpoint state: which partitions of which tables are already migrated.
//!
//! Every mutation is written through the repository before the caller moves
//! on, so a crash loses at most the partition that was in flight. Only the
//! record of the mutated table is written; records of other tables stay as
//! the repository holds them.

use super::store::{CheckpointError, CheckpointRepository};
use crate::partition::PartitionValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Overall status of a table in the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    /// Migration started and has not finished.
    #[default]
    Running,
    /// Migration finished and the table was swapped.
    Completed,
    /// Migration stopped on an error.
    Failed,
}

impl std::fmt::Display for TableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableStatus::Running => write!(f, "running"),
            TableStatus::Completed => write!(f, "completed"),
            TableStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Progress of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProgress {
    /// Partitions copied, verified and dropped from the source.
    #[serde(default)]
    pub completed_partitions: BTreeSet<PartitionValue>,
    /// Overall status.
    #[serde(default)]
    pub status: TableStatus,
}

impl TableProgress {
    /// Whether `partition` was already migrated.
    pub fn is_done(&self, partition: &PartitionValue) -> bool {
        self.completed_partitions.contains(partition)
    }
}

/// database -> table -> progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointState {
    databases: BTreeMap<String, BTreeMap<String, TableProgress>>,
}

impl CheckpointState {
    /// Whether no table has any progress.
    pub fn is_empty(&self) -> bool {
        self.databases.values().all(BTreeMap::is_empty)
    }

    /// Progress of a table, if any.
    pub fn get(&self, database: &str, table: &str) -> Option<&TableProgress> {
        self.databases.get(database)?.get(table)
    }

    /// Progress of a table, created as `running` if absent.
    pub fn entry(&mut self, database: &str, table: &str) -> &mut TableProgress {
        self.databases
            .entry(database.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default()
    }

    fn get_mut(&mut self, database: &str, table: &str) -> Option<&mut TableProgress> {
        self.databases.get_mut(database)?.get_mut(table)
    }

    /// Replace the progress of a table, or drop it when `progress` is `None`.
    pub fn set(&mut self, database: &str, table: &str, progress: Option<TableProgress>) {
        match progress {
            Some(progress) => *self.entry(database, table) = progress,
            None => {
                self.remove(database, table);
            }
        }
    }

    fn remove(&mut self, database: &str, table: &str) -> Option<TableProgress> {
        let tables = self.databases.get_mut(database)?;
        let removed = tables.remove(table);
        if tables.is_empty() {
            self.databases.remove(database);
        }
        removed
    }

    /// Iterate `(database, table, progress)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &TableProgress)> {
        self.databases.iter().flat_map(|(db, tables)| {
            tables
                .iter()
                .map(move |(table, progress)| (db.as_str(), table.as_str(), progress))
        })
    }
}

/// Checkpoint store: the loaded state plus the repository it is written to.
pub struct Checkpoint {
    state: CheckpointState,
    repository: Arc<dyn CheckpointRepository>,
}

impl Checkpoint {
    /// Load the state from `repository`.
    pub fn load(repository: Arc<dyn CheckpointRepository>) -> Result<Self, CheckpointError> {
        let state = repository.load()?;
        Ok(Self { state, repository })
    }

    /// Current state.
    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    /// Progress of a table, if any.
    pub fn progress(&self, database: &str, table: &str) -> Option<&TableProgress> {
        self.state.get(database, table)
    }

    /// Re-read the record of one table from the repository.
    ///
    /// Another process may have written it since this checkpoint was loaded.
    pub fn refresh(&mut self, database: &str, table: &str) -> Result<(), CheckpointError> {
        let stored = self.repository.load()?;
        self.state
            .set(database, table, stored.get(database, table).cloned());
        Ok(())
    }

    /// Create a `running` record with no partitions if none exists.
    pub fn initialize(&mut self, database: &str, table: &str) -> Result<(), CheckpointError> {
        if self.state.get(database, table).is_some() {
            return Ok(());
        }
        self.state.entry(database, table);
        self.persist(database, table)
    }

    /// Add a partition to the completed set and persist.
    pub fn record_partition_done(
        &mut self,
        database: &str,
        table: &str,
        partition: &PartitionValue,
    ) -> Result<(), CheckpointError> {
        self.state
            .entry(database, table)
            .completed_partitions
            .insert(partition.clone());
        self.persist(database, table)
    }

    /// Mark the table `completed` and persist.
    pub fn mark_completed(&mut self, database: &str, table: &str) -> Result<(), CheckpointError> {
        self.state.entry(database, table).status = TableStatus::Completed;
        self.persist(database, table)
    }

    /// Mark the table `failed` and persist. No-op for unknown tables.
    pub fn mark_failed(&mut self, database: &str, table: &str) -> Result<(), CheckpointError> {
        match self.state.get_mut(database, table) {
            Some(progress) => {
                progress.status = TableStatus::Failed;
                self.persist(database, table)
            }
            None => Ok(()),
        }
    }

    /// Put a failed table back to `running`, keeping its partitions.
    pub fn mark_running(&mut self, database: &str, table: &str) -> Result<(), CheckpointError> {
        self.state.entry(database, table).status = TableStatus::Running;
        self.persist(database, table)
    }

    /// Forget everything about a table.
    pub fn reset(&mut self, database: &str, table: &str) -> Result<(), CheckpointError> {
        if self.state.remove(database, table).is_some() {
            self.persist(database, table)?;
        }
        Ok(())
    }

    /// Partitions of `all` not yet migrated, in the order of `all`.
    ///
    /// A `completed` table has nothing pending whatever its partition set says.
    pub fn pending_partitions(
        &self,
        database: &str,
        table: &str,
        all: &[PartitionValue],
    ) -> Vec<PartitionValue> {
        match self.state.get(database, table) {
            None => all.to_vec(),
            Some(progress) if progress.status == TableStatus::Completed => Vec::new(),
            Some(progress) => all
                .iter()
                .filter(|p| !progress.is_done(p))
                .cloned()
                .collect(),
        }
    }

    fn persist(&self, database: &str, table: &str) -> Result<(), CheckpointError> {
        self.repository
            .save_table(database, table, self.state.get(database, table))
    }
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
