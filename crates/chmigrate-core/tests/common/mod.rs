//! Shared fixtures for the migration integration tests.

#![allow(dead_code)]

use chmigrate_core::testing::MockClickHouse;
use chmigrate_core::{
    Checkpoint, CheckpointRepository, MemoryCheckpointRepository, MemoryTableLock,
    MigrationConfig, Migrator, TableLock,
};
use std::sync::Arc;
use std::time::Duration;

pub const POLICY: &str = "s3";

/// One mock server plus the state that survives a "process restart".
pub struct Harness {
    pub ch: Arc<MockClickHouse>,
    pub repo: Arc<MemoryCheckpointRepository>,
    pub locks: Arc<MemoryTableLock>,
}

impl Harness {
    pub fn new() -> Self {
        let ch = MockClickHouse::new();
        ch.add_storage_policy(POLICY);
        Self {
            ch: Arc::new(ch),
            repo: Arc::new(MemoryCheckpointRepository::new()),
            locks: Arc::new(MemoryTableLock::new()),
        }
    }

    pub fn with_repo(repo: MemoryCheckpointRepository) -> Self {
        Self {
            repo: Arc::new(repo),
            ..Self::new()
        }
    }

    pub fn config(&self) -> MigrationConfig {
        MigrationConfig::new(POLICY)
            .with_insert_interval(Duration::ZERO)
            .with_lock_timeout(Duration::from_millis(50))
    }

    /// A fresh migrator, as a new process would build it.
    pub fn migrator(&self) -> Migrator {
        self.migrator_with(self.config())
    }

    pub fn migrator_with(&self, config: MigrationConfig) -> Migrator {
        let locks: Arc<dyn TableLock> = self.locks.clone();
        self.migrator_with_locks(config, locks)
    }

    pub fn migrator_with_locks(&self, config: MigrationConfig, locks: Arc<dyn TableLock>) -> Migrator {
        let checkpoint = Checkpoint::load(self.repo.clone()).unwrap();
        Migrator::new(self.ch.clone(), locks, checkpoint, config)
    }

    /// A fresh migrator writing its checkpoint through `repo`.
    pub fn migrator_with_repo(&self, repo: Arc<dyn CheckpointRepository>) -> Migrator {
        let locks: Arc<dyn TableLock> = self.locks.clone();
        let checkpoint = Checkpoint::load(repo).unwrap();
        Migrator::new(self.ch.clone(), locks, checkpoint, self.config())
    }

    /// Statements that change schema or data.
    pub fn mutating_statements(&self) -> Vec<String> {
        self.ch
            .statements()
            .into_iter()
            .filter(|s| is_mutating(s))
            .collect()
    }

    /// `INSERT ... SELECT` statements issued so far.
    pub fn copies(&self) -> Vec<String> {
        self.ch
            .statements()
            .into_iter()
            .filter(|s| s.starts_with("INSERT INTO "))
            .collect()
    }
}

pub fn is_mutating(statement: &str) -> bool {
    ["CREATE", "DROP", "ALTER", "INSERT", "RENAME"]
        .iter()
        .any(|verb| statement.starts_with(verb))
}

pub fn copy_of(database: &str, table: &str, predicate: &str) -> String {
    format!("INSERT INTO {database}.{table}_backup_s3 SELECT * FROM {database}.{table} WHERE {predicate}")
}
