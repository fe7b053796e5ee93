//! chmigrate core - moves ClickHouse tables onto an S3-backed storage policy.
//!
//! This crate provides the migration engine: partition discovery, the
//! per-table copy/verify/swap protocol, checkpointed resume and cross-process
//! table locks. The database is reached through the [`ClickHouse`] trait.

pub mod client;
pub mod ddl;
pub mod lock;
pub mod migration;
pub mod partition;
pub mod preflight;
pub mod sql;
pub mod validator;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{ClickHouse, ClientError, Row};
pub use ddl::{Setting, SettingsRule, TableDefinition, STORAGE_POLICY_SETTING};
pub use lock::{
    FileLockConfig, FileTableLock, LockError, LockGuard, LockRecord, LockToken,
    MemoryTableLock, TableLock,
};
pub use migration::{
    Checkpoint, CheckpointError, CheckpointRepository, CheckpointState, FileCheckpointRepository,
    MemoryCheckpointRepository, MigrationConfig, MigrationError, MigrationResult, MigrationStatus,
    Migrator, TableProgress, TableStatus,
};
pub use partition::{PartitionKey, PartitionValue};
pub use validator::PartitionCheck;
