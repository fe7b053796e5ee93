//! Table migration onto a new storage policy.
//!
//! This module provides:
//! - Checkpointed, resumable per-table state ([`Checkpoint`])
//! - The per-table protocol ([`Migrator`])
//! - Fan-out from Distributed tables to their local tables
//! - Per-table results for reporting ([`MigrationResult`])

pub mod distributed;
pub mod error;
pub mod executor;
pub mod result;
pub mod state;
pub mod store;

pub use distributed::{aggregate_status, parse_distributed_engine, DistributedTarget};
pub use error::{CountScope, MigrationError};
pub use executor::{
    MigrationConfig, Migrator, DEFAULT_BACKUP_SUFFIX, DEFAULT_INSERT_INTERVAL,
    DEFAULT_LOCK_TIMEOUT, DEFAULT_STORAGE_POLICY,
};
pub use result::{MigrationResult, MigrationStatus};
pub use state::{Checkpoint, CheckpointState, TableProgress, TableStatus};
pub use store::{
    CheckpointError, CheckpointRepository, FileCheckpointRepository, MemoryCheckpointRepository,
    DEFAULT_CHECKPOINT_FILE,
};
