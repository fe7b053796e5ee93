//! Migration-specific error types.

use crate::client::ClientError;
use crate::lock::LockError;
use crate::migration::store::CheckpointError;
use thiserror::Error;

/// Where a row-count comparison was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountScope {
    /// A single partition of the table.
    Partition(String),
    /// The whole table after every partition was moved.
    Table,
}

impl std::fmt::Display for CountScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CountScope::Partition(p) => write!(f, "partition {p}"),
            CountScope::Table => write!(f, "whole table"),
        }
    }
}

/// Migration errors.
///
/// Everything except [`MigrationError::is_fatal`] errors is contained at the
/// table boundary and turned into a `failed` result.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The database cannot be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// Table or partition key is missing.
    #[error("schema error on {database}.{table}: {message}")]
    Schema {
        /// Database name.
        database: String,
        /// Table name.
        table: String,
        /// What is missing.
        message: String,
    },

    /// A partition value does not have one component per partition key field.
    #[error(
        "partition key/value arity mismatch: key `{key}` has {key_arity} field(s), value `{value}` has {value_arity}"
    )]
    ArityMismatch {
        /// The partition key expression.
        key: String,
        /// The partition value.
        value: String,
        /// Number of key fields.
        key_arity: usize,
        /// Number of value components.
        value_arity: usize,
    },

    /// Source and backup row counts differ.
    #[error("consistency check failed for {scope}: source has {src_count} rows, backup has {dst_count} (expected {expected})")]
    ConsistencyMismatch {
        /// What was compared.
        scope: CountScope,
        /// Rows counted in the source table.
        src_count: u64,
        /// Rows counted in the backup table.
        dst_count: u64,
        /// Rows the backup table should hold.
        expected: u64,
    },

    /// A row count could not be computed.
    #[error("row count on {database}.{table} failed: {source}")]
    ConsistencyQuery {
        /// Database name.
        database: String,
        /// Table name.
        table: String,
        /// Underlying client error.
        #[source]
        source: ClientError,
    },

    /// Another process holds the table's migration lock.
    #[error("{database}.{table} is locked by another migration")]
    LockContention {
        /// Database name.
        database: String,
        /// Table name.
        table: String,
    },

    /// The checkpoint file cannot be trusted.
    #[error("checkpoint corrupted: {0}")]
    CheckpointCorrupt(String),

    /// The checkpoint could not be persisted.
    #[error("checkpoint error: {0}")]
    Checkpoint(CheckpointError),

    /// Lock directory failure.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// The backup table is missing or could not be created.
    #[error("backup table {database}.{table}: {message}")]
    BackupTable {
        /// Database name.
        database: String,
        /// Backup table name.
        table: String,
        /// What went wrong.
        message: String,
    },

    /// A table definition could not be understood.
    #[error("cannot parse table definition: {0}")]
    Ddl(String),

    /// The run cannot start (storage policy unusable).
    #[error("preflight check failed: {0}")]
    Preflight(String),

    /// Any other client failure.
    #[error(transparent)]
    Client(ClientError),
}

impl MigrationError {
    /// Whether the error should stop the whole run rather than one table.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrationError::Connection(_) | MigrationError::CheckpointCorrupt(_)
        )
    }

    pub(crate) fn schema(
        database: impl Into<String>,
        table: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        MigrationError::Schema {
            database: database.into(),
            table: table.into(),
            message: message.into(),
        }
    }
}

impl From<ClientError> for MigrationError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Connection(message) => MigrationError::Connection(message),
            other => MigrationError::Client(other),
        }
    }
}

impl From<CheckpointError> for MigrationError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Corrupt { path, message } => {
                MigrationError::CheckpointCorrupt(format!("{path}: {message}"))
            }
            other => MigrationError::Checkpoint(other),
        }
    }
}
