//! Cross-process table locks.
//!
//! A migration holds one exclusive, advisory lock per `(database, table)`
//! from before its first mutating statement until its result is final. Locks
//! left behind by a dead process are detected by [`TableLock::is_held`] and
//! cleaned up instead of blocking later runs forever.

mod file;
mod memory;

pub use file::{FileLockConfig, FileTableLock, DEFAULT_LOCK_DIR, DEFAULT_POLL_INTERVAL};
pub use memory::MemoryTableLock;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Lock manager errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock directory or a lock file could not be used.
    #[error("lock io error on {path}: {source}")]
    Io {
        /// Lock file or directory.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Who holds a lock and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// Holder process id.
    pub pid: u32,
    /// Acquisition time.
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    /// Record for the current process, now (whole seconds).
    pub fn current() -> Self {
        let now = Utc::now();
        Self {
            pid: std::process::id(),
            acquired_at: Utc.timestamp_opt(now.timestamp(), 0).single().unwrap_or(now),
        }
    }

    /// Plain-text form stored in a lock file.
    pub fn render(&self) -> String {
        format!("pid: {}\ntime: {}\n", self.pid, self.acquired_at.timestamp())
    }

    /// Parse the plain-text form; `None` if either line is missing.
    pub fn parse(text: &str) -> Option<Self> {
        let mut pid = None;
        let mut time = None;
        for line in text.lines() {
            match line.split_once(':') {
                Some(("pid", value)) => pid = value.trim().parse::<u32>().ok(),
                Some(("time", value)) => time = value.trim().parse::<i64>().ok(),
                _ => {}
            }
        }
        let acquired_at = Utc.timestamp_opt(time?, 0).single()?;
        Some(Self {
            pid: pid?,
            acquired_at,
        })
    }
}

#[derive(Debug)]
pub(crate) enum Handle {
    File(std::fs::File),
    Memory(u64),
}

/// Proof of ownership of one table's lock.
#[derive(Debug)]
pub struct LockToken {
    database: String,
    table: String,
    record: LockRecord,
    pub(crate) handle: Handle,
}

impl LockToken {
    pub(crate) fn new(database: &str, table: &str, record: LockRecord, handle: Handle) -> Self {
        Self {
            database: database.to_string(),
            table: table.to_string(),
            record,
            handle,
        }
    }

    /// Locked database.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Locked table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Holder record written at acquisition.
    pub fn record(&self) -> &LockRecord {
        &self.record
    }
}

/// Exclusive, timeout-bounded ownership of a table migration.
#[async_trait]
pub trait TableLock: Send + Sync {
    /// Try to take the lock, polling until `timeout` elapses.
    ///
    /// Returns `None` if another holder kept the lock for the whole timeout.
    async fn try_acquire(
        &self,
        database: &str,
        table: &str,
        timeout: Duration,
    ) -> Result<Option<LockToken>, LockError>;

    /// Give the lock back. Never fails; a lock already cleaned up
    /// externally is fine.
    fn release(&self, token: LockToken);

    /// Whether a live holder owns the lock. A stale lock is removed and
    /// reported as not held.
    fn is_held(&self, database: &str, table: &str) -> Result<bool, LockError>;
}

/// Releases its token when dropped.
pub struct LockGuard {
    locks: Arc<dyn TableLock>,
    token: Option<LockToken>,
}

impl LockGuard {
    /// Guard `token`, releasing it through `locks`.
    pub fn new(locks: Arc<dyn TableLock>, token: LockToken) -> Self {
        Self {
            locks,
            token: Some(token),
        }
    }

    /// The guarded token.
    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            tracing::debug!(
                database = %token.database(),
                table = %token.table(),
                "Releasing table lock"
            );
            self.locks.release(token);
        }
    }
}
