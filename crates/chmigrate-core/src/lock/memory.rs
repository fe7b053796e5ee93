//! In-process lock manager for tests and single-process embedding.

use super::{Handle, LockError, LockRecord, LockToken, TableLock};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Holder {
    id: u64,
    record: LockRecord,
    alive: bool,
}

#[derive(Debug, Default)]
struct Inner {
    holders: HashMap<(String, String), Holder>,
    next_id: u64,
}

/// Lock manager holding its state in memory.
#[derive(Debug)]
pub struct MemoryTableLock {
    inner: Mutex<Inner>,
    poll_interval: Duration,
}

impl MemoryTableLock {
    /// Create an empty lock manager.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Set the wait between acquisition attempts.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Leave a lock behind for a holder that is no longer running.
    pub fn insert_stale(&self, database: &str, table: &str, record: LockRecord) {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.holders.insert(
            key(database, table),
            Holder {
                id,
                record,
                alive: false,
            },
        );
    }

    /// Holder record of a table's lock, live or stale.
    pub fn holder(&self, database: &str, table: &str) -> Option<LockRecord> {
        self.inner
            .lock()
            .holders
            .get(&key(database, table))
            .map(|h| h.record.clone())
    }

    fn attempt(&self, database: &str, table: &str) -> Option<LockToken> {
        let mut inner = self.inner.lock();
        let k = key(database, table);
        if inner.holders.get(&k).is_some_and(|h| h.alive) {
            return None;
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let record = LockRecord::current();
        inner.holders.insert(
            k,
            Holder {
                id,
                record: record.clone(),
                alive: true,
            },
        );
        Some(LockToken::new(database, table, record, Handle::Memory(id)))
    }
}

impl Default for MemoryTableLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TableLock for MemoryTableLock {
    async fn try_acquire(
        &self,
        database: &str,
        table: &str,
        timeout: Duration,
    ) -> Result<Option<LockToken>, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(token) = self.attempt(database, table) {
                return Ok(Some(token));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    fn release(&self, token: LockToken) {
        let Handle::Memory(id) = &token.handle else {
            return;
        };
        let mut inner = self.inner.lock();
        let k = key(token.database(), token.table());
        if inner.holders.get(&k).is_some_and(|h| h.id == *id) {
            inner.holders.remove(&k);
        }
    }

    fn is_held(&self, database: &str, table: &str) -> Result<bool, LockError> {
        let mut inner = self.inner.lock();
        let k = key(database, table);
        match inner.holders.get(&k) {
            Some(holder) if holder.alive => Ok(true),
            Some(_) => {
                inner.holders.remove(&k);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

fn key(database: &str, table: &str) -> (String, String) {
    (database.to_string(), table.to_string())
}
