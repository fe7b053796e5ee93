//! Lock files with OS advisory locks.

use super::{Handle, LockError, LockRecord, LockToken, TableLock};
use async_trait::async_trait;
use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default lock directory.
pub const DEFAULT_LOCK_DIR: &str = "./locks";

/// Default wait between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// File lock configuration.
#[derive(Debug, Clone)]
pub struct FileLockConfig {
    /// Directory holding one `<db>_<table>.lock` file per locked table.
    pub lock_dir: PathBuf,
    /// Wait between acquisition attempts.
    pub poll_interval: Duration,
}

impl FileLockConfig {
    /// Create a configuration for `lock_dir`.
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the wait between acquisition attempts.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for FileLockConfig {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_DIR)
    }
}

enum Attempt {
    Acquired(LockToken),
    Busy,
    /// The file was replaced between open and lock.
    Replaced,
}

/// Lock manager backed by lock files in a shared directory.
///
/// Exclusion comes from the OS advisory lock on the file, not from the
/// file's existence, so a file left behind by a killed process is never
/// mistaken for a live holder.
#[derive(Debug, Clone)]
pub struct FileTableLock {
    config: FileLockConfig,
}

impl FileTableLock {
    /// Create a lock manager.
    pub fn new(config: FileLockConfig) -> Self {
        Self { config }
    }

    /// Lock file of a table.
    pub fn lock_path(&self, database: &str, table: &str) -> PathBuf {
        self.config
            .lock_dir
            .join(format!("{database}_{table}.lock"))
    }

    fn attempt(&self, database: &str, table: &str, path: &Path) -> Result<Attempt, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| io_error(path, e))?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Ok(Attempt::Busy),
            Err(TryLockError::Error(e)) => return Err(io_error(path, e)),
        }

        if !is_same_file(&file, path).map_err(|e| io_error(path, e))? {
            let _ = file.unlock();
            return Ok(Attempt::Replaced);
        }

        let record = LockRecord::current();
        file.set_len(0).map_err(|e| io_error(path, e))?;
        (&file)
            .write_all(record.render().as_bytes())
            .map_err(|e| io_error(path, e))?;
        file.sync_all().map_err(|e| io_error(path, e))?;

        Ok(Attempt::Acquired(LockToken::new(
            database,
            table,
            record,
            Handle::File(file),
        )))
    }
}

impl Default for FileTableLock {
    fn default() -> Self {
        Self::new(FileLockConfig::default())
    }
}

#[async_trait]
impl TableLock for FileTableLock {
    async fn try_acquire(
        &self,
        database: &str,
        table: &str,
        timeout: Duration,
    ) -> Result<Option<LockToken>, LockError> {
        std::fs::create_dir_all(&self.config.lock_dir)
            .map_err(|e| io_error(&self.config.lock_dir, e))?;

        let path = self.lock_path(database, table);
        let deadline = Instant::now() + timeout;

        loop {
            match self.attempt(database, table, &path)? {
                Attempt::Acquired(token) => {
                    info!(database, table, path = %path.display(), "Acquired table lock");
                    return Ok(Some(token));
                }
                Attempt::Replaced => continue,
                Attempt::Busy => {}
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    database,
                    table,
                    timeout_secs = timeout.as_secs(),
                    "Timed out waiting for table lock"
                );
                return Ok(None);
            }

            let wait = self.config.poll_interval.min(deadline - now);
            debug!(database, table, wait_ms = wait.as_millis() as u64, "Table lock busy, retrying");
            tokio::time::sleep(wait).await;
        }
    }

    fn release(&self, token: LockToken) {
        let path = self.lock_path(token.database(), token.table());
        let Handle::File(file) = token.handle else {
            return;
        };

        // Unlink while still holding the lock so no waiter can lock this inode
        // and then find it gone.
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove lock file"),
        }
        if let Err(e) = file.unlock() {
            debug!(path = %path.display(), error = %e, "Failed to unlock lock file");
        }
    }

    fn is_held(&self, database: &str, table: &str) -> Result<bool, LockError> {
        let path = self.lock_path(database, table);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_error(&path, e)),
        };

        match file.try_lock() {
            Ok(()) => {
                let holder = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|text| LockRecord::parse(&text));
                info!(
                    database,
                    table,
                    stale_pid = holder.as_ref().map(|r| r.pid),
                    "Removing stale table lock"
                );
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_error(&path, e)),
                }
                let _ = file.unlock();
                Ok(false)
            }
            Err(TryLockError::WouldBlock) => Ok(true),
            Err(TryLockError::Error(e)) => Err(io_error(&path, e)),
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> LockError {
    LockError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(unix)]
fn is_same_file(file: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let open = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(open.dev() == current.dev() && open.ino() == current.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn is_same_file(_file: &File, path: &Path) -> std::io::Result<bool> {
    Ok(path.exists())
}
