//! Checkpoint repositories.
//!
//! Writes are per table: a repository replaces one table's record and keeps
//! whatever else is stored, so processes migrating different tables can
//! share one store. The file repository is what the tool uses in
//! production; the memory repository backs tests and can be shared between
//! "process restarts" within one test.

use super::state::{CheckpointState, TableProgress};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default checkpoint file name.
pub const DEFAULT_CHECKPOINT_FILE: &str = "migration_progress.json";

/// Checkpoint persistence errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The stored state exists but cannot be decoded.
    #[error("checkpoint {path} is corrupt: {message}")]
    Corrupt {
        /// Location of the state.
        path: String,
        /// Decoder message.
        message: String,
    },

    /// IO error while reading or writing the state.
    #[error("checkpoint io error on {path}: {source}")]
    Io {
        /// Location of the state.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("checkpoint serialization error: {0}")]
    Serialization(String),
}

/// Storage for the checkpoint mapping.
pub trait CheckpointRepository: Send + Sync {
    /// Load the stored mapping; an absent store is an empty mapping.
    fn load(&self) -> Result<CheckpointState, CheckpointError>;

    /// Store the record of one table, or remove it when `progress` is
    /// `None`, leaving every other stored record as it is. Durable before
    /// returning.
    fn save_table(
        &self,
        database: &str,
        table: &str,
        progress: Option<&TableProgress>,
    ) -> Result<(), CheckpointError>;
}

/// JSON file repository.
///
/// A write holds an exclusive lock on `<file>.lock`, re-reads the file,
/// changes the one record and writes the result to a sibling temporary file
/// which is synced and renamed over the checkpoint. A crash mid-write leaves
/// the previous state intact.
#[derive(Debug, Clone)]
pub struct FileCheckpointRepository {
    path: PathBuf,
}

impl FileCheckpointRepository {
    /// Create a repository for the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }

    fn io(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.display(),
            source,
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    fn lock_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    /// Block until this process holds the writer lock. Released when the
    /// returned handle is dropped. The lock file is never removed.
    fn lock_writers(&self) -> Result<File, CheckpointError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())
            .map_err(|e| self.io(e))?;
        file.lock().map_err(|e| self.io(e))?;
        Ok(file)
    }

    fn write(&self, state: &CheckpointState) -> Result<(), CheckpointError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

        let temp = self.temp_path();
        let mut file = File::create(&temp).map_err(|e| self.io(e))?;
        file.write_all(json.as_bytes()).map_err(|e| self.io(e))?;
        file.sync_all().map_err(|e| self.io(e))?;
        drop(file);

        std::fs::rename(&temp, &self.path).map_err(|e| self.io(e))
    }
}

impl Default for FileCheckpointRepository {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKPOINT_FILE)
    }
}

impl CheckpointRepository for FileCheckpointRepository {
    fn load(&self) -> Result<CheckpointState, CheckpointError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CheckpointState::default())
            }
            Err(e) => return Err(self.io(e)),
        };

        if content.trim().is_empty() {
            return Ok(CheckpointState::default());
        }

        serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupt {
            path: self.display(),
            message: e.to_string(),
        })
    }

    fn save_table(
        &self,
        database: &str,
        table: &str,
        progress: Option<&TableProgress>,
    ) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io(e))?;
        }

        let _writer = self.lock_writers()?;
        let mut state = self.load()?;
        state.set(database, table, progress.cloned());
        self.write(&state)
    }
}

/// In-memory repository.
#[derive(Debug, Default)]
pub struct MemoryCheckpointRepository {
    state: Mutex<CheckpointState>,
    saves: Mutex<usize>,
}

impl MemoryCheckpointRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository holding `state`.
    pub fn with_state(state: CheckpointState) -> Self {
        Self {
            state: Mutex::new(state),
            saves: Mutex::new(0),
        }
    }

    /// Snapshot of the stored state.
    pub fn snapshot(&self) -> CheckpointState {
        self.state.lock().clone()
    }

    /// Number of `save_table` calls so far.
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl CheckpointRepository for MemoryCheckpointRepository {
    fn load(&self) -> Result<CheckpointState, CheckpointError> {
        Ok(self.state.lock().clone())
    }

    fn save_table(
        &self,
        database: &str,
        table: &str,
        progress: Option<&TableProgress>,
    ) -> Result<(), CheckpointError> {
        self.state.lock().set(database, table, progress.cloned());
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::state::TableStatus;
    use crate::partition::PartitionValue;

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileCheckpointRepository::new(dir.path().join("progress.json"));

        let state = repo.load().unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_file_round_trip_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("progress.json");
        let repo = FileCheckpointRepository::new(&path);

        let mut progress = TableProgress::default();
        progress.completed_partitions.insert(PartitionValue::new("202401"));
        progress.status = TableStatus::Completed;
        repo.save_table("dws", "events", Some(&progress)).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["dws"]["events"]["status"], "completed");
        assert_eq!(raw["dws"]["events"]["completed_partitions"][0], "202401");

        let loaded = repo.load().unwrap();
        assert_eq!(loaded.get("dws", "events"), Some(&progress));
        assert!(!repo.temp_path().exists());
    }

    #[test]
    fn test_reads_legacy_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(
            &path,
            r#"{"default": {"sales": {"completed_partitions": ["east", "east"], "status": "running"}}}"#,
        )
        .unwrap();

        let state = FileCheckpointRepository::new(&path).load().unwrap();
        let progress = state.get("default", "sales").unwrap();
        assert_eq!(progress.status, TableStatus::Running);
        assert_eq!(progress.completed_partitions.len(), 1);
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = FileCheckpointRepository::new(&path).load().unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[test]
    fn test_writers_on_one_file_keep_each_others_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let first = FileCheckpointRepository::new(&path);
        let second = FileCheckpointRepository::new(&path);

        let mut t1 = TableProgress::default();
        t1.completed_partitions.insert(PartitionValue::new("east"));
        t1.status = TableStatus::Failed;
        first.save_table("db", "t1", Some(&t1)).unwrap();

        let t2 = TableProgress {
            status: TableStatus::Completed,
            ..Default::default()
        };
        second.save_table("db", "t2", Some(&t2)).unwrap();

        let state = first.load().unwrap();
        assert_eq!(state.get("db", "t1"), Some(&t1));
        assert_eq!(state.get("db", "t2"), Some(&t2));

        second.save_table("db", "t2", None).unwrap();
        let state = first.load().unwrap();
        assert_eq!(state.get("db", "t1"), Some(&t1));
        assert!(state.get("db", "t2").is_none());
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let repo = FileCheckpointRepository::new(&path);
                std::thread::spawn(move || {
                    let table = format!("t{worker}");
                    let mut progress = TableProgress::default();
                    for partition in 0..10 {
                        progress
                            .completed_partitions
                            .insert(PartitionValue::new(partition.to_string()));
                        repo.save_table("db", &table, Some(&progress)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let state = FileCheckpointRepository::new(&path).load().unwrap();
        for worker in 0..8 {
            let progress = state.get("db", &format!("t{worker}")).unwrap();
            assert_eq!(progress.completed_partitions.len(), 10);
        }
    }

    #[test]
    fn test_memory_repository_counts_saves() {
        let repo = MemoryCheckpointRepository::new();
        let progress = TableProgress::default();

        repo.save_table("db", "t", Some(&progress)).unwrap();
        repo.save_table("db", "u", Some(&progress)).unwrap();

        assert_eq!(repo.save_count(), 2);
        let state = repo.load().unwrap();
        assert!(state.get("db", "t").is_some());
        assert!(state.get("db", "u").is_some());
    }
}
