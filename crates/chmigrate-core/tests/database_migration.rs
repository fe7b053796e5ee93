//! Full-database runs, Distributed fan-out and the file-backed stores.

mod common;

use chmigrate_core::testing::MockClickHouse;
use chmigrate_core::{
    Checkpoint, ClientError, FileCheckpointRepository, FileLockConfig, FileTableLock,
    MigrationConfig, MigrationStatus, Migrator, TableLock, TableStatus,
};
use common::{copy_of, Harness};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_distributed_table_migrates_local_table() {
    let h = Harness::new();
    h.ch.add_distributed(
        "db",
        "events",
        "Distributed('ck_cluster', 'db', 'events_local', rand())",
    );
    h.ch.add_table("db", "events_local", "dt", &[("2024-01-01", 4), ("2024-01-02", 6)]);

    let result = h.migrator().migrate_table("db", "events").await;

    assert_eq!(result.status, MigrationStatus::Completed, "{:?}", result.error);
    assert_eq!(result.cluster.as_deref(), Some("ck_cluster"));
    assert_eq!(result.local_tables.len(), 1);

    let local = &result.local_tables[0];
    assert_eq!(local.table, "events_local");
    assert_eq!(local.status, MigrationStatus::Completed);
    assert_eq!(local.total_rows, 10);
    assert_eq!(result.migrated_rows, 10);

    assert!(h
        .ch
        .definition("db", "events_local")
        .unwrap()
        .contains("storage_policy = 's3'"));
    // The facade itself is never rewritten.
    assert!(!h
        .ch
        .statements()
        .iter()
        .any(|s| s.contains("db.events ") || s.ends_with("db.events")));
}

#[tokio::test]
async fn test_distributed_with_current_database() {
    let h = Harness::new();
    h.ch.add_distributed(
        "dws",
        "orders",
        "Distributed(ck_cluster, currentDatabase(), orders_local, cityHash64(id))",
    );
    h.ch.add_table("dws", "orders_local", "region", &[("east", 2)]);

    let result = h.migrator().migrate_table("dws", "orders").await;

    assert_eq!(result.status, MigrationStatus::Completed, "{:?}", result.error);
    assert_eq!(result.local_tables[0].database, "dws");
}

#[tokio::test]
async fn test_distributed_fails_when_local_fails() {
    let h = Harness::new();
    h.ch.add_distributed("db", "events", "Distributed('c', 'db', 'events_local')");
    h.ch.add_table("db", "events_local", "dt", &[("2024-01-01", 100)]);
    h.ch.lose_rows_on_copy("2024-01-01", 3);

    let result = h.migrator().migrate_table("db", "events").await;

    assert_eq!(result.status, MigrationStatus::Failed);
    assert_eq!(result.local_tables[0].status, MigrationStatus::Failed);
    assert!(result.error.unwrap().contains("events_local"));
}

#[tokio::test]
async fn test_full_database_run() {
    let h = Harness::new();
    h.ch.add_table("db", "sales", "region", &[("east", 10), ("west", 5)]);
    h.ch.add_table("db", "metrics", "toYYYYMM(ts)", &[("202401", 7)]);
    h.ch.add_table("db", "old_backup_s3", "region", &[("east", 1)]);
    h.ch.add_table_with_engine("db", "sales_view", "View");
    h.ch.add_table_with_engine("db", "audit", "Log");
    h.ch.add_table("other", "sales", "region", &[("east", 1)]);

    let mut migrator = h.migrator();
    let tables = migrator.eligible_tables("db").await.unwrap();
    assert_eq!(tables, vec!["metrics".to_string(), "sales".to_string()]);

    let results = migrator.migrate_database("db").await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == MigrationStatus::Completed));
    assert_eq!(h.ch.row_count("db", "old_backup_s3"), 1);
    assert!(!h
        .ch
        .definition("other", "sales")
        .unwrap()
        .contains("storage_policy"));
}

#[tokio::test]
async fn test_full_run_continues_after_table_failure() {
    let h = Harness::new();
    h.ch.add_table("db", "a_blob", "", &[("tuple()", 3)]);
    h.ch.add_table("db", "b_sales", "region", &[("east", 10)]);

    let results = h.migrator().migrate_database("db").await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, MigrationStatus::Failed);
    assert_eq!(results[1].status, MigrationStatus::Completed);
}

#[tokio::test]
async fn test_full_run_stops_on_connection_loss() {
    let h = Harness::new();
    h.ch.add_table("db", "a", "region", &[("east", 1)]);
    h.ch.add_table("db", "b", "region", &[("east", 1)]);
    h.ch.add_table("db", "c", "region", &[("east", 1)]);
    h.ch.fail_on(
        &copy_of("db", "a", "(region = 'east')"),
        ClientError::Connection("connection refused".into()),
    );

    let results = h.migrator().migrate_database("db").await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].table, "a");
    assert_eq!(results[0].status, MigrationStatus::Failed);
    assert!(!h.ch.statements().iter().any(|s| s.contains("db.b")));
}

#[tokio::test]
async fn test_full_run_skips_migrated_tables() {
    let h = Harness::new();
    h.ch.add_table("db", "sales", "region", &[("east", 10)]);
    h.migrator().migrate_database("db").await.unwrap();

    h.ch.clear_statements();
    let results = h.migrator().migrate_database("db").await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, MigrationStatus::Skipped);
    assert!(h.mutating_statements().is_empty());
}

#[tokio::test]
async fn test_enumeration_failure_is_an_error() {
    let h = Harness::new();
    h.ch.fail_on(
        "SELECT name FROM system.tables",
        ClientError::query("SELECT name", "ACCESS_DENIED"),
    );

    assert!(h.migrator().migrate_database("db").await.is_err());
}

#[tokio::test]
async fn test_file_backed_restart() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_file = dir.path().join("migration_progress.json");
    let lock_dir = dir.path().join("locks");

    let ch = MockClickHouse::new();
    ch.add_storage_policy("s3");
    ch.add_table("db", "sales", "region", &[("east", 10), ("west", 5)]);
    ch.fail_on(
        &copy_of("db", "sales", "(region = 'west')"),
        ClientError::Connection("connection reset".into()),
    );
    let ch = Arc::new(ch);

    let build = || {
        let repo = Arc::new(FileCheckpointRepository::new(&checkpoint_file));
        let locks: Arc<dyn TableLock> = Arc::new(FileTableLock::new(
            FileLockConfig::new(&lock_dir).with_poll_interval(Duration::from_millis(10)),
        ));
        let config = MigrationConfig::new("s3")
            .with_insert_interval(Duration::ZERO)
            .with_lock_timeout(Duration::from_millis(50))
            .with_resume(true);
        Migrator::new(ch.clone(), locks, Checkpoint::load(repo).unwrap(), config)
    };

    let first = build().migrate_table("db", "sales").await;
    assert_eq!(first.status, MigrationStatus::Failed);
    assert!(!lock_dir.join("db_sales.lock").exists());

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&checkpoint_file).unwrap()).unwrap();
    assert_eq!(raw["db"]["sales"]["status"], "failed");
    assert_eq!(raw["db"]["sales"]["completed_partitions"][0], "east");

    ch.clear_failures();
    let mut second = build();
    let result = second.migrate_table("db", "sales").await;

    assert_eq!(result.status, MigrationStatus::Completed, "{:?}", result.error);
    assert_eq!(
        second.checkpoint().progress("db", "sales").unwrap().status,
        TableStatus::Completed
    );
    assert_eq!(ch.row_count("db", "sales"), 15);
}

#[tokio::test]
async fn test_processes_sharing_a_checkpoint_file() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_file = dir.path().join("migration_progress.json");
    let lock_dir = dir.path().join("locks");

    let ch = MockClickHouse::new();
    ch.add_storage_policy("s3");
    ch.add_table("db", "t1", "region", &[("east", 100), ("west", 50)]);
    ch.add_table("db", "t2", "region", &[("east", 7)]);
    ch.fail_on(
        &copy_of("db", "t1", "(region = 'west')"),
        ClientError::command("INSERT", "Memory limit exceeded"),
    );
    let ch = Arc::new(ch);

    let build = || {
        let repo = Arc::new(FileCheckpointRepository::new(&checkpoint_file));
        let locks: Arc<dyn TableLock> = Arc::new(FileTableLock::new(
            FileLockConfig::new(&lock_dir).with_poll_interval(Duration::from_millis(10)),
        ));
        let config = MigrationConfig::new("s3")
            .with_insert_interval(Duration::ZERO)
            .with_lock_timeout(Duration::from_millis(50));
        Migrator::new(ch.clone(), locks, Checkpoint::load(repo).unwrap(), config)
    };

    // Both processes start before either has written anything.
    let mut a = build();
    let mut b = build();

    let t1 = a.migrate_table("db", "t1").await;
    assert_eq!(t1.status, MigrationStatus::Failed);
    assert_eq!(t1.completed_partitions, 1);

    let t2 = b.migrate_table("db", "t2").await;
    assert_eq!(t2.status, MigrationStatus::Completed, "{:?}", t2.error);

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&checkpoint_file).unwrap()).unwrap();
    assert_eq!(raw["db"]["t1"]["status"], "failed");
    assert_eq!(raw["db"]["t1"]["completed_partitions"][0], "east");
    assert_eq!(raw["db"]["t2"]["status"], "completed");

    // b never saw t1 in memory and must pick up a's progress from the file.
    ch.clear_failures();
    ch.clear_statements();
    let rerun = b.migrate_table("db", "t1").await;

    assert_eq!(rerun.status, MigrationStatus::Completed, "{:?}", rerun.error);
    assert_eq!(rerun.total_rows, 150);
    assert_eq!(
        ch.statements()
            .into_iter()
            .filter(|s| s.starts_with("INSERT INTO "))
            .collect::<Vec<_>>(),
        vec![copy_of("db", "t1", "(region = 'west')")]
    );
    assert_eq!(ch.row_count("db", "t1"), 150);
    assert_eq!(ch.row_count("db", "t2"), 7);
}
