//! Distributed tables: migrate the local tables behind the facade.

use super::error::MigrationError;
use super::executor::{Attempt, Migrator};
use super::result::{MigrationResult, MigrationStatus};
use crate::sql::{find_keyword, matching_paren, split_top_level, unquote_identifier};
use tracing::info;

/// Where a Distributed table routes its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedTarget {
    /// Cluster name.
    pub cluster: String,
    /// Database of the local tables.
    pub database: String,
    /// Name of the local tables.
    pub table: String,
}

/// Parse `Distributed(cluster, database, table[, sharding_key[, policy]])`.
///
/// Arguments may be quoted or bare; `currentDatabase()` means the facade's
/// own database.
pub fn parse_distributed_engine(
    engine_full: &str,
    facade_database: &str,
) -> Result<DistributedTarget, MigrationError> {
    let malformed = |why: &str| MigrationError::Ddl(format!("{why}: {engine_full}"));

    let start = find_keyword(engine_full, "Distributed", 0)
        .ok_or_else(|| malformed("not a Distributed engine"))?;
    let open = engine_full[start..]
        .find('(')
        .map(|offset| start + offset)
        .ok_or_else(|| malformed("missing engine arguments"))?;
    let close = matching_paren(engine_full, open).ok_or_else(|| malformed("unbalanced engine arguments"))?;

    let args: Vec<&str> = split_top_level(&engine_full[open + 1..close])
        .into_iter()
        .map(str::trim)
        .collect();
    if args.len() < 3 || args[..3].iter().any(|a| a.is_empty()) {
        return Err(malformed("expected cluster, database and table arguments"));
    }

    let database = if args[1].eq_ignore_ascii_case("currentDatabase()") {
        facade_database.to_string()
    } else {
        unquote_identifier(args[1]).to_string()
    };

    Ok(DistributedTarget {
        cluster: unquote_identifier(args[0]).to_string(),
        database,
        table: unquote_identifier(args[2]).to_string(),
    })
}

/// Facade status from its local tables: any failure fails the facade,
/// all skipped skips it, anything else completes it.
pub fn aggregate_status(local_tables: &[MigrationResult]) -> MigrationStatus {
    if local_tables.iter().any(|r| {
        matches!(
            r.status,
            MigrationStatus::Failed | MigrationStatus::Locked | MigrationStatus::LockFailed
        )
    }) {
        MigrationStatus::Failed
    } else if !local_tables.is_empty()
        && local_tables
            .iter()
            .all(|r| r.status == MigrationStatus::Skipped)
    {
        MigrationStatus::Skipped
    } else {
        MigrationStatus::Completed
    }
}

impl Migrator {
    pub(crate) async fn migrate_distributed(
        &mut self,
        database: &str,
        table: &str,
        engine_full: &str,
    ) -> Attempt {
        let mut facade = MigrationResult::new(database, table);
        let target = match parse_distributed_engine(engine_full, database) {
            Ok(target) => target,
            Err(err) => return self.failed(facade, err),
        };

        info!(
            database,
            table,
            cluster = %target.cluster,
            local_database = %target.database,
            local_table = %target.table,
            "Distributed table, migrating its local table"
        );
        facade.cluster = Some(target.cluster.clone());

        let local = self.migrate_local(&target.database, &target.table).await;
        facade.total_partitions = local.result.total_partitions;
        facade.completed_partitions = local.result.completed_partitions;
        facade.total_rows = local.result.total_rows;
        facade.migrated_rows = local.result.migrated_rows;
        facade.local_tables.push(local.result);

        let status = aggregate_status(&facade.local_tables);
        if status == MigrationStatus::Failed {
            facade.error = Some(format!(
                "local table {}.{} did not migrate",
                target.database, target.table
            ));
        }

        Attempt {
            result: facade.finish(status),
            fatal: local.fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quoted_arguments() {
        let target = parse_distributed_engine(
            "Distributed('ck_cluster', 'dws', 'events_local', rand())",
            "dws",
        )
        .unwrap();
        assert_eq!(
            target,
            DistributedTarget {
                cluster: "ck_cluster".into(),
                database: "dws".into(),
                table: "events_local".into(),
            }
        );
    }

    #[test]
    fn test_parse_bare_arguments_and_current_database() {
        let target = parse_distributed_engine(
            "Distributed(ck_cluster, currentDatabase(), events_local, cityHash64(user_id), 'hot')",
            "analytics",
        )
        .unwrap();
        assert_eq!(target.cluster, "ck_cluster");
        assert_eq!(target.database, "analytics");
        assert_eq!(target.table, "events_local");
    }

    #[test]
    fn test_parse_with_trailing_settings() {
        let target = parse_distributed_engine(
            "Distributed(`c1`, `db`, `t_local`) SETTINGS fsync_after_insert = 0",
            "db",
        )
        .unwrap();
        assert_eq!(target.table, "t_local");
    }

    #[test]
    fn test_parse_rejects_short_argument_list() {
        assert!(matches!(
            parse_distributed_engine("Distributed('c', 'db')", "db"),
            Err(MigrationError::Ddl(_))
        ));
        assert!(matches!(
            parse_distributed_engine("MergeTree ORDER BY id", "db"),
            Err(MigrationError::Ddl(_))
        ));
    }

    #[test]
    fn test_aggregate_status() {
        let with = |status| MigrationResult::new("db", "t").finish(status);

        assert_eq!(
            aggregate_status(&[with(MigrationStatus::Skipped)]),
            MigrationStatus::Skipped
        );
        assert_eq!(
            aggregate_status(&[with(MigrationStatus::Completed)]),
            MigrationStatus::Completed
        );
        assert_eq!(
            aggregate_status(&[with(MigrationStatus::Completed), with(MigrationStatus::Locked)]),
            MigrationStatus::Failed
        );
    }
}
