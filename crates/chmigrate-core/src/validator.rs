//! Row-count consistency checks.
//!
//! Nothing here is cached: every count goes to the live table, because the
//! migration relies on counting right after each partition copy.

use crate::client::ClickHouse;
use crate::migration::MigrationError;
use crate::partition::{to_where_predicate, PartitionKey, PartitionValue};
use crate::sql::qualified;
use serde::{Deserialize, Serialize};

/// Result of comparing one partition between source and backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionCheck {
    /// Partition value as reported by `system.parts`.
    pub partition: String,
    /// Rows in the source partition.
    pub src_count: u64,
    /// Rows in the backup partition.
    pub dst_count: u64,
    /// Whether the counts match.
    pub passed: bool,
    /// Seconds spent copying and checking the partition.
    pub cost_time: f64,
}

/// Count rows in a table, or in one partition of it.
pub async fn row_count(
    client: &dyn ClickHouse,
    database: &str,
    table: &str,
    partition: Option<(&PartitionKey, &PartitionValue)>,
) -> Result<u64, MigrationError> {
    let mut statement = format!("SELECT count() FROM {}", qualified(database, table));
    if let Some((key, value)) = partition {
        statement.push_str(" WHERE ");
        statement.push_str(&to_where_predicate(key, value)?);
    }

    let rows = client
        .query(&statement)
        .await
        .map_err(|source| consistency_query(database, table, source))?;
    let row = rows.first().ok_or_else(|| {
        consistency_query(
            database,
            table,
            crate::client::ClientError::Decode("count() returned no rows".to_string()),
        )
    })?;

    row.get_u64(0)
        .map_err(|source| consistency_query(database, table, source))
}

/// Compare two counts.
pub fn verify(src_count: u64, dst_count: u64) -> bool {
    src_count == dst_count
}

fn consistency_query(
    database: &str,
    table: &str,
    source: crate::client::ClientError,
) -> MigrationError {
    if source.is_connection() {
        return MigrationError::from(source);
    }
    MigrationError::ConsistencyQuery {
        database: database.to_string(),
        table: table.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockClickHouse;

    #[tokio::test]
    async fn test_row_count_whole_table_and_partition() {
        let ch = MockClickHouse::new();
        ch.add_table("db", "sales", "region", &[("east", 10), ("west", 5)]);

        assert_eq!(row_count(&ch, "db", "sales", None).await.unwrap(), 15);

        let key = PartitionKey::parse("region").unwrap();
        let east = PartitionValue::new("east");
        assert_eq!(
            row_count(&ch, "db", "sales", Some((&key, &east))).await.unwrap(),
            10
        );
        assert!(ch
            .statements()
            .iter()
            .any(|s| s == "SELECT count() FROM db.sales WHERE (region = 'east')"));
    }

    #[tokio::test]
    async fn test_row_count_failure() {
        let ch = MockClickHouse::new();
        let err = row_count(&ch, "db", "missing", None).await.unwrap_err();
        assert!(matches!(err, MigrationError::ConsistencyQuery { .. }));
    }

    #[test]
    fn test_verify() {
        assert!(verify(100, 100));
        assert!(!verify(100, 99));
        assert!(verify(0, 0));
    }
}
