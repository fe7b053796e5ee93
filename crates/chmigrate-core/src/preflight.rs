//! Checks run once before any table is touched.

use crate::client::ClickHouse;
use crate::migration::MigrationError;
use crate::sql::quote_literal;
use tracing::{error, info};

/// Check that the server answers.
pub async fn verify_connection(client: &dyn ClickHouse) -> Result<(), MigrationError> {
    client.query("SELECT 1").await?;
    info!("ClickHouse connection verified");
    Ok(())
}

/// Check that `policy` exists and that a table can actually be created on it.
///
/// The probe table lives in `default` and is dropped whether or not the
/// creation succeeded.
pub async fn verify_storage_policy(
    client: &dyn ClickHouse,
    policy: &str,
) -> Result<(), MigrationError> {
    let rows = client
        .query(&format!(
            "SELECT policy_name FROM system.storage_policies WHERE policy_name = {}",
            quote_literal(policy)
        ))
        .await?;

    if rows.is_empty() {
        let available = available_policies(client).await;
        error!(policy, available = ?available, "Storage policy does not exist");
        return Err(MigrationError::Preflight(format!(
            "storage policy `{policy}` does not exist (available: {})",
            available.join(", ")
        )));
    }

    let probe = format!(
        "default.__tmp_s3_policy_check_{}",
        chrono::Utc::now().timestamp()
    );
    info!(policy, probe = %probe, "Verifying storage policy with a probe table");

    let created = client
        .command(&format!(
            "CREATE TABLE IF NOT EXISTS {probe} (id UInt64, data String) ENGINE = MergeTree() ORDER BY id SETTINGS storage_policy = {}",
            quote_literal(policy)
        ))
        .await;
    let dropped = client.command(&format!("DROP TABLE IF EXISTS {probe}")).await;

    if let Err(err) = created {
        if err.is_connection() {
            return Err(err.into());
        }
        error!(
            policy,
            error = %err,
            "Storage policy unusable: check the policy name, its disk configuration \
             (S3 credentials, bucket, endpoint) and the server's network access to S3"
        );
        return Err(MigrationError::Preflight(format!(
            "cannot create a table on storage policy `{policy}`: {err}"
        )));
    }
    dropped?;

    info!(policy, "Storage policy verified");
    Ok(())
}

async fn available_policies(client: &dyn ClickHouse) -> Vec<String> {
    match client
        .query("SELECT policy_name FROM system.storage_policies")
        .await
    {
        Ok(rows) => rows
            .iter()
            .filter_map(|row| row.get_string(0).ok())
            .collect(),
        Err(err) => {
            error!(error = %err, "Failed to list storage policies");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockClickHouse;

    #[tokio::test]
    async fn test_connection() {
        let ch = MockClickHouse::new();
        verify_connection(&ch).await.unwrap();

        ch.fail_on("SELECT 1", crate::client::ClientError::Connection("refused".into()));
        let err = verify_connection(&ch).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_policy_verified_and_probe_dropped() {
        let ch = MockClickHouse::new();
        ch.add_storage_policy("s3");

        verify_storage_policy(&ch, "s3").await.unwrap();

        let statements = ch.statements();
        assert!(statements
            .iter()
            .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS default.__tmp_s3_policy_check_")));
        assert!(statements
            .iter()
            .any(|s| s.starts_with("DROP TABLE IF EXISTS default.__tmp_s3_policy_check_")));
    }

    #[tokio::test]
    async fn test_missing_policy() {
        let ch = MockClickHouse::new();
        ch.add_storage_policy("default");

        let err = verify_storage_policy(&ch, "s3").await.unwrap_err();
        assert!(matches!(err, MigrationError::Preflight(ref m) if m.contains("default")));
    }

    #[tokio::test]
    async fn test_probe_creation_failure_still_drops() {
        let ch = MockClickHouse::new();
        ch.add_storage_policy("s3");
        ch.fail_on(
            "CREATE TABLE IF NOT EXISTS default.__tmp",
            crate::client::ClientError::command("CREATE", "disk s3 is not accessible"),
        );

        let err = verify_storage_policy(&ch, "s3").await.unwrap_err();
        assert!(matches!(err, MigrationError::Preflight(_)));
        assert!(ch
            .statements()
            .iter()
            .any(|s| s.starts_with("DROP TABLE IF EXISTS default.__tmp_s3_policy_check_")));
    }
}
