//! In-memory ClickHouse double.
//!
//! Understands exactly the statements the migration engine issues and keeps
//! per-partition row counts instead of rows. Every statement is logged, and
//! failures or lossy copies can be injected.

use crate::client::{ClickHouse, ClientError, Row};
use crate::ddl::TableDefinition;
use crate::partition::{to_drop_literal, to_where_predicate, PartitionKey, PartitionValue};
use crate::sql::find_keyword;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone)]
struct MockTable {
    engine: String,
    engine_full: String,
    partition_key: String,
    create: String,
    partitions: BTreeMap<String, u64>,
}

impl MockTable {
    fn key(&self) -> Option<PartitionKey> {
        PartitionKey::parse(&self.partition_key)
    }

    /// Partitions selected by a `WHERE` predicate built by the engine.
    fn matching(&self, predicate: &str) -> Vec<String> {
        let Some(key) = self.key() else {
            return Vec::new();
        };
        self.partitions
            .keys()
            .filter(|value| {
                to_where_predicate(&key, &PartitionValue::new(value.as_str()))
                    .map(|p| p == predicate)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<(String, String), MockTable>,
    policies: BTreeSet<String>,
    statements: Vec<String>,
    failures: Vec<(String, ClientError)>,
    copy_loss: HashMap<String, u64>,
}

/// In-memory ClickHouse.
#[derive(Debug)]
pub struct MockClickHouse {
    inner: Mutex<Inner>,
}

impl Default for MockClickHouse {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClickHouse {
    /// Empty server with only the `default` storage policy.
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner.policies.insert("default".to_string());
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Register a storage policy.
    pub fn add_storage_policy(&self, policy: &str) {
        self.inner.lock().policies.insert(policy.to_string());
    }

    /// Add a MergeTree table partitioned by `partition_key`, with the given
    /// rows per partition.
    pub fn add_table(&self, database: &str, table: &str, partition_key: &str, partitions: &[(&str, u64)]) {
        let create = if partition_key.is_empty() {
            format!("CREATE TABLE {database}.{table} (`id` UInt64) ENGINE = MergeTree ORDER BY id SETTINGS index_granularity = 8192")
        } else {
            format!("CREATE TABLE {database}.{table} (`id` UInt64) ENGINE = MergeTree PARTITION BY {partition_key} ORDER BY id SETTINGS index_granularity = 8192")
        };
        let table_def = MockTable {
            engine: "MergeTree".to_string(),
            engine_full: "MergeTree ORDER BY id".to_string(),
            partition_key: partition_key.to_string(),
            create,
            partitions: partitions
                .iter()
                .filter(|(_, rows)| *rows > 0)
                .map(|(value, rows)| (value.to_string(), *rows))
                .collect(),
        };
        self.inner
            .lock()
            .tables
            .insert(key(database, table), table_def);
    }

    /// Add a table with any engine and no data (views, logs).
    pub fn add_table_with_engine(&self, database: &str, table: &str, engine: &str) {
        let table_def = MockTable {
            engine: engine.to_string(),
            engine_full: engine.to_string(),
            partition_key: String::new(),
            create: format!("CREATE TABLE {database}.{table} (`id` UInt64) ENGINE = {engine}"),
            partitions: BTreeMap::new(),
        };
        self.inner
            .lock()
            .tables
            .insert(key(database, table), table_def);
    }

    /// Add a Distributed facade.
    pub fn add_distributed(&self, database: &str, table: &str, engine_full: &str) {
        let table_def = MockTable {
            engine: "Distributed".to_string(),
            engine_full: engine_full.to_string(),
            partition_key: String::new(),
            create: format!("CREATE TABLE {database}.{table} (`id` UInt64) ENGINE = {engine_full}"),
            partitions: BTreeMap::new(),
        };
        self.inner
            .lock()
            .tables
            .insert(key(database, table), table_def);
    }

    /// Replace what `SHOW CREATE TABLE` returns for a table.
    pub fn set_definition(&self, database: &str, table: &str, create: &str) {
        if let Some(t) = self.inner.lock().tables.get_mut(&key(database, table)) {
            t.create = create.to_string();
        }
    }

    /// Fail every statement starting with `prefix` with `error`.
    pub fn fail_on(&self, prefix: &str, error: ClientError) {
        self.inner
            .lock()
            .failures
            .push((prefix.to_string(), error));
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.inner.lock().failures.clear();
    }

    /// Drop `rows` rows whenever partition `partition` is copied.
    pub fn lose_rows_on_copy(&self, partition: &str, rows: u64) {
        self.inner
            .lock()
            .copy_loss
            .insert(partition.to_string(), rows);
    }

    /// Every statement received, in order.
    pub fn statements(&self) -> Vec<String> {
        self.inner.lock().statements.clone()
    }

    /// Forget the statement log.
    pub fn clear_statements(&self) {
        self.inner.lock().statements.clear();
    }

    /// Whether a table exists.
    pub fn has_table(&self, database: &str, table: &str) -> bool {
        self.inner.lock().tables.contains_key(&key(database, table))
    }

    /// Rows per partition of a table.
    pub fn partitions(&self, database: &str, table: &str) -> BTreeMap<String, u64> {
        self.inner
            .lock()
            .tables
            .get(&key(database, table))
            .map(|t| t.partitions.clone())
            .unwrap_or_default()
    }

    /// Total rows of a table.
    pub fn row_count(&self, database: &str, table: &str) -> u64 {
        self.partitions(database, table).values().sum()
    }

    /// Current `SHOW CREATE TABLE` text of a table.
    pub fn definition(&self, database: &str, table: &str) -> Option<String> {
        self.inner
            .lock()
            .tables
            .get(&key(database, table))
            .map(|t| t.create.clone())
    }

    fn execute(&self, statement: &str) -> Result<Vec<Row>, ClientError> {
        let mut inner = self.inner.lock();
        inner.statements.push(statement.to_string());

        if let Some((_, err)) = inner
            .failures
            .iter()
            .find(|(prefix, _)| statement.starts_with(prefix.as_str()))
        {
            return Err(err.clone());
        }

        let s = statement.trim();
        if s == "SELECT 1" {
            return Ok(vec![Row::new(vec![json!(1)])]);
        }
        if let Some(rest) = s.strip_prefix("SELECT policy_name FROM system.storage_policies") {
            let wanted = quoted_after(rest, "policy_name = ");
            return Ok(inner
                .policies
                .iter()
                .filter(|p| wanted.as_ref().is_none_or(|w| w == *p))
                .map(|p| Row::new(vec![json!(p)]))
                .collect());
        }
        if let Some(rest) = s.strip_prefix("SELECT engine, engine_full FROM system.tables") {
            return Ok(inner
                .lookup(rest)
                .map(|t| vec![Row::new(vec![json!(t.engine), json!(t.engine_full)])])
                .unwrap_or_default());
        }
        if let Some(rest) = s.strip_prefix("SELECT partition_key FROM system.tables") {
            return Ok(inner
                .lookup(rest)
                .map(|t| vec![Row::new(vec![json!(t.partition_key)])])
                .unwrap_or_default());
        }
        if let Some(rest) = s.strip_prefix("SELECT name FROM system.tables") {
            return Ok(inner.list_tables(rest));
        }
        if let Some(rest) = s.strip_prefix("SELECT DISTINCT partition FROM system.parts") {
            let database = quoted_after(rest, "database = ").unwrap_or_default();
            let table = quoted_after(rest, "table = ").unwrap_or_default();
            return Ok(inner
                .tables
                .get(&key(&database, &table))
                .map(|t| {
                    t.partitions
                        .keys()
                        .map(|p| Row::new(vec![json!(p)]))
                        .collect()
                })
                .unwrap_or_default());
        }
        if let Some(rest) = s.strip_prefix("SHOW CREATE TABLE ") {
            let t = inner.table(statement, rest.trim())?;
            return Ok(vec![Row::new(vec![json!(t.create)])]);
        }
        if let Some(rest) = s.strip_prefix("SELECT count() FROM ") {
            let (ident, predicate) = match rest.split_once(" WHERE ") {
                Some((ident, predicate)) => (ident, Some(predicate)),
                None => (rest, None),
            };
            let t = inner.table(statement, ident.trim())?;
            let count: u64 = match predicate {
                Some(predicate) => t
                    .matching(predicate)
                    .iter()
                    .filter_map(|p| t.partitions.get(p))
                    .sum(),
                None => t.partitions.values().sum(),
            };
            return Ok(vec![Row::new(vec![Value::String(count.to_string())])]);
        }
        if let Some(rest) = s.strip_prefix("INSERT INTO ") {
            inner.insert_select(statement, rest)?;
            return Ok(Vec::new());
        }
        if let Some(rest) = s.strip_prefix("ALTER TABLE ") {
            let (ident, literal) = rest
                .split_once(" DROP PARTITION ")
                .ok_or_else(|| unsupported(statement))?;
            let t = inner.table_mut(statement, ident.trim())?;
            t.partitions
                .retain(|value, _| to_drop_literal(value) != literal.trim());
            return Ok(Vec::new());
        }
        if let Some(rest) = s.strip_prefix("DROP TABLE IF EXISTS ") {
            let (database, table) = split_ident(rest.trim());
            inner.tables.remove(&key(&database, &table));
            return Ok(Vec::new());
        }
        if let Some(rest) = s.strip_prefix("DROP TABLE ") {
            let (database, table) = split_ident(rest.trim());
            if inner.tables.remove(&key(&database, &table)).is_none() {
                return Err(ClientError::command(statement, missing_table(&database, &table)));
            }
            return Ok(Vec::new());
        }
        if let Some(rest) = s.strip_prefix("RENAME TABLE ") {
            inner.rename(statement, rest)?;
            return Ok(Vec::new());
        }
        if s.starts_with("CREATE TABLE ") {
            inner.create(statement)?;
            return Ok(Vec::new());
        }

        Err(unsupported(statement))
    }
}

impl Inner {
    fn lookup(&self, where_clause: &str) -> Option<&MockTable> {
        let database = quoted_after(where_clause, "database = ")?;
        let table = quoted_after(where_clause, "name = ")?;
        self.tables.get(&key(&database, &table))
    }

    fn list_tables(&self, where_clause: &str) -> Vec<Row> {
        let database = quoted_after(where_clause, "database = ").unwrap_or_default();
        let name = quoted_after(where_clause, "name = ");
        let eligible_only = where_clause.contains("engine LIKE '%MergeTree'");

        self.tables
            .iter()
            .filter(|((db, table), t)| {
                *db == database
                    && name.as_ref().is_none_or(|n| n == table)
                    && (!eligible_only || t.engine.ends_with("MergeTree") || t.engine == "Distributed")
            })
            .map(|((_, table), _)| Row::new(vec![json!(table)]))
            .collect()
    }

    fn table(&self, statement: &str, ident: &str) -> Result<&MockTable, ClientError> {
        let (database, table) = split_ident(ident);
        self.tables
            .get(&key(&database, &table))
            .ok_or_else(|| ClientError::query(statement, missing_table(&database, &table)))
    }

    fn table_mut(&mut self, statement: &str, ident: &str) -> Result<&mut MockTable, ClientError> {
        let (database, table) = split_ident(ident);
        self.tables
            .get_mut(&key(&database, &table))
            .ok_or_else(|| ClientError::command(statement, missing_table(&database, &table)))
    }

    fn insert_select(&mut self, statement: &str, rest: &str) -> Result<(), ClientError> {
        let (target, rest) = rest
            .split_once(" SELECT * FROM ")
            .ok_or_else(|| unsupported(statement))?;
        let (source, predicate) = rest
            .split_once(" WHERE ")
            .ok_or_else(|| unsupported(statement))?;

        let src = self.table(statement, source.trim())?;
        let copied: Vec<(String, u64)> = src
            .matching(predicate.trim())
            .into_iter()
            .map(|p| {
                let rows = src.partitions.get(&p).copied().unwrap_or(0);
                let lost = self.copy_loss.get(&p).copied().unwrap_or(0);
                (p, rows.saturating_sub(lost))
            })
            .collect();

        let dst = self.table_mut(statement, target.trim())?;
        for (partition, rows) in copied {
            if rows > 0 {
                *dst.partitions.entry(partition).or_insert(0) += rows;
            }
        }
        Ok(())
    }

    fn rename(&mut self, statement: &str, rest: &str) -> Result<(), ClientError> {
        let (from, to) = rest.split_once(" TO ").ok_or_else(|| unsupported(statement))?;
        let (from_db, from_table) = split_ident(from.trim());
        let (to_db, to_table) = split_ident(to.trim());

        if self.tables.contains_key(&key(&to_db, &to_table)) {
            return Err(ClientError::command(
                statement,
                format!("table {to_db}.{to_table} already exists"),
            ));
        }
        let mut t = self
            .tables
            .remove(&key(&from_db, &from_table))
            .ok_or_else(|| ClientError::command(statement, missing_table(&from_db, &from_table)))?;

        if let Ok(mut definition) = TableDefinition::parse(&t.create) {
            definition.rename(to_table.clone());
            t.create = definition.to_string();
        }
        self.tables.insert(key(&to_db, &to_table), t);
        Ok(())
    }

    fn create(&mut self, statement: &str) -> Result<(), ClientError> {
        let definition = TableDefinition::parse(statement)
            .map_err(|e| ClientError::command(statement, e.to_string()))?;
        let database = definition.database().unwrap_or("default").to_string();
        let table = definition.table().to_string();

        if let Some(policy) = definition.storage_policy() {
            if !self.policies.contains(policy) {
                return Err(ClientError::command(
                    statement,
                    format!("Unknown storage policy `{policy}`"),
                ));
            }
        }

        let if_not_exists = statement.contains("IF NOT EXISTS");
        if self.tables.contains_key(&key(&database, &table)) {
            if if_not_exists {
                return Ok(());
            }
            return Err(ClientError::command(
                statement,
                format!("table {database}.{table} already exists"),
            ));
        }

        let engine_full = find_keyword(statement, "ENGINE", 0)
            .map(|pos| {
                statement[pos + "ENGINE".len()..]
                    .trim_start()
                    .trim_start_matches('=')
                    .trim()
                    .to_string()
            })
            .unwrap_or_default();
        let engine = engine_full
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();

        self.tables.insert(
            key(&database, &table),
            MockTable {
                engine,
                engine_full: engine_full.clone(),
                partition_key: partition_by(&engine_full),
                create: definition.to_string(),
                partitions: BTreeMap::new(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl ClickHouse for MockClickHouse {
    async fn query(&self, statement: &str) -> Result<Vec<Row>, ClientError> {
        self.execute(statement)
    }

    async fn command(&self, statement: &str) -> Result<(), ClientError> {
        self.execute(statement).map(|_| ())
    }
}

fn key(database: &str, table: &str) -> (String, String) {
    (database.to_string(), table.to_string())
}

fn split_ident(ident: &str) -> (String, String) {
    match ident.split_once('.') {
        Some((database, table)) => (database.to_string(), table.to_string()),
        None => ("default".to_string(), ident.to_string()),
    }
}

fn missing_table(database: &str, table: &str) -> String {
    format!("Table {database}.{table} does not exist")
}

fn unsupported(statement: &str) -> ClientError {
    ClientError::query(statement, "statement not understood by MockClickHouse")
}

/// The single-quoted literal following `marker`, unescaped.
fn quoted_after(input: &str, marker: &str) -> Option<String> {
    let start = input.find(marker)? + marker.len();
    let mut chars = input[start..].chars();
    if chars.next()? != '\'' {
        return None;
    }
    let mut out = String::new();
    let mut escaped = false;
    for c in chars {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '\'' {
            return Some(out);
        } else {
            out.push(c);
        }
    }
    None
}

/// `PARTITION BY` expression of an engine clause.
fn partition_by(engine_clause: &str) -> String {
    let Some(pos) = find_keyword(engine_clause, "PARTITION BY", 0) else {
        return String::new();
    };
    let rest = &engine_clause[pos + "PARTITION BY".len()..];
    let end = ["ORDER BY", "PRIMARY KEY", "SAMPLE BY", "TTL", "SETTINGS", "COMMENT"]
        .iter()
        .filter_map(|kw| find_keyword(rest, kw, 0))
        .min()
        .unwrap_or(rest.len());
    rest[..end].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_copy_and_rename() {
        let ch = MockClickHouse::new();
        ch.add_storage_policy("s3");
        ch.add_table("db", "sales", "region", &[("east", 10), ("west", 5)]);

        ch.command("CREATE TABLE db.sales_b (`id` UInt64) ENGINE = MergeTree PARTITION BY region ORDER BY id SETTINGS storage_policy = 's3'")
            .await
            .unwrap();
        ch.command("INSERT INTO db.sales_b SELECT * FROM db.sales WHERE (region = 'east')")
            .await
            .unwrap();
        assert_eq!(ch.partitions("db", "sales_b").get("east"), Some(&10));

        ch.command("ALTER TABLE db.sales DROP PARTITION 'east'").await.unwrap();
        assert_eq!(ch.row_count("db", "sales"), 5);

        ch.command("DROP TABLE db.sales").await.unwrap();
        ch.command("RENAME TABLE db.sales_b TO db.sales").await.unwrap();
        assert!(ch
            .definition("db", "sales")
            .unwrap()
            .starts_with("CREATE TABLE db.sales ("));
    }

    #[tokio::test]
    async fn test_unknown_policy_rejected() {
        let ch = MockClickHouse::new();
        let err = ch
            .command("CREATE TABLE db.t (id UInt64) ENGINE = MergeTree ORDER BY id SETTINGS storage_policy = 's3'")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Command { .. }));
    }

    #[test]
    fn test_partition_by_extraction() {
        assert_eq!(
            partition_by("MergeTree PARTITION BY (dt, channel) ORDER BY id"),
            "(dt, channel)"
        );
        assert_eq!(partition_by("MergeTree ORDER BY id"), "");
    }
}
