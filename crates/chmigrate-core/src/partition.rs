//! Partition resolver.
//!
//! Discovers a table's partition key and its materialized partitions, and
//! renders partition values into the two forms the migration needs: a
//! `WHERE` predicate and a `DROP PARTITION` literal.

use crate::client::ClickHouse;
use crate::migration::MigrationError;
use crate::sql::{quote_literal, split_top_level, strip_enclosing_parens};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered list of the fields that define a table's partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKey {
    fields: Vec<String>,
}

impl PartitionKey {
    /// Parse a partition key expression as reported by `system.tables`.
    ///
    /// `(dt, channel)` and `tuple(dt, channel)` are composite keys; commas
    /// nested inside function calls (`toStartOfInterval(ts, INTERVAL 1 DAY)`)
    /// do not split fields.
    pub fn parse(expression: &str) -> Option<Self> {
        let mut expr = expression.trim();
        if let Some(rest) = expr.strip_prefix("tuple") {
            if rest.trim_start().starts_with('(') {
                expr = rest.trim_start();
            }
        }
        let inner = strip_enclosing_parens(expr);

        let fields: Vec<String> = split_top_level(inner)
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();

        if fields.is_empty() {
            None
        } else {
            Some(Self { fields })
        }
    }

    /// Key fields, in declaration order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Number of key fields.
    pub fn arity(&self) -> usize {
        self.fields.len()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fields.join(", "))
    }
}

/// One scalar component of a partition value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar {
    /// Numeric literal, rendered bare.
    Numeric(String),
    /// String, date or other literal, rendered single-quoted.
    Quoted(String),
}

impl Scalar {
    /// Classify a raw component.
    ///
    /// Already-quoted components keep their text; anything that parses as a
    /// finite number is numeric; everything else is quoted.
    pub fn classify(raw: &str) -> Self {
        let raw = raw.trim();
        if is_quoted(raw) {
            Scalar::Quoted(raw.to_string())
        } else if is_numeric(raw) {
            Scalar::Numeric(raw.to_string())
        } else {
            Scalar::Quoted(quote_literal(raw))
        }
    }

    /// SQL literal text.
    pub fn as_sql(&self) -> &str {
        match self {
            Scalar::Numeric(s) | Scalar::Quoted(s) => s,
        }
    }
}

/// A materialized partition, as the `partition` column of `system.parts`
/// reports it (`202401`, `2024-01-01`, `('2024-01-01','novel')`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionValue(String);

impl PartitionValue {
    /// Wrap a raw partition value.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    /// Raw value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the value is a parenthesized tuple.
    pub fn is_tuple(&self) -> bool {
        self.0.starts_with('(') && strip_enclosing_parens(&self.0).len() < self.0.len()
    }

    /// Scalar components of the value (one for a plain value).
    pub fn components(&self) -> Vec<Scalar> {
        split_top_level(strip_enclosing_parens(&self.0))
            .into_iter()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(Scalar::classify)
            .collect()
    }
}

impl fmt::Display for PartitionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionValue {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Build the `WHERE` predicate selecting one partition's rows.
///
/// Each key field is paired with the matching value component:
/// `(dt = '2024-01-01') AND (channel = 'novel')`.
pub fn to_where_predicate(
    key: &PartitionKey,
    value: &PartitionValue,
) -> Result<String, MigrationError> {
    let components = value.components();
    if components.len() != key.arity() {
        return Err(MigrationError::ArityMismatch {
            key: key.to_string(),
            value: value.to_string(),
            key_arity: key.arity(),
            value_arity: components.len(),
        });
    }

    let conditions: Vec<String> = key
        .fields()
        .iter()
        .zip(components.iter())
        .map(|(field, scalar)| format!("({} = {})", field, scalar.as_sql()))
        .collect();

    Ok(conditions.join(" AND "))
}

/// Render a partition value for `ALTER TABLE ... DROP PARTITION`.
///
/// Tuples pass through unchanged, numbers stay bare and anything else is
/// quoted exactly once, so applying this to its own output is a no-op.
pub fn to_drop_literal(value: &str) -> String {
    let value = value.trim();
    if value.starts_with('(') && value.ends_with(')') {
        return value.to_string();
    }
    if is_numeric(value) || is_quoted(value) {
        return value.to_string();
    }
    quote_literal(value)
}

/// Resolve the table's partition key from `system.tables`.
pub async fn resolve_partition_key(
    client: &dyn ClickHouse,
    database: &str,
    table: &str,
) -> Result<PartitionKey, MigrationError> {
    let statement = format!(
        "SELECT partition_key FROM system.tables WHERE database = {} AND name = {}",
        quote_literal(database),
        quote_literal(table)
    );
    let rows = client.query(&statement).await?;
    let row = rows
        .first()
        .ok_or_else(|| MigrationError::schema(database, table, "table does not exist"))?;
    let expression = row.get_string(0)?;

    PartitionKey::parse(&expression).ok_or_else(|| {
        MigrationError::schema(
            database,
            table,
            "table has no PARTITION BY clause and cannot be migrated partition by partition",
        )
    })
}

/// List the table's active partitions in ascending order.
///
/// Every call re-reads `system.parts`; the list shrinks as partitions are
/// dropped from the source during a migration.
pub async fn list_partitions(
    client: &dyn ClickHouse,
    database: &str,
    table: &str,
) -> Result<Vec<PartitionValue>, MigrationError> {
    let statement = format!(
        "SELECT DISTINCT partition FROM system.parts WHERE database = {} AND table = {} AND active = 1 ORDER BY partition",
        quote_literal(database),
        quote_literal(table)
    );
    let rows = client.query(&statement).await?;

    rows.iter()
        .map(|row| row.get_string(0).map(PartitionValue::new))
        .collect::<Result<Vec<_>, _>>()
        .map_err(MigrationError::from)
}

fn is_quoted(value: &str) -> bool {
    value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'')
}

fn is_numeric(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
        && value.parse::<f64>().map(f64::is_finite).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Split a predicate back into `(field, literal)` pairs.
    fn parse_predicate(predicate: &str) -> Vec<(String, String)> {
        predicate
            .split(" AND ")
            .map(|cond| {
                let cond = cond.trim().trim_start_matches('(').trim_end_matches(')');
                let (field, value) = cond.split_once(" = ").unwrap();
                (field.to_string(), value.to_string())
            })
            .collect()
    }

    #[test]
    fn test_parse_single_key() {
        let key = PartitionKey::parse("idate").unwrap();
        assert_eq!(key.fields(), &["idate".to_string()]);
        assert_eq!(key.arity(), 1);
    }

    #[test]
    fn test_parse_composite_key() {
        let key = PartitionKey::parse("(dt, channel)").unwrap();
        assert_eq!(key.fields(), &["dt".to_string(), "channel".to_string()]);

        let key = PartitionKey::parse("tuple(dt, channel)").unwrap();
        assert_eq!(key.arity(), 2);
    }

    #[test]
    fn test_parse_key_with_function_arguments() {
        let key = PartitionKey::parse("(toStartOfInterval(ts, toIntervalDay(1)), region)").unwrap();
        assert_eq!(
            key.fields(),
            &[
                "toStartOfInterval(ts, toIntervalDay(1))".to_string(),
                "region".to_string()
            ]
        );

        let key = PartitionKey::parse("toYYYYMM(event_date)").unwrap();
        assert_eq!(key.fields(), &["toYYYYMM(event_date)".to_string()]);
    }

    #[test]
    fn test_parse_empty_key() {
        assert!(PartitionKey::parse("").is_none());
        assert!(PartitionKey::parse("  ").is_none());
        assert!(PartitionKey::parse("tuple()").is_none());
    }

    #[test]
    fn test_predicate_single_values() {
        let key = PartitionKey::parse("idate").unwrap();

        assert_eq!(
            to_where_predicate(&key, &"20240101".into()).unwrap(),
            "(idate = 20240101)"
        );
        assert_eq!(
            to_where_predicate(&key, &"2024-01-01".into()).unwrap(),
            "(idate = '2024-01-01')"
        );
        assert_eq!(
            to_where_predicate(&key, &"'east'".into()).unwrap(),
            "(idate = 'east')"
        );
    }

    #[test]
    fn test_predicate_composite_value() {
        let key = PartitionKey::parse("(dt, channel)").unwrap();
        let value = PartitionValue::new("('2024-01-01','novel')");

        assert_eq!(
            to_where_predicate(&key, &value).unwrap(),
            "(dt = '2024-01-01') AND (channel = 'novel')"
        );
    }

    #[test]
    fn test_predicate_quoted_comma() {
        let key = PartitionKey::parse("(region, shard)").unwrap();
        let value = PartitionValue::new("('us,east',3)");

        assert_eq!(
            to_where_predicate(&key, &value).unwrap(),
            "(region = 'us,east') AND (shard = 3)"
        );
    }

    #[test]
    fn test_predicate_arity_mismatch() {
        let key = PartitionKey::parse("(dt, channel)").unwrap();
        let err = to_where_predicate(&key, &"2024-01-01".into()).unwrap_err();

        assert!(matches!(
            err,
            MigrationError::ArityMismatch {
                key_arity: 2,
                value_arity: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_predicate_round_trip() {
        let cases: Vec<(&str, &str, Vec<(&str, &str)>)> = vec![
            ("region", "east", vec![("region", "'east'")]),
            ("id", "-17", vec![("id", "-17")]),
            ("ratio", "0.25", vec![("ratio", "0.25")]),
            ("name", "nan", vec![("name", "'nan'")]),
            (
                "(dt, channel, bucket)",
                "('2024-01-01','novel',12)",
                vec![("dt", "'2024-01-01'"), ("channel", "'novel'"), ("bucket", "12")],
            ),
            ("(a, b)", "(1,2)", vec![("a", "1"), ("b", "2")]),
        ];

        for (key, value, expected) in cases {
            let key = PartitionKey::parse(key).unwrap();
            let predicate = to_where_predicate(&key, &PartitionValue::new(value)).unwrap();
            let parsed = parse_predicate(&predicate);
            let expected: Vec<(String, String)> = expected
                .into_iter()
                .map(|(f, v)| (f.to_string(), v.to_string()))
                .collect();
            assert_eq!(parsed, expected, "predicate {predicate}");
        }
    }

    #[test]
    fn test_drop_literal_forms() {
        assert_eq!(to_drop_literal("20240101"), "20240101");
        assert_eq!(to_drop_literal("2023-12-31"), "'2023-12-31'");
        assert_eq!(to_drop_literal("'east'"), "'east'");
        assert_eq!(
            to_drop_literal("('2024-01-01','novel')"),
            "('2024-01-01','novel')"
        );
        assert_eq!(to_drop_literal("o'brien"), "'o\\'brien'");
    }

    #[test]
    fn test_drop_literal_idempotent() {
        for value in [
            "20240101",
            "-3",
            "1.5",
            "2023-12-31",
            "east",
            "'west'",
            "('2024-01-01','novel')",
            "(1,2)",
            "o'brien",
            "inf",
        ] {
            let once = to_drop_literal(value);
            assert_eq!(to_drop_literal(&once), once, "value {value}");
        }
    }

    #[test]
    fn test_partition_value_shape() {
        assert!(PartitionValue::new("('a','b')").is_tuple());
        assert!(!PartitionValue::new("202401").is_tuple());
        assert_eq!(PartitionValue::new("(1,2)").components().len(), 2);
        assert_eq!(PartitionValue::new("east").components().len(), 1);
    }
}
