//! Database client contract consumed by the migration engine.
//!
//! The engine only needs two things from ClickHouse: run a statement that
//! returns rows, and run a statement that returns nothing. Any driver can be
//! adapted behind [`ClickHouse`]; result rows are surfaced through the narrow
//! [`Row`] type so the engine never depends on a driver's row representation.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors raised by a database client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The server could not be reached or the connection dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// A row-returning statement failed.
    #[error("query failed: {message} (statement: {statement})")]
    Query {
        /// The statement that failed.
        statement: String,
        /// Server or driver message.
        message: String,
    },

    /// A DDL/DML statement failed.
    #[error("command failed: {message} (statement: {statement})")]
    Command {
        /// The statement that failed.
        statement: String,
        /// Server or driver message.
        message: String,
    },

    /// The server answered, but the payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ClientError {
    /// Build a query error.
    pub fn query(statement: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            statement: statement.into(),
            message: message.into(),
        }
    }

    /// Build a command error.
    pub fn command(statement: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            statement: statement.into(),
            message: message.into(),
        }
    }

    /// Whether this error means the connection itself is unusable.
    pub fn is_connection(&self) -> bool {
        matches!(self, ClientError::Connection(_))
    }
}

/// A single result row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    /// Create a row from its column values.
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Number of columns in the row.
    pub fn column_count(&self) -> usize {
        self.values.len()
    }

    /// Raw value at `index`.
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// String value at `index`.
    ///
    /// Numbers are rendered to their textual form so that callers reading
    /// e.g. a partition id get the same text regardless of the column type.
    pub fn get_string(&self, index: usize) -> Result<String, ClientError> {
        match self.value(index) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(Value::Bool(b)) => Ok(b.to_string()),
            Some(Value::Null) => Ok(String::new()),
            Some(other) => Err(ClientError::Decode(format!(
                "column {index}: expected string, got {other}"
            ))),
            None => Err(self.missing(index)),
        }
    }

    /// Unsigned integer value at `index`.
    ///
    /// ClickHouse quotes 64-bit integers in JSON output, so numeric strings
    /// are accepted as well.
    pub fn get_u64(&self, index: usize) -> Result<u64, ClientError> {
        match self.value(index) {
            Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
                ClientError::Decode(format!("column {index}: {n} is not an unsigned integer"))
            }),
            Some(Value::String(s)) => s.trim().parse::<u64>().map_err(|e| {
                ClientError::Decode(format!("column {index}: {s:?} is not an unsigned integer: {e}"))
            }),
            Some(other) => Err(ClientError::Decode(format!(
                "column {index}: expected unsigned integer, got {other}"
            ))),
            None => Err(self.missing(index)),
        }
    }

    fn missing(&self, index: usize) -> ClientError {
        ClientError::Decode(format!(
            "column {index} out of range (row has {} columns)",
            self.values.len()
        ))
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

/// Minimal ClickHouse client contract.
#[async_trait]
pub trait ClickHouse: Send + Sync {
    /// Execute a row-returning statement.
    async fn query(&self, statement: &str) -> Result<Vec<Row>, ClientError>;

    /// Execute a DDL or DML statement.
    async fn command(&self, statement: &str) -> Result<(), ClientError>;
}
