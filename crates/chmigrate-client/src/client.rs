//! ClickHouse over its HTTP interface.
//!
//! Statements are POSTed as the request body. Row-returning statements get
//! `FORMAT JSONCompact` appended and their `data` array is decoded into
//! [`Row`]s.

use crate::config::ClientConfig;
use async_trait::async_trait;
use chmigrate_core::{ClickHouse, ClientError, Row};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

/// JSONCompact response body; only the rows are used.
#[derive(Debug, Deserialize)]
struct CompactResponse {
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

/// ClickHouse HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClickHouse {
    http_client: HttpClient,
    url: String,
    user: String,
    password: String,
}

impl HttpClickHouse {
    /// Build a client. No request is made until the first statement.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        info!(host = %config.host, port = config.port, user = %config.user, "Configuring ClickHouse HTTP client");

        let http_client = HttpClient::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        Ok(Self {
            http_client,
            url: config.url(),
            user: config.user,
            password: config.password,
        })
    }

    async fn post(&self, body: String, statement: &str, is_query: bool) -> Result<String, ClientError> {
        debug!(statement, "Executing statement");

        let mut request = self
            .http_client
            .post(&self.url)
            .header("X-ClickHouse-User", &self.user)
            .body(body);
        if !self.password.is_empty() {
            request = request.header("X-ClickHouse-Key", &self.password);
        }

        let response = request.send().await.map_err(|e| transport_error(e, statement, is_query))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(e, statement, is_query))?;

        if !status.is_success() {
            let message = format!("HTTP {status}: {}", text.trim());
            return Err(if is_query {
                ClientError::query(statement, message)
            } else {
                ClientError::command(statement, message)
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl ClickHouse for HttpClickHouse {
    async fn query(&self, statement: &str) -> Result<Vec<Row>, ClientError> {
        let body = format!("{} FORMAT JSONCompact", statement.trim().trim_end_matches(';'));
        let text = self.post(body, statement, true).await?;
        decode_rows(&text)
    }

    async fn command(&self, statement: &str) -> Result<(), ClientError> {
        self.post(statement.to_string(), statement, false)
            .await
            .map(|_| ())
    }
}

/// Decode a JSONCompact body into rows.
pub fn decode_rows(body: &str) -> Result<Vec<Row>, ClientError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let response: CompactResponse =
        serde_json::from_str(body).map_err(|e| ClientError::Decode(e.to_string()))?;
    Ok(response.data.into_iter().map(Row::new).collect())
}

fn transport_error(err: reqwest::Error, statement: &str, is_query: bool) -> ClientError {
    if err.is_connect() || err.is_timeout() {
        ClientError::Connection(err.to_string())
    } else if is_query {
        ClientError::query(statement, err.to_string())
    } else {
        ClientError::command(statement, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rows() {
        let body = r#"{
            "meta": [{"name": "partition", "type": "String"}, {"name": "rows", "type": "UInt64"}],
            "data": [["202401", "100"], ["202402", "7"]],
            "rows": 2,
            "statistics": {"elapsed": 0.001, "rows_read": 2, "bytes_read": 32}
        }"#;

        let rows = decode_rows(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_string(0).unwrap(), "202401");
        assert_eq!(rows[0].get_u64(1).unwrap(), 100);
        assert_eq!(rows[1].get_u64(1).unwrap(), 7);
    }

    #[test]
    fn test_decode_empty_and_invalid() {
        assert!(decode_rows("").unwrap().is_empty());
        assert!(decode_rows(r#"{"meta": [], "data": [], "rows": 0}"#)
            .unwrap()
            .is_empty());
        assert!(matches!(decode_rows("Code: 60. DB::Exception"), Err(ClientError::Decode(_))));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = HttpClickHouse::new(ClientConfig::new("127.0.0.1", port)).unwrap();

        let err = client.query("SELECT 1").await.unwrap_err();
        assert!(err.is_connection(), "{err}");
    }
}
