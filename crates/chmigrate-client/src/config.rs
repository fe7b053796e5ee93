//! Client configuration.

use std::time::Duration;

/// Default ClickHouse host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default ClickHouse HTTP port.
pub const DEFAULT_PORT: u16 = 8123;

/// Default ClickHouse user.
pub const DEFAULT_USER: &str = "default";

/// Default request timeout. Partition copies can run for minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,

    /// HTTP interface port.
    pub port: u16,

    /// User name.
    pub user: String,

    /// Password; empty for none.
    pub password: String,

    /// Timeout for a whole request.
    pub timeout: Duration,

    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    /// Create a configuration for `host:port` with the default user.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: DEFAULT_USER.to_string(),
            password: String::new(),
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Configuration for a local server on the default port.
    pub fn localhost() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }

    /// Set the credentials.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Base URL of the HTTP interface.
    pub fn url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::localhost()
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
