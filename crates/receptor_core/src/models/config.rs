//! Session configuration models.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which backend a session talks to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backend {
    /// PostgreSQL server; databases map to schemas.
    #[default]
    Postgres,
    /// Embedded SQLite; databases map to attached database files.
    Sqlite {
        /// Directory holding one `<name>.db` file per database.
        /// `None` keeps every database in memory.
        directory: Option<PathBuf>,
    },
}

impl Backend {
    /// Get the backend's short name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite { .. } => "sqlite",
        }
    }
}

/// Session timing and identification options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Bound on opening the physical connection
    pub connect_timeout_secs: u64,
    /// Period of the liveness check
    pub health_check_interval_secs: u64,
    /// Bound on each liveness ping
    pub validity_timeout_secs: u64,
    /// Bound on each half (disconnect, connect) of a reconnect
    pub reconnect_timeout_secs: u64,
    /// Application name sent to PostgreSQL
    pub application_name: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            health_check_interval_secs: 240,
            validity_timeout_secs: 2,
            reconnect_timeout_secs: 5,
            application_name: "receptor".to_string(),
        }
    }
}

impl SessionOptions {
    /// Connect bound as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Health check period as a `Duration`.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Ping bound as a `Duration`.
    pub fn validity_timeout(&self) -> Duration {
        Duration::from_secs(self.validity_timeout_secs)
    }

    /// Reconnect bound as a `Duration`.
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }
}

/// Configuration for a session.
///
/// The password is never serialized; supply it with [`SessionConfig::with_password`]
/// after loading.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Backend kind
    #[serde(default)]
    pub backend: Backend,
    /// Server hostname or IP (PostgreSQL only)
    #[serde(default)]
    pub host: String,
    /// Server port (default 5432)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Catalog to connect to (PostgreSQL database name)
    #[serde(default)]
    pub catalog: String,
    /// Login username
    #[serde(default)]
    pub username: String,
    /// Login password
    #[serde(skip)]
    pub password: Option<String>,
    /// Additional options
    #[serde(default)]
    pub options: SessionOptions,
}

fn default_port() -> u16 {
    5432
}

impl SessionConfig {
    /// Create a PostgreSQL configuration with required fields.
    pub fn postgres(
        host: impl Into<String>,
        catalog: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            backend: Backend::Postgres,
            host: host.into(),
            port: default_port(),
            catalog: catalog.into(),
            username: username.into(),
            password: None,
            options: SessionOptions::default(),
        }
    }

    /// Create an SQLite configuration storing databases under `directory`.
    pub fn sqlite(directory: impl Into<PathBuf>) -> Self {
        Self::sqlite_backend(Some(directory.into()))
    }

    /// Create an SQLite configuration keeping every database in memory.
    pub fn sqlite_in_memory() -> Self {
        Self::sqlite_backend(None)
    }

    fn sqlite_backend(directory: Option<PathBuf>) -> Self {
        Self {
            backend: Backend::Sqlite { directory },
            host: String::new(),
            port: default_port(),
            catalog: String::new(),
            username: String::new(),
            password: None,
            options: SessionOptions::default(),
        }
    }

    /// Create a builder for complex configurations.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Load a configuration from a JSON file and validate it.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: SessionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Replace the options.
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if let Backend::Postgres = self.backend {
            if self.host.is_empty() {
                return Err(Error::config("Host is required"));
            }
            if self.catalog.is_empty() || self.catalog.len() > 63 {
                return Err(Error::config("Catalog name must be 1-63 characters"));
            }
            if self.username.is_empty() {
                return Err(Error::config("Username is required"));
            }
        }
        let o = &self.options;
        if o.connect_timeout_secs == 0 || o.validity_timeout_secs == 0 || o.reconnect_timeout_secs == 0
        {
            return Err(Error::config("Timeouts must be at least one second"));
        }
        if o.health_check_interval_secs == 0 {
            return Err(Error::config("Health check interval must be at least one second"));
        }
        Ok(())
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        match &self.backend {
            Backend::Postgres => format!(
                "postgresql://{}@{}:{}/{}",
                self.username, self.host, self.port, self.catalog
            ),
            Backend::Sqlite { directory: Some(dir) } => format!("sqlite://{}", dir.display()),
            Backend::Sqlite { directory: None } => "sqlite::memory:".to_string(),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("backend", &self.backend)
            .field("url", &self.display_url())
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("options", &self.options)
            .finish()
    }
}

/// Builder for SessionConfig.
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    backend: Backend,
    host: Option<String>,
    port: u16,
    catalog: Option<String>,
    username: Option<String>,
    password: Option<String>,
    options: SessionOptions,
}

impl SessionConfigBuilder {
    /// Set the backend.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the catalog (PostgreSQL database) name.
    pub fn catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    /// Set the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.options.connect_timeout_secs = secs;
        self
    }

    /// Set the health check interval.
    pub fn health_check_interval_secs(mut self, secs: u64) -> Self {
        self.options.health_check_interval_secs = secs;
        self
    }

    /// Set the liveness ping timeout.
    pub fn validity_timeout_secs(mut self, secs: u64) -> Self {
        self.options.validity_timeout_secs = secs;
        self
    }

    /// Set the reconnect timeout.
    pub fn reconnect_timeout_secs(mut self, secs: u64) -> Self {
        self.options.reconnect_timeout_secs = secs;
        self
    }

    /// Set the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.options.application_name = name.into();
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<SessionConfig> {
        let config = SessionConfig {
            backend: self.backend,
            host: self.host.unwrap_or_default(),
            port: if self.port == 0 { default_port() } else { self.port },
            catalog: self.catalog.unwrap_or_default(),
            username: self.username.unwrap_or_default(),
            password: self.password,
            options: self.options,
        };
        config.validate()?;
        Ok(config)
    }
}
