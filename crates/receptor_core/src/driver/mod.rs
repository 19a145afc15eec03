//! Backend driver seam.
//!
//! A [`Connector`] opens one physical connection and returns it as a
//! [`Driver`]. The schema and row layers only ever talk to the backend through
//! this trait:
//! - `postgres` - tokio-postgres, databases are schemas
//! - `sqlite` - rusqlite, databases are attached database files (or memory)

pub mod dialect;
pub mod postgres;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod faults;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Backend, BackendVersion, RowKey, SessionConfig, Value};

pub use dialect::{Dialect, OnConflict, ROW_COLUMN};
pub use postgres::{PostgresConnector, PostgresDriver};
pub use sqlite::{SqliteConnector, SqliteDriver};

/// One record returned by [`Driver::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Record {
    /// Create a record from shared column names and its values.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Column names, in result order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Value at a position.
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of a column, matched case-insensitively.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
    }

    /// Iterate `(column, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(String::as_str).zip(self.values.iter())
    }

    /// Consume into `(column, value)` pairs.
    pub fn into_pairs(self) -> impl Iterator<Item = (String, Value)> {
        let columns = self.columns;
        self.values.into_iter().enumerate().map(move |(i, v)| (columns[i].clone(), v))
    }
}

/// A single open backend connection.
///
/// Errors carry SQLSTATE-style codes (see [`crate::error::codes`]) so callers
/// can recognise benign "already exists" and "does not exist" outcomes.
#[async_trait]
pub trait Driver: Send + Sync {
    /// SQL dialect spoken by this driver.
    fn dialect(&self) -> Dialect;

    /// Short backend name for logging.
    fn name(&self) -> &'static str;

    /// Execute a statement, returning the number of affected records.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Run a query and collect every record.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>>;

    /// Detect the backend product and version.
    async fn version(&self) -> Result<BackendVersion>;

    /// Names of the existing databases.
    async fn databases(&self) -> Result<Vec<String>>;

    /// Create a database. Fails with a duplicate code if it exists.
    async fn create_database(&self, name: &str) -> Result<()>;

    /// Drop a database and everything in it. Fails with an undefined code if absent.
    async fn drop_database(&self, name: &str) -> Result<()>;

    /// Check whether a table exists in a database.
    async fn table_exists(&self, database: &str, table: &str) -> Result<bool>;

    /// Column names of a table, in definition order.
    async fn columns(&self, database: &str, table: &str) -> Result<Vec<String>>;

    /// Reserve a fresh row key without inserting a record.
    async fn reserve_key(&self, database: &str, table: &str) -> Result<RowKey>;

    /// Ping the backend, bounded by `timeout`.
    async fn is_valid(&self, timeout: Duration) -> bool;

    /// Close the connection. Further calls fail with a connection error.
    async fn close(&self) -> Result<()>;
}

/// Opens drivers for a session.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one physical connection.
    async fn connect(&self, config: &SessionConfig) -> Result<Arc<dyn Driver>>;
}

/// Pick the connector matching a configuration's backend.
pub fn connector_for(config: &SessionConfig) -> Arc<dyn Connector> {
    match config.backend {
        Backend::Postgres => Arc::new(PostgresConnector),
        Backend::Sqlite { .. } => Arc::new(SqliteConnector),
    }
}
