//! Switchable failures around the SQLite driver, for exercising the health
//! check, reconnects and partial store failures.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::driver::{Connector, Dialect, Driver, Record, SqliteConnector};
use crate::error::{Error, Result};
use crate::models::{BackendVersion, RowKey, SessionConfig, Value};

/// Shared switches, flipped by tests while a session runs.
#[derive(Debug)]
pub(crate) struct Faults {
    /// When false every ping fails.
    pub healthy: AtomicBool,
    /// When true new connections are refused.
    pub refuse_connect: AtomicBool,
    /// When true every `UPDATE` statement fails.
    pub reject_updates: AtomicBool,
    /// Connection attempts so far, refused ones included.
    pub connects: AtomicUsize,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            refuse_connect: AtomicBool::new(false),
            reject_updates: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }
    }
}

impl Faults {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// Opens in-memory SQLite drivers subject to [`Faults`].
pub(crate) struct FaultyConnector {
    faults: Arc<Faults>,
}

impl FaultyConnector {
    pub fn new() -> (Arc<Self>, Arc<Faults>) {
        let faults = Arc::new(Faults::default());
        (Arc::new(Self { faults: Arc::clone(&faults) }), faults)
    }
}

#[async_trait]
impl Connector for FaultyConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Arc<dyn Driver>> {
        self.faults.connects.fetch_add(1, Ordering::SeqCst);
        if self.faults.refuse_connect.load(Ordering::SeqCst) {
            return Err(Error::connection("connection refused"));
        }
        let inner = SqliteConnector.connect(config).await?;
        Ok(Arc::new(FaultyDriver { inner, faults: Arc::clone(&self.faults) }))
    }
}

struct FaultyDriver {
    inner: Arc<dyn Driver>,
    faults: Arc<Faults>,
}

#[async_trait]
impl Driver for FaultyDriver {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn name(&self) -> &'static str {
        "faulty"
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        if self.faults.reject_updates.load(Ordering::SeqCst) && sql.starts_with("UPDATE") {
            return Err(Error::query("write rejected", None));
        }
        self.inner.execute(sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        self.inner.query(sql, params).await
    }

    async fn version(&self) -> Result<BackendVersion> {
        self.inner.version().await
    }

    async fn databases(&self) -> Result<Vec<String>> {
        self.inner.databases().await
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.inner.create_database(name).await
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.inner.drop_database(name).await
    }

    async fn table_exists(&self, database: &str, table: &str) -> Result<bool> {
        self.inner.table_exists(database, table).await
    }

    async fn columns(&self, database: &str, table: &str) -> Result<Vec<String>> {
        self.inner.columns(database, table).await
    }

    async fn reserve_key(&self, database: &str, table: &str) -> Result<RowKey> {
        self.inner.reserve_key(database, table).await
    }

    async fn is_valid(&self, timeout: Duration) -> bool {
        self.faults.healthy.load(Ordering::SeqCst) && self.inner.is_valid(timeout).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
