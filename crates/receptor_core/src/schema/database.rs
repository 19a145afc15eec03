//! Databases: named containers of tables, owned by a session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::schema::{validate_identifier, Registry, Table};
use crate::session::{Session, SessionInner};
use crate::task::Deferred;

pub(crate) struct DatabaseInner {
    name: String,
    session: Weak<SessionInner>,
    runtime: Handle,
    loaded: AtomicBool,
    tables: Registry<String, Table>,
}

/// A database (PostgreSQL schema, SQLite attached database).
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Database {}

impl Database {
    pub(crate) fn new(session: &Session, name: &str) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                name: name.to_string(),
                session: session.downgrade(),
                runtime: session.runtime().clone(),
                loaded: AtomicBool::new(false),
                tables: Registry::new("table"),
            }),
        }
    }

    /// Get the database name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Check if the database is started.
    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::Acquire)
    }

    /// The owning session, while it is alive.
    pub fn session(&self) -> Result<Session> {
        self.inner
            .session
            .upgrade()
            .map(Session::from_inner)
            .ok_or_else(|| Error::state(format!("session of database '{}' was dropped", self.name())))
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub(crate) fn driver(&self) -> Result<Arc<dyn Driver>> {
        self.session()?.driver()
    }

    pub(crate) fn mark_discovered(&self) {
        self.inner.loaded.store(true, Ordering::Release);
    }

    /// Loaded tables.
    pub fn tables(&self) -> Vec<Table> {
        self.inner.tables.values()
    }

    /// Get the loaded table called `name`, or a new unloaded handle.
    pub fn table(&self, name: &str) -> Result<Table> {
        if let Some(table) = self.inner.tables.get(name) {
            return Ok(table);
        }
        validate_identifier(name)?;
        Ok(Table::new(self, name))
    }

    pub(crate) fn register_table(&self, table: &Table) -> Result<()> {
        self.inner.tables.insert(table.name().to_string(), table.clone())
    }

    pub(crate) fn unregister_table(&self, table: &Table) {
        self.inner.tables.remove(table.name(), table);
    }

    // ========== Lifecycle ==========

    /// Create the backing database if needed and register it with the session.
    pub fn start(&self) -> Deferred<()> {
        if self.is_loaded() {
            return Deferred::failed("database.start", self.already_loaded());
        }
        let this = self.clone();
        Deferred::spawn(self.runtime(), "database.start", async move { this.start_inner().await })
    }

    /// Stop every loaded table, then unregister.
    pub fn stop(&self) -> Deferred<()> {
        if !self.is_loaded() {
            return Deferred::failed("database.stop", self.not_loaded());
        }
        let this = self.clone();
        Deferred::spawn(self.runtime(), "database.stop", async move { this.stop_inner().await })
    }

    /// Create the backing database. Resolves to `false` when it already existed.
    pub fn create(&self) -> Deferred<bool> {
        let this = self.clone();
        Deferred::spawn(self.runtime(), "database.create", async move {
            let driver = this.driver()?;
            match driver.create_database(this.name()).await {
                Ok(()) => Ok(true),
                Err(e) if e.is_duplicate_object() => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Stop (if loaded) and drop the backing database with all its tables.
    /// Resolves to `false` when it did not exist.
    pub fn delete(&self) -> Deferred<bool> {
        let this = self.clone();
        Deferred::spawn(self.runtime(), "database.delete", async move {
            if this.is_loaded() {
                this.stop_inner().await?;
            }
            let driver = this.driver()?;
            match driver.drop_database(this.name()).await {
                Ok(()) => {
                    tracing::info!(database = this.name(), "Database dropped");
                    Ok(true)
                }
                Err(e) if e.is_undefined_object() => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Check whether the backing database exists.
    pub fn exists(&self) -> Deferred<bool> {
        let this = self.clone();
        Deferred::spawn(self.runtime(), "database.exists", async move { this.exists_inner().await })
    }

    pub(crate) async fn exists_inner(&self) -> Result<bool> {
        let names = self.driver()?.databases().await?;
        Ok(names.iter().any(|n| n == self.name()))
    }

    async fn start_inner(&self) -> Result<()> {
        if self.is_loaded() {
            return Err(self.already_loaded());
        }
        let session = self.session()?;
        // Fails with the recorded reconnect failure when there is one.
        let driver = session.driver()?;
        tracing::debug!(session_id = %session.id(), database = self.name(), "Starting database");

        match driver.create_database(self.name()).await {
            Ok(()) => tracing::info!(database = self.name(), "Database created"),
            Err(e) if e.is_duplicate_object() => {}
            Err(e) => return Err(e),
        }

        session.register_database(self)?;
        self.inner.loaded.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) async fn stop_inner(&self) -> Result<()> {
        if !self.is_loaded() {
            return Err(self.not_loaded());
        }
        tracing::debug!(database = self.name(), "Stopping database");

        let mut first_error = None;
        for table in self.inner.tables.values() {
            if let Err(e) = table.stop_inner().await {
                tracing::warn!(database = self.name(), table = table.name(), error = %e, "Table did not stop cleanly");
                table.discard();
                first_error.get_or_insert(e);
            }
        }

        if let Ok(session) = self.session() {
            session.unregister_database(self);
        }
        self.inner.loaded.store(false, Ordering::Release);
        first_error.map_or(Ok(()), Err)
    }

    /// Forget all loaded state without touching the backend.
    pub(crate) fn discard(&self) {
        for table in self.inner.tables.drain() {
            table.discard();
        }
        if let Ok(session) = self.session() {
            session.unregister_database(self);
        }
        self.inner.loaded.store(false, Ordering::Release);
    }

    fn already_loaded(&self) -> Error {
        Error::state(format!("database '{}' is already loaded", self.name()))
    }

    pub(crate) fn not_loaded(&self) -> Error {
        Error::state(format!("database '{}' is not loaded", self.name()))
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("loaded", &self.is_loaded())
            .field("tables", &self.inner.tables.len())
            .finish()
    }
}
