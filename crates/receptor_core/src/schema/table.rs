//! Tables: one backing table per handle, owning loaded variables and rows.
//!
//! Bulk row operations (`retrieve`, `count`, `set_where`, ...) live in
//! [`crate::query`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::models::{RowKey, Value, VariableType};
use crate::schema::{Database, Registry, Row, Variable};
use crate::task::Deferred;

/// A variable the table starts automatically.
#[derive(Debug, Clone)]
struct DefaultVariable {
    id: String,
    ty: VariableType,
    default: Value,
    nullable: bool,
}

pub(crate) struct TableInner {
    name: String,
    database: Database,
    loaded: AtomicBool,
    variables: Registry<String, Variable>,
    rows: Registry<RowKey, Row>,
    defaults: Mutex<Vec<DefaultVariable>>,
}

/// A table handle.
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Table {}

impl Table {
    pub(crate) fn new(database: &Database, name: &str) -> Self {
        Self {
            inner: Arc::new(TableInner {
                name: name.to_string(),
                database: database.clone(),
                loaded: AtomicBool::new(false),
                variables: Registry::new("variable"),
                rows: Registry::new("row"),
                defaults: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Get the table name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the owning database.
    pub fn database(&self) -> &Database {
        &self.inner.database
    }

    /// Check if the table is started.
    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::Acquire)
    }

    pub(crate) fn driver(&self) -> Result<Arc<dyn Driver>> {
        self.inner.database.driver()
    }

    pub(crate) fn runtime(&self) -> &tokio::runtime::Handle {
        self.inner.database.runtime()
    }

    // ========== Children ==========

    /// Loaded variables.
    pub fn variables(&self) -> Vec<Variable> {
        self.inner.variables.values()
    }

    /// Get the loaded variable called `id` (case-insensitive).
    pub fn variable(&self, id: &str) -> Option<Variable> {
        self.inner.variables.get(id.to_ascii_lowercase().as_str())
    }

    pub(crate) fn register_variable(&self, variable: &Variable) -> Result<()> {
        self.inner.variables.insert(variable.column().to_string(), variable.clone())
    }

    pub(crate) fn unregister_variable(&self, variable: &Variable) {
        self.inner.variables.remove(variable.column(), variable);
    }

    /// Loaded rows.
    pub fn rows(&self) -> Vec<Row> {
        self.inner.rows.values()
    }

    /// Keys of the loaded rows.
    pub fn loaded_keys(&self) -> Vec<RowKey> {
        self.inner.rows.keys()
    }

    /// Get the loaded row with `key`, or a new unloaded handle.
    pub fn row(&self, key: impl Into<RowKey>) -> Row {
        let key = key.into();
        self.inner.rows.get(&key).unwrap_or_else(|| Row::new(self, key))
    }

    pub(crate) fn loaded_row(&self, key: RowKey) -> Option<Row> {
        self.inner.rows.get(&key)
    }

    pub(crate) fn register_row(&self, row: &Row) -> Result<()> {
        self.inner.rows.insert(row.key(), row.clone())
    }

    pub(crate) fn unregister_row(&self, row: &Row) {
        self.inner.rows.remove(&row.key(), row);
    }

    /// Start `variable`'s definition automatically whenever this table starts.
    ///
    /// The table builds its own instance from the definition; fetch it with
    /// [`Table::variable`] once the table is loaded.
    pub fn add_default_variable(&self, variable: &Variable) -> Result<()> {
        if variable.table() != self {
            return Err(Error::state(format!(
                "variable '{}' belongs to table '{}', not '{}'",
                variable.id(),
                variable.table().name(),
                self.name()
            )));
        }
        let mut defaults = self.inner.defaults.lock();
        if defaults.iter().any(|d| d.id.eq_ignore_ascii_case(variable.id())) {
            return Err(Error::state(format!(
                "'{}' is already a default variable of '{}'",
                variable.id(),
                self.name()
            )));
        }
        defaults.push(DefaultVariable {
            id: variable.id().to_string(),
            ty: variable.ty(),
            default: variable.default().clone(),
            nullable: variable.is_nullable(),
        });
        Ok(())
    }

    /// Ids of the default variables.
    pub fn default_variables(&self) -> Vec<String> {
        self.inner.defaults.lock().iter().map(|d| d.id.clone()).collect()
    }

    // ========== Lifecycle ==========

    /// Create the backing table if needed, register, then start the default
    /// variables.
    pub fn start(&self) -> Deferred<()> {
        if self.is_loaded() {
            return Deferred::failed("table.start", self.already_loaded());
        }
        let this = self.clone();
        Deferred::spawn(self.runtime(), "table.start", async move { this.start_inner().await })
    }

    /// Save and stop every loaded row, stop every loaded variable, then
    /// unregister.
    pub fn stop(&self) -> Deferred<()> {
        if !self.is_loaded() {
            return Deferred::failed("table.stop", self.not_loaded());
        }
        let this = self.clone();
        Deferred::spawn(self.runtime(), "table.stop", async move { this.stop_inner().await })
    }

    /// Create the backing table. Resolves to `false` when it already existed.
    pub fn create(&self) -> Deferred<bool> {
        let this = self.clone();
        Deferred::spawn(self.runtime(), "table.create", async move {
            let driver = this.driver()?;
            let sql = driver.dialect().create_table(this.database().name(), this.name());
            match driver.execute(&sql, &[]).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_duplicate_object() => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Stop (if loaded) and drop the backing table. Resolves to `false` when it
    /// did not exist.
    pub fn delete(&self) -> Deferred<bool> {
        let this = self.clone();
        Deferred::spawn(self.runtime(), "table.delete", async move {
            if this.is_loaded() {
                this.stop_inner().await?;
            }
            let driver = this.driver()?;
            let sql = driver.dialect().drop_table(this.database().name(), this.name());
            match driver.execute(&sql, &[]).await {
                Ok(_) => {
                    tracing::info!(database = this.database().name(), table = this.name(), "Table dropped");
                    Ok(true)
                }
                Err(e) if e.is_undefined_object() => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Check whether the backing table exists.
    pub fn exists(&self) -> Deferred<bool> {
        let this = self.clone();
        Deferred::spawn(self.runtime(), "table.exists", async move { this.exists_inner().await })
    }

    pub(crate) async fn exists_inner(&self) -> Result<bool> {
        if !self.database().exists_inner().await? {
            return Ok(false);
        }
        self.driver()?.table_exists(self.database().name(), self.name()).await
    }

    pub(crate) async fn start_inner(&self) -> Result<()> {
        if self.is_loaded() {
            return Err(self.already_loaded());
        }
        let database = self.database();
        if !database.is_loaded() {
            return Err(database.not_loaded());
        }
        let driver = self.driver()?;
        tracing::debug!(database = database.name(), table = self.name(), "Starting table");

        let sql = driver.dialect().create_table(database.name(), self.name());
        match driver.execute(&sql, &[]).await {
            Ok(_) => tracing::info!(database = database.name(), table = self.name(), "Table created"),
            Err(e) if e.is_duplicate_object() => {}
            Err(e) => return Err(e),
        }

        database.register_table(self)?;
        self.inner.loaded.store(true, Ordering::Release);

        let defaults = self.inner.defaults.lock().clone();
        for def in defaults {
            if self.variable(&def.id).is_some() {
                continue;
            }
            let started = async {
                let variable =
                    Variable::with_nullable(self, &def.id, def.ty, def.default.clone(), def.nullable)?;
                variable.start_inner().await
            }
            .await;
            if let Err(e) = started {
                tracing::warn!(
                    table = self.name(),
                    variable = %def.id,
                    error = %e,
                    "Default variable failed to start"
                );
                if let Err(stop_err) = self.stop_inner().await {
                    tracing::warn!(table = self.name(), error = %stop_err, "Table did not stop cleanly");
                    self.discard();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) async fn stop_inner(&self) -> Result<()> {
        if !self.is_loaded() {
            return Err(self.not_loaded());
        }
        tracing::debug!(database = self.database().name(), table = self.name(), "Stopping table");

        let mut first_error = None;
        for row in self.inner.rows.values() {
            if let Err(e) = row.stop_inner(true).await {
                tracing::warn!(table = self.name(), row = %row.key(), error = %e, "Row was not saved");
                row.evict();
                first_error.get_or_insert(e);
            }
        }
        for variable in self.inner.variables.values() {
            if let Err(e) = variable.stop_inner().await {
                variable.discard();
                first_error.get_or_insert(e);
            }
        }

        self.database().unregister_table(self);
        self.inner.loaded.store(false, Ordering::Release);
        first_error.map_or(Ok(()), Err)
    }

    /// Forget all loaded state without touching the backend.
    pub(crate) fn discard(&self) {
        for row in self.inner.rows.drain() {
            row.evict();
        }
        for variable in self.inner.variables.drain() {
            variable.discard();
        }
        self.database().unregister_table(self);
        self.inner.loaded.store(false, Ordering::Release);
    }

    fn already_loaded(&self) -> Error {
        Error::state(format!("table '{}' is already loaded", self.name()))
    }

    pub(crate) fn not_loaded(&self) -> Error {
        Error::state(format!("table '{}' is not loaded", self.name()))
    }

    pub(crate) fn require_loaded(&self) -> Result<()> {
        if self.is_loaded() {
            Ok(())
        } else {
            Err(self.not_loaded())
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("database", &self.inner.database.name())
            .field("name", &self.inner.name)
            .field("loaded", &self.is_loaded())
            .field("variables", &self.inner.variables.len())
            .field("rows", &self.inner.rows.len())
            .finish()
    }
}
