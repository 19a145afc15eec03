//! Variables: typed columns of a table.
//!
//! Starting a variable adds its column when missing, brings the store up to
//! date, and only then reconciles the cache of every loaded row in the table.
//! Stopping only unregisters it; loaded rows keep whatever value they last
//! cached.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::driver::{Driver, ROW_COLUMN};
use crate::error::{Error, Result};
use crate::models::{RowKey, Value, VariableType};
use crate::schema::{validate_identifier, Row, Table};
use crate::task::Deferred;

struct VariableInner {
    id: String,
    /// Lowercased id; the backing column name and registry key.
    column: String,
    ty: VariableType,
    default: Value,
    nullable: bool,
    table: Table,
    loaded: AtomicBool,
    is_new: AtomicBool,
}

/// A typed column of a table.
#[derive(Clone)]
pub struct Variable {
    inner: Arc<VariableInner>,
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Variable {}

impl Variable {
    /// Create a nullable variable of `table`.
    pub fn new(table: &Table, id: &str, ty: VariableType, default: impl Into<Value>) -> Result<Self> {
        Self::with_nullable(table, id, ty, default, true)
    }

    /// Create a variable with explicit nullability.
    ///
    /// The default must be non-null unless the variable is nullable, and must
    /// convert through `ty`.
    pub fn with_nullable(
        table: &Table,
        id: &str,
        ty: VariableType,
        default: impl Into<Value>,
        nullable: bool,
    ) -> Result<Self> {
        validate_identifier(id)?;
        if id.eq_ignore_ascii_case(ROW_COLUMN) {
            return Err(Error::invalid_name(id, "reserved for the row identity column"));
        }
        let default = default.into();
        if default.is_null() && !nullable {
            return Err(Error::invalid_value(format!(
                "variable '{id}' is not nullable and needs a non-null default"
            )));
        }
        let default = ty.convert(default)?;

        Ok(Self {
            inner: Arc::new(VariableInner {
                id: id.to_string(),
                column: id.to_ascii_lowercase(),
                ty,
                default,
                nullable,
                table: table.clone(),
                loaded: AtomicBool::new(false),
                is_new: AtomicBool::new(false),
            }),
        })
    }

    /// Get the variable id as given.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Backing column name.
    pub fn column(&self) -> &str {
        &self.inner.column
    }

    /// Get the variable type.
    pub fn ty(&self) -> VariableType {
        self.inner.ty
    }

    /// Get the default value.
    pub fn default(&self) -> &Value {
        &self.inner.default
    }

    /// Check if NULL is an accepted value.
    pub fn is_nullable(&self) -> bool {
        self.inner.nullable
    }

    /// Get the owning table.
    pub fn table(&self) -> &Table {
        &self.inner.table
    }

    /// Check if the variable is started.
    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::Acquire)
    }

    /// Whether the column did not exist at the last start.
    pub fn is_new(&self) -> bool {
        self.inner.is_new.load(Ordering::Acquire)
    }

    /// Check `value` against nullability and convert it through the type.
    pub fn validate(&self, value: Value) -> Result<Value> {
        if value.is_null() {
            if self.inner.nullable {
                return Ok(Value::Null);
            }
            return Err(Error::invalid_value(format!("variable '{}' is not nullable", self.id())));
        }
        self.inner.ty.convert(value)
    }

    /// Convert a stored value for caching, falling back to the default.
    pub(crate) fn adopt(&self, raw: Value) -> Value {
        self.settle_stored(raw).0
    }

    /// Like [`Variable::adopt`], also reporting whether the default replaced
    /// the stored value.
    pub(crate) fn settle_stored(&self, raw: Value) -> (Value, bool) {
        match self.validate(raw) {
            Ok(value) => (value, false),
            Err(e) => {
                tracing::warn!(
                    table = self.table().name(),
                    variable = self.id(),
                    error = %e,
                    "Stored value does not fit variable, using default"
                );
                (self.default().clone(), true)
            }
        }
    }

    pub(crate) fn require_loaded(&self) -> Result<()> {
        if self.is_loaded() {
            Ok(())
        } else {
            Err(self.not_loaded())
        }
    }

    fn not_loaded(&self) -> Error {
        Error::state(format!("variable '{}' is not loaded", self.id()))
    }

    // ========== Lifecycle ==========

    /// Add the column if missing, bring the store up to date, then register
    /// and settle the cache of every loaded row.
    pub fn start(&self) -> Deferred<()> {
        if self.is_loaded() {
            return Deferred::failed("variable.start", self.already_loaded());
        }
        let this = self.clone();
        Deferred::spawn(self.table().runtime(), "variable.start", async move {
            this.start_inner().await
        })
    }

    /// Unregister. Loaded rows keep their cached values.
    pub fn stop(&self) -> Deferred<()> {
        if !self.is_loaded() {
            return Deferred::failed("variable.stop", self.not_loaded());
        }
        let this = self.clone();
        Deferred::spawn(self.table().runtime(), "variable.stop", async move {
            this.stop_inner().await
        })
    }

    /// Stop (if loaded) and drop the column. Resolves to `false` when the
    /// column did not exist.
    pub fn delete(&self) -> Deferred<bool> {
        let this = self.clone();
        Deferred::spawn(self.table().runtime(), "variable.delete", async move {
            if this.is_loaded() {
                this.stop_inner().await?;
            }
            let table = this.table();
            let driver = table.driver()?;
            let sql = driver.dialect().drop_column(table.database().name(), table.name(), this.column());
            match driver.execute(&sql, &[]).await {
                Ok(_) => {
                    tracing::info!(table = table.name(), variable = this.id(), "Column dropped");
                    Ok(true)
                }
                Err(e) if e.is_undefined_object() => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Check whether the backing column exists.
    pub fn exists(&self) -> Deferred<bool> {
        let this = self.clone();
        Deferred::spawn(self.table().runtime(), "variable.exists", async move {
            let table = this.table();
            if !table.exists_inner().await? {
                return Ok(false);
            }
            let columns = table.driver()?.columns(table.database().name(), table.name()).await?;
            Ok(columns.iter().any(|c| c.eq_ignore_ascii_case(this.column())))
        })
    }

    pub(crate) async fn start_inner(&self) -> Result<()> {
        if self.is_loaded() {
            return Err(self.already_loaded());
        }
        let table = self.table();
        table.require_loaded()?;
        if table.variable(self.column()).is_some() {
            return Err(Error::state(format!("variable '{}' is already loaded", self.column())));
        }
        let database = table.database();
        let driver = table.driver()?;
        let dialect = driver.dialect();
        tracing::debug!(table = table.name(), variable = self.id(), "Starting variable");

        let columns = driver.columns(database.name(), table.name()).await?;
        let column_is_new = !columns.iter().any(|c| c.eq_ignore_ascii_case(self.column()));

        if column_is_new {
            let sql = dialect.add_column(
                database.name(),
                table.name(),
                self.column(),
                &self.inner.ty,
                &self.inner.default,
                self.inner.nullable,
            )?;
            match driver.execute(&sql, &[]).await {
                Ok(_) => tracing::info!(table = table.name(), variable = self.id(), "Column added"),
                Err(e) if e.is_duplicate_object() => {}
                Err(e) => return Err(e),
            }
        }

        let settled: Vec<(Row, Value, bool)> = table
            .rows()
            .into_iter()
            .map(|row| {
                let (value, persist) = row.settle(self, column_is_new);
                (row, value, persist)
            })
            .collect();
        let known: HashSet<RowKey> = settled.iter().map(|(row, ..)| row.key()).collect();

        // Store writes come first so a failure leaves every cache untouched.
        if column_is_new {
            let keys: Vec<RowKey> = known.iter().copied().collect();
            let filter =
                dialect.key_exclusion(&keys).map(|c| format!(" WHERE {c}")).unwrap_or_default();
            let sql = dialect.update_column(database.name(), table.name(), self.column(), &filter);
            driver.execute(&sql, &[self.inner.default.clone()]).await?;
        }
        let stale_keys: Vec<RowKey> =
            settled.iter().filter(|(_, _, persist)| *persist).map(|(row, ..)| row.key()).collect();
        self.write_default(&driver, &stale_keys).await?;

        table.register_variable(self)?;
        self.inner.is_new.store(column_is_new, Ordering::Release);
        for (row, value, _) in settled {
            row.apply_settled(self.column(), value);
        }

        // Rows loaded while the store was being updated never saw this variable.
        let mut late_keys = Vec::new();
        for row in table.rows().into_iter().filter(|r| !known.contains(&r.key())) {
            let (value, persist) = row.settle(self, column_is_new);
            if persist {
                late_keys.push(row.key());
            }
            row.apply_settled(self.column(), value);
        }
        if let Err(e) = self.write_default(&driver, &late_keys).await {
            tracing::warn!(table = table.name(), variable = self.id(), error = %e, "Late rows keep a stale default");
        }

        self.inner.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Write the default into the records with `keys`.
    async fn write_default(&self, driver: &Arc<dyn Driver>, keys: &[RowKey]) -> Result<u64> {
        let dialect = driver.dialect();
        let Some(inclusion) = dialect.key_inclusion(keys) else {
            return Ok(0);
        };
        let table = self.table();
        let sql = dialect.update_column(
            table.database().name(),
            table.name(),
            self.column(),
            &format!(" WHERE {inclusion}"),
        );
        driver.execute(&sql, &[self.inner.default.clone()]).await
    }

    pub(crate) async fn stop_inner(&self) -> Result<()> {
        if !self.is_loaded() {
            return Err(self.not_loaded());
        }
        tracing::debug!(table = self.table().name(), variable = self.id(), "Stopping variable");
        self.table().unregister_variable(self);
        self.inner.loaded.store(false, Ordering::Release);
        Ok(())
    }

    pub(crate) fn discard(&self) {
        self.table().unregister_variable(self);
        self.inner.loaded.store(false, Ordering::Release);
    }

    fn already_loaded(&self) -> Error {
        Error::state(format!("variable '{}' is already loaded", self.id()))
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("table", &self.inner.table.name())
            .field("id", &self.inner.id)
            .field("type", &self.inner.ty)
            .field("default", &self.inner.default)
            .field("nullable", &self.inner.nullable)
            .field("loaded", &self.is_loaded())
            .field("is_new", &self.is_new())
            .finish()
    }
}
