//! Cached rows.
//!
//! A loaded row holds one typed value per loaded variable of its table, plus
//! the raw values of columns no loaded variable claims ("orphans", keyed by
//! lowercase column name). Reads only ever hit the cache. Writes update the
//! cache first and then persist asynchronously.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{OnConflict, ROW_COLUMN};
use crate::error::{Error, Result};
use crate::models::{RowKey, Value};
use crate::query::Condition;
use crate::schema::{Table, Variable};
use crate::task::Deferred;

#[derive(Debug, Default)]
struct RowCache {
    /// Typed values keyed by variable column.
    values: HashMap<String, Value>,
    /// Raw values of columns without a loaded variable.
    orphans: HashMap<String, Value>,
}

struct RowInner {
    key: RowKey,
    table: Table,
    loaded: AtomicBool,
    is_new: AtomicBool,
    cache: Mutex<RowCache>,
}

/// A row of a table, identified by its key.
#[derive(Clone)]
pub struct Row {
    inner: Arc<RowInner>,
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Row {}

impl Row {
    pub(crate) fn new(table: &Table, key: RowKey) -> Self {
        Self {
            inner: Arc::new(RowInner {
                key,
                table: table.clone(),
                loaded: AtomicBool::new(false),
                is_new: AtomicBool::new(false),
                cache: Mutex::new(RowCache::default()),
            }),
        }
    }

    /// Get the row key.
    pub fn key(&self) -> RowKey {
        self.inner.key
    }

    /// Get the owning table.
    pub fn table(&self) -> &Table {
        &self.inner.table
    }

    /// Check if the row is cached.
    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::Acquire)
    }

    /// Whether the last start had to insert the record.
    pub fn is_new(&self) -> bool {
        self.inner.is_new.load(Ordering::Acquire)
    }

    // ========== Cache access ==========

    /// Cached value of `variable`.
    pub fn get(&self, variable: &Variable) -> Result<Value> {
        self.require_loaded()?;
        self.require_own(variable)?;
        self.inner.cache.lock().values.get(variable.column()).cloned().ok_or_else(|| {
            Error::state(format!("row {} has no value for '{}'", self.key(), variable.id()))
        })
    }

    /// Cached value of `variable`, converted to `T`.
    pub fn get_as<T>(&self, variable: &Variable) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        T::try_from(self.get(variable)?)
    }

    /// Raw value of a column no loaded variable claims.
    pub fn orphan(&self, column: &str) -> Option<Value> {
        self.inner.cache.lock().orphans.get(&column.to_ascii_lowercase()).cloned()
    }

    /// Validate and cache `value`, then persist that single column.
    pub fn set(&self, variable: &Variable, value: impl Into<Value>) -> Deferred<()> {
        let value = match self.prepare_set(variable, value.into()) {
            Ok(value) => value,
            Err(e) => return Deferred::failed("row.set", e),
        };
        self.put(variable.column(), value.clone());

        let this = self.clone();
        let variable = variable.clone();
        Deferred::spawn(self.table().runtime(), "row.set", async move {
            let table = this.table();
            let driver = table.driver()?;
            let dialect = driver.dialect();
            let sql = dialect.update_column(
                table.database().name(),
                table.name(),
                variable.column(),
                &dialect.key_filter(2),
            );
            driver.execute(&sql, &[value, this.key().into()]).await?;
            tracing::trace!(table = table.name(), row = %this.key(), variable = variable.id(), "Value persisted");
            Ok(())
        })
    }

    fn prepare_set(&self, variable: &Variable, value: Value) -> Result<Value> {
        self.require_loaded()?;
        self.require_own(variable)?;
        variable.require_loaded()?;
        variable.validate(value)
    }

    /// Check every condition against the cache. NULL never matches.
    pub fn matches(&self, conditions: &[Condition]) -> bool {
        if !self.is_loaded() {
            return false;
        }
        let cache = self.inner.cache.lock();
        conditions.iter().all(|c| {
            c.variable().table() == self.table()
                && !c.value().is_null()
                && cache.values.get(c.variable().column()) == Some(c.value())
        })
    }

    pub(crate) fn put(&self, column: &str, value: Value) {
        self.inner.cache.lock().values.insert(column.to_string(), value);
    }

    /// Decide the cached value for a variable that just started, without
    /// touching the cache.
    ///
    /// The flag is set when the stored record is not known to hold that value
    /// already, so the caller must write the default back.
    pub(crate) fn settle(&self, variable: &Variable, column_is_new: bool) -> (Value, bool) {
        let column = variable.column();
        let (orphan, stale) = {
            let cache = self.inner.cache.lock();
            (cache.orphans.get(column).cloned(), cache.values.get(column).cloned())
        };

        if column_is_new {
            // The column default already covers the stored record.
            return (variable.default().clone(), false);
        }
        if let Some(stale) = stale {
            // Restarted variable: the cache already tracked this column.
            return variable.settle_stored(stale);
        }
        if self.is_new() {
            let default = variable.default().clone();
            let persist = orphan.as_ref() != Some(&default);
            return (default, persist);
        }
        match orphan {
            Some(raw) => variable.settle_stored(raw),
            None => (variable.default().clone(), true),
        }
    }

    /// Cache a settled value, promoting away any orphan of the same column.
    pub(crate) fn apply_settled(&self, column: &str, value: Value) {
        let mut cache = self.inner.cache.lock();
        cache.orphans.remove(column);
        cache.values.insert(column.to_string(), value);
    }

    fn require_loaded(&self) -> Result<()> {
        if self.is_loaded() {
            Ok(())
        } else {
            Err(self.not_loaded())
        }
    }

    fn not_loaded(&self) -> Error {
        Error::state(format!("row {} of '{}' is not loaded", self.key(), self.table().name()))
    }

    fn require_own(&self, variable: &Variable) -> Result<()> {
        if variable.table() == self.table() {
            Ok(())
        } else {
            Err(Error::state(format!(
                "variable '{}' belongs to table '{}', not '{}'",
                variable.id(),
                variable.table().name(),
                self.table().name()
            )))
        }
    }

    // ========== Lifecycle ==========

    /// Load the record into the cache, inserting it with defaults when absent.
    pub fn start(&self) -> Deferred<()> {
        if self.is_loaded() {
            return Deferred::failed("row.start", self.already_loaded());
        }
        let this = self.clone();
        Deferred::spawn(self.table().runtime(), "row.start", async move { this.start_inner().await })
    }

    /// Optionally save, then evict from the cache.
    pub fn stop(&self, save: bool) -> Deferred<()> {
        if !self.is_loaded() {
            return Deferred::failed("row.stop", self.not_loaded());
        }
        let this = self.clone();
        Deferred::spawn(self.table().runtime(), "row.stop", async move { this.stop_inner(save).await })
    }

    /// Persist the row: upsert the cached values when loaded, otherwise
    /// insert the record with defaults if it does not exist.
    pub fn save(&self) -> Deferred<()> {
        let this = self.clone();
        Deferred::spawn(self.table().runtime(), "row.save", async move { this.save_inner().await })
    }

    /// Evict without saving, then delete the record. Resolves to whether a
    /// record was deleted.
    pub fn delete(&self) -> Deferred<bool> {
        self.evict();
        let this = self.clone();
        Deferred::spawn(self.table().runtime(), "row.delete", async move {
            let table = this.table();
            let driver = table.driver()?;
            let dialect = driver.dialect();
            let sql = dialect.delete(table.database().name(), table.name(), &dialect.key_filter(1));
            match driver.execute(&sql, &[this.key().into()]).await {
                Ok(affected) => Ok(affected > 0),
                Err(e) if e.is_undefined_object() => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Check whether the record exists in the store.
    pub fn exists(&self) -> Deferred<bool> {
        let this = self.clone();
        Deferred::spawn(self.table().runtime(), "row.exists", async move {
            let table = this.table();
            let driver = table.driver()?;
            let dialect = driver.dialect();
            let sql = dialect.count(table.database().name(), table.name(), &dialect.key_filter(1));
            match driver.query(&sql, &[this.key().into()]).await {
                Ok(records) => {
                    let count = records.first().and_then(|r| r.get_index(0).cloned());
                    Ok(i64::try_from(count.unwrap_or(Value::Int(0)))? > 0)
                }
                Err(e) if e.is_undefined_object() => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Insert the record with defaults if missing. Resolves to whether it was
    /// inserted.
    pub fn create(&self) -> Deferred<bool> {
        let this = self.clone();
        Deferred::spawn(self.table().runtime(), "row.create", async move {
            this.insert_defaults().await.map(|inserted| inserted > 0)
        })
    }

    async fn insert_defaults(&self) -> Result<u64> {
        let table = self.table();
        let driver = table.driver()?;
        let variables = table.variables();
        let columns: Vec<&str> = variables.iter().map(Variable::column).collect();
        let mut params: Vec<Value> = vec![self.key().into()];
        params.extend(variables.iter().map(|v| v.default().clone()));

        let sql = driver.dialect().insert_row(
            table.database().name(),
            table.name(),
            &columns,
            OnConflict::Ignore,
        );
        driver.execute(&sql, &params).await
    }

    pub(crate) async fn start_inner(&self) -> Result<()> {
        if self.is_loaded() {
            return Err(self.already_loaded());
        }
        let table = self.table();
        table.require_loaded()?;
        let driver = table.driver()?;
        let dialect = driver.dialect();
        tracing::debug!(table = table.name(), row = %self.key(), "Starting row");

        let select = dialect.select_row(table.database().name(), table.name());
        let mut records = driver.query(&select, &[self.key().into()]).await?;
        let mut inserted = false;
        if records.is_empty() {
            inserted = self.insert_defaults().await? > 0;
            records = driver.query(&select, &[self.key().into()]).await?;
        }
        let Some(record) = records.into_iter().next() else {
            return Err(Error::internal(format!(
                "row {} of '{}' vanished while loading",
                self.key(),
                table.name()
            )));
        };
        self.inner.is_new.store(inserted, Ordering::Release);

        {
            let mut cache = self.inner.cache.lock();
            cache.values.clear();
            cache.orphans.clear();
            for (column, raw) in record.into_pairs() {
                let column = column.to_ascii_lowercase();
                if column == ROW_COLUMN {
                    continue;
                }
                match table.variable(&column) {
                    Some(variable) => {
                        cache.values.insert(column, variable.adopt(raw));
                    }
                    None => {
                        cache.orphans.insert(column, raw);
                    }
                }
            }
            for variable in table.variables() {
                cache
                    .values
                    .entry(variable.column().to_string())
                    .or_insert_with(|| variable.default().clone());
            }
        }

        table.register_row(self)?;
        self.inner.loaded.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) async fn save_inner(&self) -> Result<()> {
        if !self.is_loaded() {
            self.insert_defaults().await?;
            return Ok(());
        }
        let table = self.table();
        let driver = table.driver()?;
        let variables = table.variables();
        let columns: Vec<&str> = variables.iter().map(Variable::column).collect();

        let mut params: Vec<Value> = vec![self.key().into()];
        {
            let cache = self.inner.cache.lock();
            params.extend(variables.iter().map(|v| {
                cache.values.get(v.column()).cloned().unwrap_or_else(|| v.default().clone())
            }));
        }

        let sql = driver.dialect().insert_row(
            table.database().name(),
            table.name(),
            &columns,
            OnConflict::Update,
        );
        driver.execute(&sql, &params).await?;
        tracing::trace!(table = table.name(), row = %self.key(), "Row saved");
        Ok(())
    }

    pub(crate) async fn stop_inner(&self, save: bool) -> Result<()> {
        self.require_loaded()?;
        if save {
            self.save_inner().await?;
        }
        self.evict();
        Ok(())
    }

    /// Drop from the cache and the table's loaded set. No backend I/O.
    pub(crate) fn evict(&self) {
        self.table().unregister_row(self);
        self.inner.loaded.store(false, Ordering::Release);
    }

    fn already_loaded(&self) -> Error {
        Error::state(format!("row {} of '{}' is already loaded", self.key(), self.table().name()))
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Row")
            .field("table", &self.inner.table.name())
            .field("key", &self.inner.key)
            .field("loaded", &self.is_loaded())
            .field("is_new", &self.is_new())
            .finish()
    }
}
