//! Equality conditions and table-wide row operations.
//!
//! Conditions AND-combine into a parameterized WHERE clause. Bulk updates and
//! deletes keep already-loaded rows consistent: matches are found by scanning
//! the cache (not by re-querying), then patched in place or evicted.

use futures_util::future::try_join_all;

use crate::driver::Dialect;
use crate::error::{Error, Result};
use crate::models::{RowKey, Value};
use crate::schema::{Row, Table, Variable};
use crate::task::Deferred;

/// An equality constraint on one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    variable: Variable,
    value: Value,
}

impl Condition {
    /// `variable = value`, with `value` converted through the variable's type.
    ///
    /// A NULL value is accepted but never matches anything.
    pub fn of(variable: &Variable, value: impl Into<Value>) -> Result<Self> {
        let value = variable.ty().convert(value.into())?;
        Ok(Self { variable: variable.clone(), value })
    }

    /// Get the constrained variable.
    pub fn variable(&self) -> &Variable {
        &self.variable
    }

    /// Get the required value.
    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// A rendered WHERE clause and its parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereClause {
    sql: String,
    params: Vec<Value>,
}

impl WhereClause {
    /// Render `conditions` plus an optional key exclusion.
    ///
    /// Placeholders are numbered from `first_placeholder`. The SQL is empty
    /// when there is nothing to filter on, otherwise it starts with `" WHERE "`.
    pub fn build(
        dialect: Dialect,
        conditions: &[Condition],
        excluded: &[RowKey],
        first_placeholder: usize,
    ) -> Self {
        let mut terms = Vec::with_capacity(conditions.len() + 1);
        let mut params = Vec::with_capacity(conditions.len());
        for (i, condition) in conditions.iter().enumerate() {
            terms.push(format!(
                "{} = {}",
                dialect.quote(condition.variable.column()),
                dialect.placeholder(first_placeholder + i)
            ));
            params.push(condition.value.clone());
        }
        if let Some(exclusion) = dialect.key_exclusion(excluded) {
            terms.push(exclusion);
        }

        if terms.is_empty() {
            return Self::default();
        }
        Self { sql: format!(" WHERE {}", terms.join(" AND ")), params }
    }

    /// Get the SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Get the parameters, in placeholder order.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Consume into the parameters.
    pub fn into_params(self) -> Vec<Value> {
        self.params
    }
}

impl Table {
    fn check_conditions(&self, conditions: &[Condition]) -> Result<()> {
        self.require_loaded()?;
        for condition in conditions {
            let variable = condition.variable();
            if variable.table() != self {
                return Err(Error::state(format!(
                    "condition on '{}' belongs to table '{}', not '{}'",
                    variable.id(),
                    variable.table().name(),
                    self.name()
                )));
            }
            variable.require_loaded()?;
        }
        Ok(())
    }

    fn check_target(&self, variable: &Variable, value: Value) -> Result<Value> {
        if variable.table() != self {
            return Err(Error::state(format!(
                "variable '{}' belongs to table '{}', not '{}'",
                variable.id(),
                variable.table().name(),
                self.name()
            )));
        }
        variable.require_loaded()?;
        variable.validate(value)
    }

    /// Reserve a fresh key and return an unloaded row for it. Nothing is
    /// inserted until the row is started, saved or created.
    pub fn create_row(&self) -> Deferred<Row> {
        if let Err(e) = self.require_loaded() {
            return Deferred::failed("table.create_row", e);
        }
        let this = self.clone();
        Deferred::spawn(self.runtime(), "table.create_row", async move {
            let key = this.driver()?.reserve_key(this.database().name(), this.name()).await?;
            tracing::debug!(table = this.name(), row = %key, "Reserved row key");
            Ok(this.row(key))
        })
    }

    /// Load every row matching all `conditions` (all rows when empty).
    /// Already-loaded rows are returned as they are.
    pub fn retrieve(&self, conditions: &[Condition]) -> Deferred<Vec<Row>> {
        if let Err(e) = self.check_conditions(conditions) {
            return Deferred::failed("table.retrieve", e);
        }
        let this = self.clone();
        let conditions = conditions.to_vec();
        Deferred::spawn(self.runtime(), "table.retrieve", async move {
            let driver = this.driver()?;
            let dialect = driver.dialect();
            let clause = WhereClause::build(dialect, &conditions, &[], 1);
            let sql = dialect.select_keys(this.database().name(), this.name(), clause.sql());
            let records = driver.query(&sql, clause.params()).await?;

            let keys = records
                .iter()
                .filter_map(|r| r.get_index(0).cloned())
                .map(|v| i64::try_from(v).map(RowKey))
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!(table = this.name(), matched = keys.len(), "Retrieving rows");

            let loads = keys.into_iter().map(|key| {
                let table = this.clone();
                async move {
                    if let Some(row) = table.loaded_row(key) {
                        return Ok(row);
                    }
                    let row = table.row(key);
                    match row.start_inner().await {
                        Ok(()) => Ok(row),
                        // Loaded concurrently by someone else.
                        Err(e) if e.is_state() => table.loaded_row(key).ok_or(e),
                        Err(e) => Err(e),
                    }
                }
            });
            try_join_all(loads).await
        })
    }

    /// Count the rows matching all `conditions`.
    pub fn count(&self, conditions: &[Condition]) -> Deferred<u64> {
        if let Err(e) = self.check_conditions(conditions) {
            return Deferred::failed("table.count", e);
        }
        let this = self.clone();
        let conditions = conditions.to_vec();
        Deferred::spawn(self.runtime(), "table.count", async move {
            let driver = this.driver()?;
            let dialect = driver.dialect();
            let clause = WhereClause::build(dialect, &conditions, &[], 1);
            let sql = dialect.count(this.database().name(), this.name(), clause.sql());
            let records = driver.query(&sql, clause.params()).await?;
            let count = records.first().and_then(|r| r.get_index(0).cloned()).unwrap_or(Value::Int(0));
            Ok(u64::try_from(i64::try_from(count)?).unwrap_or(0))
        })
    }

    /// Set `variable` to `value` on every row matching all `conditions`, in
    /// the store and in matching loaded rows. Resolves to the affected count.
    pub fn set_where(
        &self,
        variable: &Variable,
        value: impl Into<Value>,
        conditions: &[Condition],
    ) -> Deferred<u64> {
        let prepared = self
            .check_conditions(conditions)
            .and_then(|()| self.check_target(variable, value.into()));
        let value = match prepared {
            Ok(value) => value,
            Err(e) => return Deferred::failed("table.set_where", e),
        };
        let this = self.clone();
        let variable = variable.clone();
        let conditions = conditions.to_vec();
        Deferred::spawn(self.runtime(), "table.set_where", async move {
            let matching: Vec<Row> = this.rows().into_iter().filter(|r| r.matches(&conditions)).collect();

            let driver = this.driver()?;
            let dialect = driver.dialect();
            let clause = WhereClause::build(dialect, &conditions, &[], 2);
            let sql = dialect.update_column(
                this.database().name(),
                this.name(),
                variable.column(),
                clause.sql(),
            );
            let mut params = vec![value.clone()];
            params.extend(clause.into_params());
            let affected = driver.execute(&sql, &params).await?;

            for row in &matching {
                row.put(variable.column(), value.clone());
            }
            tracing::debug!(
                table = this.name(),
                variable = variable.id(),
                affected,
                cached = matching.len(),
                "Bulk update applied"
            );
            Ok(affected)
        })
    }

    /// Set `variable` to `value` on the row with `key`, in the store and in
    /// the loaded row if any. Resolves to whether a record was updated.
    pub fn set_row(&self, key: RowKey, variable: &Variable, value: impl Into<Value>) -> Deferred<bool> {
        let prepared = self.require_loaded().and_then(|()| self.check_target(variable, value.into()));
        let value = match prepared {
            Ok(value) => value,
            Err(e) => return Deferred::failed("table.set_row", e),
        };
        let this = self.clone();
        let variable = variable.clone();
        Deferred::spawn(self.runtime(), "table.set_row", async move {
            let driver = this.driver()?;
            let dialect = driver.dialect();
            let sql = dialect.update_column(
                this.database().name(),
                this.name(),
                variable.column(),
                &dialect.key_filter(2),
            );
            let affected = driver.execute(&sql, &[value.clone(), key.into()]).await?;
            if let Some(row) = this.loaded_row(key) {
                row.put(variable.column(), value);
            }
            Ok(affected > 0)
        })
    }

    /// Delete every row matching all `conditions`. Matching loaded rows are
    /// evicted without saving. Resolves to the deleted count.
    pub fn delete_where(&self, conditions: &[Condition]) -> Deferred<u64> {
        if let Err(e) = self.check_conditions(conditions) {
            return Deferred::failed("table.delete_where", e);
        }
        let this = self.clone();
        let conditions = conditions.to_vec();
        Deferred::spawn(self.runtime(), "table.delete_where", async move {
            let matching: Vec<Row> = this.rows().into_iter().filter(|r| r.matches(&conditions)).collect();

            let driver = this.driver()?;
            let dialect = driver.dialect();
            let clause = WhereClause::build(dialect, &conditions, &[], 1);
            let sql = dialect.delete(this.database().name(), this.name(), clause.sql());
            let deleted = driver.execute(&sql, clause.params()).await?;

            for row in &matching {
                row.evict();
            }
            tracing::debug!(table = this.name(), deleted, evicted = matching.len(), "Bulk delete applied");
            Ok(deleted)
        })
    }

    /// Delete the row with `key`, evicting it first when loaded. Resolves to
    /// whether a record was deleted.
    pub fn delete_row(&self, key: RowKey) -> Deferred<bool> {
        match self.loaded_row(key) {
            Some(row) => row.delete(),
            None => self.row(key).delete(),
        }
    }

    /// Read one stored value straight from the backend, bypassing the cache.
    /// Resolves to `None` when the record does not exist.
    pub fn fetch_value(&self, variable: &Variable, key: RowKey) -> Deferred<Option<Value>> {
        if variable.table() != self {
            return Deferred::failed(
                "table.fetch_value",
                Error::state(format!(
                    "variable '{}' belongs to table '{}', not '{}'",
                    variable.id(),
                    variable.table().name(),
                    self.name()
                )),
            );
        }
        let this = self.clone();
        let variable = variable.clone();
        Deferred::spawn(self.runtime(), "table.fetch_value", async move {
            let driver = this.driver()?;
            let sql =
                driver.dialect().select_value(this.database().name(), this.name(), variable.column());
            let records = driver.query(&sql, &[key.into()]).await?;
            match records.into_iter().next().and_then(|r| r.get_index(0).cloned()) {
                Some(raw) => Ok(Some(variable.validate(raw)?)),
                None => Ok(None),
            }
        })
    }
}
