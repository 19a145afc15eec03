//! SQLite driver over one rusqlite connection.
//!
//! The main database is always in memory and never exposed. Each receptor
//! database is an attached database: `<directory>/<name>.db` when a directory
//! is configured, otherwise a private in-memory database. Calls run on the
//! blocking pool while holding the connection lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection};

use crate::driver::{Connector, Dialect, Driver, Record, ROW_COLUMN};
use crate::error::{Error, Result};
use crate::models::{Backend, BackendVersion, RowKey, SessionConfig, Value};

const DIALECT: Dialect = Dialect::Sqlite;

/// Opens [`SqliteDriver`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteConnector;

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Arc<dyn Driver>> {
        let Backend::Sqlite { directory } = &config.backend else {
            return Err(Error::config("SQLite connector requires an SQLite backend"));
        };
        let directory = directory.clone();
        let driver = tokio::task::spawn_blocking(move || SqliteDriver::open(directory)).await??;
        Ok(Arc::new(driver))
    }
}

/// One SQLite connection.
pub struct SqliteDriver {
    conn: Arc<Mutex<Option<Connection>>>,
    directory: Option<PathBuf>,
    /// Highest key handed out by `reserve_key`, per (database, table).
    reserved: Arc<Mutex<HashMap<(String, String), i64>>>,
}

impl SqliteDriver {
    /// Open the connection and attach every `*.db` file found in `directory`.
    pub fn open(directory: Option<PathBuf>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        if let Some(dir) = &directory {
            std::fs::create_dir_all(dir)?;
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("db") {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                attach(&conn, name, &path.to_string_lossy())?;
                tracing::debug!(database = name, path = %path.display(), "Attached database file");
            }
        }

        tracing::info!(
            directory = ?directory,
            version = rusqlite::version(),
            "SQLite connection established"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            directory,
            reserved: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn location(&self, name: &str) -> Option<PathBuf> {
        self.directory.as_ref().map(|dir| dir.join(format!("{name}.db")))
    }

    async fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let conn = guard
                .as_ref()
                .ok_or_else(|| Error::connection("SQLite connection is closed"))?;
            f(conn)
        })
        .await?
    }
}

fn attach(conn: &Connection, name: &str, location: &str) -> Result<()> {
    let sql = format!("ATTACH DATABASE ?1 AS {}", DIALECT.quote(name));
    conn.execute(&sql, [location])?;
    Ok(())
}

fn query_records(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Arc<[String]> =
        stmt.column_names().into_iter().map(String::from).collect::<Vec<_>>().into();
    let width = columns.len();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..width)
            .map(|i| row.get_ref(i).map(read_value))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records.push(Record::new(columns.clone(), values));
    }
    Ok(records)
}

fn read_value(raw: ValueRef<'_>) -> Value {
    match raw {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(x) => Value::Float(x),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn dialect(&self) -> Dialect {
        DIALECT
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        tracing::trace!(sql, "execute");
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            let affected = conn.execute(&sql, params_from_iter(params.iter()))?;
            Ok(affected as u64)
        })
        .await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        tracing::trace!(sql, "query");
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| query_records(conn, &sql, &params)).await
    }

    async fn version(&self) -> Result<BackendVersion> {
        Ok(BackendVersion::parse("SQLite", rusqlite::version()))
    }

    async fn databases(&self) -> Result<Vec<String>> {
        let records = self
            .query(
                "SELECT name FROM pragma_database_list \
                 WHERE name NOT IN ('main', 'temp') ORDER BY name",
                &[],
            )
            .await?;
        records
            .into_iter()
            .filter_map(|r| r.get_index(0).cloned())
            .map(String::try_from)
            .collect()
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        let location = self
            .location(name)
            .map_or_else(|| ":memory:".to_string(), |p| p.to_string_lossy().into_owned());
        let name = name.to_string();
        self.with_conn(move |conn| attach(conn, &name, &location)).await
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let sql = format!("DETACH DATABASE {}", DIALECT.quote(name));
        self.execute(&sql, &[]).await?;

        if let Some(path) = self.location(name) {
            remove_file(&path)?;
        }
        Ok(())
    }

    async fn table_exists(&self, database: &str, table: &str) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
            DIALECT.quote(database)
        );
        let records = self.query(&sql, &[Value::from(table)]).await?;
        let count = records.first().and_then(|r| r.get_index(0).cloned()).unwrap_or(Value::Int(0));
        Ok(i64::try_from(count)? > 0)
    }

    async fn columns(&self, database: &str, table: &str) -> Result<Vec<String>> {
        let records = self
            .query(
                "SELECT name FROM pragma_table_info(?1, ?2) ORDER BY cid",
                &[Value::from(table), Value::from(database)],
            )
            .await?;
        records
            .into_iter()
            .filter_map(|r| r.get_index(0).cloned())
            .map(String::try_from)
            .collect()
    }

    async fn reserve_key(&self, database: &str, table: &str) -> Result<RowKey> {
        let max_sql = format!(
            "SELECT MAX({}) FROM {}",
            DIALECT.quote(ROW_COLUMN),
            DIALECT.qualified(database, table)
        );
        let seq_sql =
            format!("SELECT seq FROM {}.sqlite_sequence WHERE name = ?1", DIALECT.quote(database));
        let slot = (database.to_string(), table.to_string());
        let reserved = Arc::clone(&self.reserved);

        self.with_conn(move |conn| {
            let max: Option<i64> = conn.query_row(&max_sql, [], |r| r.get(0))?;
            let seq: i64 = match conn.query_row(&seq_sql, [&slot.1], |r| r.get(0)) {
                Ok(seq) => seq,
                Err(rusqlite::Error::QueryReturnedNoRows) => 0,
                Err(e) => {
                    let err = Error::from(e);
                    if !err.is_undefined_object() {
                        return Err(err);
                    }
                    0
                }
            };

            let mut reserved = reserved.lock();
            let high = reserved.get(&slot).copied().unwrap_or(0);
            let key = max.unwrap_or(0).max(seq).max(high) + 1;
            reserved.insert(slot, key);
            Ok(RowKey(key))
        })
        .await
    }

    async fn is_valid(&self, timeout: Duration) -> bool {
        let ping = self.with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?));
        matches!(tokio::time::timeout(timeout, ping).await, Ok(Ok(1)))
    }

    async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let taken = tokio::task::spawn_blocking(move || conn.lock().take()).await?;
        if let Some(conn) = taken {
            conn.close().map_err(|(_, e)| Error::from(e))?;
            tracing::debug!("SQLite connection closed");
        }
        Ok(())
    }
}

fn remove_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Bool(b) => ToSqlOutput::Borrowed(ValueRef::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Float(x) => ToSqlOutput::Borrowed(ValueRef::Real(*x)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}
