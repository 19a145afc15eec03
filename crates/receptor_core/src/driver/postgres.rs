//! PostgreSQL driver over a single tokio-postgres client.
//!
//! Databases are schemas in the configured catalog.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::task::JoinHandle;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls};

use crate::driver::{Connector, Dialect, Driver, Record, ROW_COLUMN};
use crate::error::{Error, Result};
use crate::models::{BackendVersion, RowKey, SessionConfig, Value};

type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// Opens [`PostgresDriver`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresConnector;

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<Arc<dyn Driver>> {
        let options = &config.options;

        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.catalog);
        pg_config.user(&config.username);
        if let Some(password) = &config.password {
            pg_config.password(password);
        }
        pg_config.application_name(&options.application_name);
        pg_config.connect_timeout(options.connect_timeout());
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));

        let (client, connection) = pg_config.connect(NoTls).await?;
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "PostgreSQL connection ended with error");
            }
        });

        tracing::info!(
            host = %config.host,
            catalog = %config.catalog,
            "PostgreSQL connection established"
        );

        Ok(Arc::new(PostgresDriver { client, connection }))
    }
}

/// One PostgreSQL connection.
pub struct PostgresDriver {
    client: Client,
    connection: JoinHandle<()>,
}

impl PostgresDriver {
    fn params(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
        params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
    }

    async fn scalar(&self, sql: &str, params: &[Value]) -> Result<Value> {
        let records = self.query(sql, params).await?;
        Ok(records
            .into_iter()
            .next()
            .and_then(|r| r.get_index(0).cloned())
            .unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        tracing::trace!(sql, "execute");
        self.client.execute(sql, &Self::params(params)).await.map_err(Error::from)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        tracing::trace!(sql, "query");
        let rows = self.client.query(sql, &Self::params(params)).await?;

        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<[String]> =
            first.columns().iter().map(|c| c.name().to_string()).collect::<Vec<_>>().into();

        rows.iter()
            .map(|row| {
                let values = (0..row.len()).map(|i| read_value(row, i)).collect::<Result<_>>()?;
                Ok(Record::new(columns.clone(), values))
            })
            .collect()
    }

    async fn version(&self) -> Result<BackendVersion> {
        let raw = self.scalar("SELECT current_setting('server_version')", &[]).await?;
        let text = String::try_from(raw)?;
        Ok(BackendVersion::parse("PostgreSQL", &text))
    }

    async fn databases(&self) -> Result<Vec<String>> {
        let records = self
            .query(
                r#"
                SELECT n.nspname::text AS name
                FROM pg_catalog.pg_namespace n
                WHERE n.nspname NOT LIKE 'pg\_%'
                  AND n.nspname != 'information_schema'
                ORDER BY n.nspname
                "#,
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
        let sql = format!("CREATE SCHEMA {}", Dialect::Postgres.quote(name));
        self.execute(&sql, &[]).await.map(|_| ())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let sql = format!("DROP SCHEMA {} CASCADE", Dialect::Postgres.quote(name));
        self.execute(&sql, &[]).await.map(|_| ())
    }

    async fn table_exists(&self, database: &str, table: &str) -> Result<bool> {
        let found = self
            .scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM pg_catalog.pg_tables
                    WHERE schemaname = $1 AND tablename = $2
                )
                "#,
                &[Value::from(database), Value::from(table)],
            )
            .await?;
        bool::try_from(found)
    }

    async fn columns(&self, database: &str, table: &str) -> Result<Vec<String>> {
        let records = self
            .query(
                r#"
                SELECT a.attname::text AS name
                FROM pg_catalog.pg_attribute a
                JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = $1
                  AND c.relname = $2
                  AND a.attnum > 0
                  AND NOT a.attisdropped
                ORDER BY a.attnum
                "#,
                &[Value::from(database), Value::from(table)],
            )
            .await?;
        records
            .into_iter()
            .filter_map(|r| r.get_index(0).cloned())
            .map(String::try_from)
            .collect()
    }

    async fn reserve_key(&self, database: &str, table: &str) -> Result<RowKey> {
        let d = Dialect::Postgres;
        let qualified = d.qualified(database, table);
        // Keys inserted explicitly never advance the sequence, so skip past them.
        let sql = format!(
            "SELECT setval(pg_get_serial_sequence($1, 'row'), GREATEST(\
             nextval(pg_get_serial_sequence($1, 'row')), \
             (SELECT COALESCE(MAX({row}), 0) + 1 FROM {qualified})))",
            row = d.quote(ROW_COLUMN),
        );
        let key = self.scalar(&sql, &[Value::Text(qualified)]).await?;
        Ok(RowKey(i64::try_from(key)?))
    }

    async fn is_valid(&self, timeout: Duration) -> bool {
        if self.client.is_closed() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, self.client.simple_query("SELECT 1")).await, Ok(Ok(_)))
    }

    async fn close(&self) -> Result<()> {
        self.connection.abort();
        tracing::debug!("PostgreSQL connection closed");
        Ok(())
    }
}

impl Drop for PostgresDriver {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

fn read_value(row: &tokio_postgres::Row, idx: usize) -> Result<Value> {
    let ty = row.columns()[idx].type_();
    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(Value::from)
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(Value::from)
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(Value::Int)
    } else if *ty == Type::OID {
        row.try_get::<_, Option<u32>>(idx)?.map(Value::from)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?.map(Value::from)
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(Value::Float)
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes)
    } else {
        match row.try_get::<_, Option<String>>(idx) {
            Ok(text) => text.map(Value::Text),
            Err(_) => {
                tracing::warn!(column = row.columns()[idx].name(), pg_type = %ty, "Unsupported column type");
                None
            }
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

fn write_text(s: &str, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
    s.to_sql(ty, out)
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        let textual = [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME].contains(ty);
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => {
                if *ty == Type::BOOL {
                    b.to_sql(ty, out)
                } else if textual {
                    write_text(&b.to_string(), ty, out)
                } else {
                    Value::Int(i64::from(*b)).to_sql(ty, out)
                }
            }
            Value::Int(i) => {
                if *ty == Type::INT2 {
                    i16::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    (*i as f32).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*i as f64).to_sql(ty, out)
                } else if *ty == Type::BOOL {
                    (*i != 0).to_sql(ty, out)
                } else if textual {
                    write_text(&i.to_string(), ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            Value::Float(x) => {
                if *ty == Type::FLOAT4 {
                    (*x as f32).to_sql(ty, out)
                } else if [Type::INT2, Type::INT4, Type::INT8].contains(ty) && x.fract() == 0.0 {
                    Value::Int(*x as i64).to_sql(ty, out)
                } else if textual {
                    write_text(&x.to_string(), ty, out)
                } else {
                    x.to_sql(ty, out)
                }
            }
            Value::Text(s) => write_text(s, ty, out),
            Value::Bytes(b) => b.as_slice().to_sql(ty, out),
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
