//! SQL text generation for each backend.
//!
//! Every identifier is quoted. Table names are always qualified with the
//! owning database (`"db"."table"`), which is a schema on PostgreSQL and an
//! attached database on SQLite.

use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::models::{RowKey, TextSize, Value, VariableType};

/// Name of the row-identity column present in every backing table.
pub const ROW_COLUMN: &str = "row";

/// Backend SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// PostgreSQL
    Postgres,
    /// SQLite
    Sqlite,
}

/// What an insert does when the row key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Leave the existing record untouched.
    Ignore,
    /// Overwrite the inserted columns.
    Update,
}

impl Dialect {
    /// Quote an identifier, doubling embedded quotes.
    pub fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Qualified, quoted table name.
    pub fn qualified(&self, database: &str, table: &str) -> String {
        format!("{}.{}", self.quote(database), self.quote(table))
    }

    /// Positional parameter marker (1-based).
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${n}"),
            Self::Sqlite => format!("?{n}"),
        }
    }

    /// Column definition of the row-identity column.
    pub fn row_column_ddl(&self) -> String {
        match self {
            Self::Postgres => format!("{} BIGSERIAL PRIMARY KEY", self.quote(ROW_COLUMN)),
            Self::Sqlite => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", self.quote(ROW_COLUMN)),
        }
    }

    /// Backing SQL type for a variable type.
    pub fn sql_type(&self, ty: &VariableType) -> &'static str {
        match (self, ty) {
            (_, VariableType::Boolean) => "BOOLEAN",
            (_, VariableType::SmallInt) => "SMALLINT",
            (_, VariableType::Integer) => "INTEGER",
            (_, VariableType::BigInt) => "BIGINT",
            (_, VariableType::Real) => "REAL",
            (Self::Postgres, VariableType::Double) => "DOUBLE PRECISION",
            (Self::Sqlite, VariableType::Double) => "DOUBLE",
            (_, VariableType::Text(TextSize::Tiny)) => "VARCHAR(255)",
            (_, VariableType::Text(_)) => "TEXT",
            (Self::Postgres, VariableType::Bytes) => "BYTEA",
            (Self::Sqlite, VariableType::Bytes) => "BLOB",
        }
    }

    /// Render a value as an SQL literal, for use in column defaults.
    pub fn literal(&self, value: &Value) -> Result<String> {
        Ok(match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => match self {
                Self::Postgres => if *b { "TRUE" } else { "FALSE" }.to_string(),
                Self::Sqlite => if *b { "1" } else { "0" }.to_string(),
            },
            Value::Int(i) => i.to_string(),
            Value::Float(x) if x.is_finite() => {
                let text = x.to_string();
                if text.contains(['.', 'e', 'E']) {
                    text
                } else {
                    format!("{text}.0")
                }
            }
            Value::Float(x) => {
                return Err(Error::invalid_value(format!("{x} has no SQL literal")));
            }
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Bytes(b) => {
                let mut hex = String::with_capacity(b.len() * 2);
                for byte in b {
                    let _ = write!(hex, "{byte:02x}");
                }
                match self {
                    Self::Postgres => format!("'\\x{hex}'::bytea"),
                    Self::Sqlite => format!("X'{hex}'"),
                }
            }
        })
    }

    // ========== DDL ==========

    /// `CREATE TABLE` with only the row-identity column.
    pub fn create_table(&self, database: &str, table: &str) -> String {
        format!("CREATE TABLE {} ({})", self.qualified(database, table), self.row_column_ddl())
    }

    /// `DROP TABLE`.
    pub fn drop_table(&self, database: &str, table: &str) -> String {
        format!("DROP TABLE {}", self.qualified(database, table))
    }

    /// `ALTER TABLE ... ADD COLUMN` for a variable.
    ///
    /// A non-null default becomes the column default, so existing records
    /// take it on. Non-nullable columns also get `NOT NULL`.
    pub fn add_column(
        &self,
        database: &str,
        table: &str,
        column: &str,
        ty: &VariableType,
        default: &Value,
        nullable: bool,
    ) -> Result<String> {
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.qualified(database, table),
            self.quote(column),
            self.sql_type(ty)
        );
        if !nullable {
            if default.is_null() {
                return Err(Error::invalid_value(format!(
                    "non-nullable column '{column}' needs a default"
                )));
            }
            sql.push_str(" NOT NULL");
        }
        if !default.is_null() {
            write!(sql, " DEFAULT {}", self.literal(default)?)
                .map_err(|e| Error::internal(e.to_string()))?;
        }
        Ok(sql)
    }

    /// `ALTER TABLE ... DROP COLUMN`.
    pub fn drop_column(&self, database: &str, table: &str, column: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.qualified(database, table),
            self.quote(column)
        )
    }

    // ========== DML ==========

    /// `SELECT *` of a single record by key (`$1`).
    pub fn select_row(&self, database: &str, table: &str) -> String {
        format!(
            "SELECT * FROM {} WHERE {} = {}",
            self.qualified(database, table),
            self.quote(ROW_COLUMN),
            self.placeholder(1)
        )
    }

    /// `SELECT` of one column of a single record by key (`$1`).
    pub fn select_value(&self, database: &str, table: &str, column: &str) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} = {}",
            self.quote(column),
            self.qualified(database, table),
            self.quote(ROW_COLUMN),
            self.placeholder(1)
        )
    }

    /// `INSERT` of the key (`$1`) plus the given columns (`$2..`).
    pub fn insert_row(
        &self,
        database: &str,
        table: &str,
        columns: &[&str],
        on_conflict: OnConflict,
    ) -> String {
        let mut names = vec![self.quote(ROW_COLUMN)];
        names.extend(columns.iter().map(|c| self.quote(c)));
        let markers: Vec<String> = (1..=names.len()).map(|n| self.placeholder(n)).collect();

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) ",
            self.qualified(database, table),
            names.join(", "),
            markers.join(", "),
            self.quote(ROW_COLUMN)
        );
        if on_conflict == OnConflict::Update && !columns.is_empty() {
            let sets: Vec<String> = columns
                .iter()
                .map(|c| format!("{0} = excluded.{0}", self.quote(c)))
                .collect();
            sql.push_str("DO UPDATE SET ");
            sql.push_str(&sets.join(", "));
        } else {
            sql.push_str("DO NOTHING");
        }
        sql
    }

    /// `UPDATE ... SET "column" = $1` followed by a WHERE clause.
    pub fn update_column(&self, database: &str, table: &str, column: &str, filter: &str) -> String {
        format!(
            "UPDATE {} SET {} = {}{}",
            self.qualified(database, table),
            self.quote(column),
            self.placeholder(1),
            filter
        )
    }

    /// `DELETE` followed by a WHERE clause.
    pub fn delete(&self, database: &str, table: &str, filter: &str) -> String {
        format!("DELETE FROM {}{}", self.qualified(database, table), filter)
    }

    /// `SELECT "row"` followed by a WHERE clause, ordered by key.
    pub fn select_keys(&self, database: &str, table: &str, filter: &str) -> String {
        format!(
            "SELECT {0} FROM {1}{2} ORDER BY {0}",
            self.quote(ROW_COLUMN),
            self.qualified(database, table),
            filter
        )
    }

    /// `SELECT COUNT(*)` followed by a WHERE clause.
    pub fn count(&self, database: &str, table: &str, filter: &str) -> String {
        format!("SELECT COUNT(*) FROM {}{}", self.qualified(database, table), filter)
    }

    /// ` WHERE "row" = $n`.
    pub fn key_filter(&self, placeholder: usize) -> String {
        format!(" WHERE {} = {}", self.quote(ROW_COLUMN), self.placeholder(placeholder))
    }

    /// `"row" NOT IN (k1, k2, ...)`, or `None` for an empty key set.
    ///
    /// Keys are integers and are inlined.
    pub fn key_exclusion(&self, keys: &[RowKey]) -> Option<String> {
        if keys.is_empty() {
            return None;
        }
        Some(format!("{} NOT IN ({})", self.quote(ROW_COLUMN), key_list(keys)))
    }

    /// `"row" IN (k1, k2, ...)`, or `None` for an empty key set.
    pub fn key_inclusion(&self, keys: &[RowKey]) -> Option<String> {
        if keys.is_empty() {
            return None;
        }
        Some(format!("{} IN ({})", self.quote(ROW_COLUMN), key_list(keys)))
    }
}

fn key_list(keys: &[RowKey]) -> String {
    keys.iter().map(RowKey::to_string).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting_and_placeholders() {
        let pg = Dialect::Postgres;
        assert_eq!(pg.quote("a\"b"), "\"a\"\"b\"");
        assert_eq!(pg.qualified("db", "t"), "\"db\".\"t\"");
        assert_eq!(pg.placeholder(3), "$3");
        assert_eq!(Dialect::Sqlite.placeholder(3), "?3");
    }

    #[test]
    fn test_sql_types() {
        assert_eq!(Dialect::Postgres.sql_type(&VariableType::Double), "DOUBLE PRECISION");
        assert_eq!(Dialect::Sqlite.sql_type(&VariableType::Bytes), "BLOB");
        assert_eq!(
            Dialect::Postgres.sql_type(&VariableType::Text(TextSize::Tiny)),
            "VARCHAR(255)"
        );
        assert_eq!(Dialect::Postgres.sql_type(&VariableType::Text(TextSize::Long)), "TEXT");
    }

    #[test]
    fn test_literals() {
        let pg = Dialect::Postgres;
        let lite = Dialect::Sqlite;
        assert_eq!(pg.literal(&Value::Text("it's".into())).unwrap(), "'it''s'");
        assert_eq!(pg.literal(&Value::Bool(true)).unwrap(), "TRUE");
        assert_eq!(lite.literal(&Value::Bool(true)).unwrap(), "1");
        assert_eq!(pg.literal(&Value::Bytes(vec![0xde, 0xad])).unwrap(), "'\\xdead'::bytea");
        assert_eq!(lite.literal(&Value::Bytes(vec![0xde, 0xad])).unwrap(), "X'dead'");
        assert_eq!(pg.literal(&Value::Float(2.0)).unwrap(), "2.0");
        assert!(pg.literal(&Value::Float(f64::NAN)).is_err());
    }

    #[test]
    fn test_add_column() {
        let sql = Dialect::Postgres
            .add_column("db", "t", "v", &VariableType::Integer, &Value::Int(0), false)
            .unwrap();
        assert_eq!(sql, "ALTER TABLE \"db\".\"t\" ADD COLUMN \"v\" INTEGER NOT NULL DEFAULT 0");

        let sql = Dialect::Sqlite
            .add_column("db", "t", "v", &VariableType::Integer, &Value::Null, true)
            .unwrap();
        assert_eq!(sql, "ALTER TABLE \"db\".\"t\" ADD COLUMN \"v\" INTEGER");

        let sql = Dialect::Sqlite
            .add_column("db", "t", "v", &VariableType::Text(TextSize::Normal), &Value::from("a"), true)
            .unwrap();
        assert_eq!(sql, "ALTER TABLE \"db\".\"t\" ADD COLUMN \"v\" TEXT DEFAULT 'a'");

        assert!(Dialect::Sqlite
            .add_column("db", "t", "v", &VariableType::Integer, &Value::Null, false)
            .is_err());
    }

    #[test]
    fn test_insert_row() {
        let d = Dialect::Postgres;
        assert_eq!(
            d.insert_row("db", "t", &["a", "b"], OnConflict::Update),
            "INSERT INTO \"db\".\"t\" (\"row\", \"a\", \"b\") VALUES ($1, $2, $3) \
             ON CONFLICT (\"row\") DO UPDATE SET \"a\" = excluded.\"a\", \"b\" = excluded.\"b\""
        );
        assert_eq!(
            d.insert_row("db", "t", &[], OnConflict::Update),
            "INSERT INTO \"db\".\"t\" (\"row\") VALUES ($1) ON CONFLICT (\"row\") DO NOTHING"
        );
    }

    #[test]
    fn test_key_exclusion() {
        let d = Dialect::Sqlite;
        assert_eq!(d.key_exclusion(&[]), None);
        assert_eq!(
            d.key_exclusion(&[RowKey(1), RowKey(5)]).unwrap(),
            "\"row\" NOT IN (1, 5)"
        );
        assert_eq!(d.key_inclusion(&[]), None);
        assert_eq!(d.key_inclusion(&[RowKey(3)]).unwrap(), "\"row\" IN (3)");
    }
}
