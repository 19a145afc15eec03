//! Row/variable caching layer over PostgreSQL and SQLite.
//!
//! - **session**: One backend connection with health checking and reconnect
//! - **schema**: Databases, tables, variables and cached rows
//! - **query**: Equality conditions and bulk row operations
//! - **driver**: Backend drivers and SQL dialects
//! - **task**: Deferred results of spawned operations
//! - **models**: Configuration and value types
//! - **error**: Error handling with SQLSTATE-style codes
//! - **logging**: Structured logging setup

pub mod driver;
pub mod error;
pub mod logging;
pub mod models;
pub mod query;
pub mod schema;
pub mod session;
pub mod task;

#[cfg(test)]
mod verification_tests;

pub use error::{Error, Result};
pub use models::{
    Backend, BackendVersion, RowKey, SessionConfig, SessionConfigBuilder, SessionOptions, TextSize,
    Value, VariableType,
};
pub use query::{Condition, WhereClause};
pub use schema::{Database, Row, Table, Variable};
pub use session::Session;
pub use task::Deferred;
