//! Error types for the receptor runtime.
//!
//! Backend failures keep their SQLSTATE-style code so the schema layer can tell
//! benign "already exists" / "does not exist" outcomes apart from real failures.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE codes the schema layer treats as benign.
///
/// The SQLite driver maps its textual errors onto the same codes.
pub mod codes {
    /// Schema (database) already exists.
    pub const DUPLICATE_SCHEMA: &str = "42P06";
    /// Table already exists.
    pub const DUPLICATE_TABLE: &str = "42P07";
    /// Column already exists.
    pub const DUPLICATE_COLUMN: &str = "42701";
    /// Schema (database) does not exist.
    pub const UNDEFINED_SCHEMA: &str = "3F000";
    /// Table does not exist.
    pub const UNDEFINED_TABLE: &str = "42P01";
    /// Column does not exist.
    pub const UNDEFINED_COLUMN: &str = "42703";
}

/// Main error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend connection failed or was lost.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication failed.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Statement execution error reported by the backend.
    #[error("{message}")]
    Query {
        /// Backend error message.
        message: String,
        /// Additional detail from the backend.
        detail: Option<String>,
        /// Backend hint.
        hint: Option<String>,
        /// SQLSTATE-style error code (e.g., "42P01").
        code: Option<String>,
    },

    /// Operation invoked on an entity in the wrong lifecycle state.
    #[error("Invalid state: {message}")]
    State {
        /// Human-readable error message.
        message: String,
    },

    /// Identifier does not follow the naming rules.
    #[error("Invalid name '{name}': {reason}")]
    InvalidName {
        /// The rejected identifier.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Value does not fit a variable's type or nullability.
    #[error("Invalid value: {message}")]
    InvalidValue {
        /// Human-readable error message.
        message: String,
    },

    /// A bounded wait elapsed.
    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// Name of the operation that timed out.
        operation: String,
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// The operation was cancelled before it completed.
    #[error("{operation} cancelled")]
    Cancelled {
        /// Name of the cancelled operation.
        operation: String,
    },

    /// Configuration error.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    // ========== Constructors ==========

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            hint: Some("Check username and password".to_string()),
        }
    }

    /// Create a backend error with an optional code.
    pub fn query(message: impl Into<String>, code: Option<&str>) -> Self {
        Self::Query { message: message.into(), detail: None, hint: None, code: code.map(String::from) }
    }

    /// Create a lifecycle/precondition error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State { message: message.into() }
    }

    /// Create an invalid identifier error.
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName { name: name.into(), reason: reason.into() }
    }

    /// Create an invalid value error.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue { message: message.into() }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout { operation: operation.into(), timeout }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled { operation: operation.into() }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    // ========== Methods ==========

    /// Get the backend error code (if applicable).
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Check if the backend reported that the object already exists.
    pub fn is_duplicate_object(&self) -> bool {
        matches!(
            self.code(),
            Some(codes::DUPLICATE_SCHEMA | codes::DUPLICATE_TABLE | codes::DUPLICATE_COLUMN)
        )
    }

    /// Check if the backend reported that the object does not exist.
    pub fn is_undefined_object(&self) -> bool {
        matches!(
            self.code(),
            Some(codes::UNDEFINED_SCHEMA | codes::UNDEFINED_TABLE | codes::UNDEFINED_COLUMN)
        )
    }

    /// Check if this error represents a lost or missing connection.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Check if this error came from a bounded wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error represents a cancelled operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Check if this error is a lifecycle/precondition failure.
    pub fn is_state(&self) -> bool {
        matches!(self, Self::State { .. })
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection",
            Self::Authentication { .. } => "Authentication",
            Self::Query { .. } => "Query",
            Self::State { .. } => "State",
            Self::InvalidName { .. } => "Name",
            Self::InvalidValue { .. } => "Value",
            Self::Timeout { .. } => "Timeout",
            Self::Cancelled { .. } => "Cancelled",
            Self::Config { .. } => "Config",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Connection { .. } => Some("Check that the database server is running"),
            Self::Authentication { hint, .. } => hint.as_deref(),
            Self::Query { hint, .. } => hint.as_deref(),
            Self::State { .. } => Some("Start the parent entity before using it"),
            Self::InvalidName { .. } => Some("Names must match ^[A-Za-z0-9_]{1,63}$"),
            Self::Timeout { .. } => Some("The backend operation may still complete"),
            Self::Internal { .. } => Some("Please report this issue"),
            Self::InvalidValue { .. } | Self::Cancelled { .. } | Self::Config { .. } => None,
        }
    }
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error.
impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let detail = db_err.detail().map(String::from);
            let hint = db_err.hint().map(String::from);

            let code_str = db_err.code().code();
            match code_str {
                "28P01" => {
                    return Error::Authentication {
                        message,
                        hint: Some("Invalid password - check your credentials".to_string()),
                    }
                }
                "28000" => {
                    return Error::Authentication {
                        message,
                        hint: Some(
                            "Authentication failed - check username and permissions".to_string(),
                        ),
                    }
                }
                _ if code_str.starts_with("08") => {
                    return Error::Connection { message, source: Some(Box::new(err)) }
                }
                _ => {
                    return Error::Query {
                        message,
                        detail,
                        hint,
                        code: Some(code_str.to_string()),
                    }
                }
            }
        }

        if err.is_closed() {
            return Error::Connection {
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        Error::Connection { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from rusqlite::Error, mapping SQLite messages onto SQLSTATE codes.
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        let message = match &err {
            rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.clone(),
            other => other.to_string(),
        };

        let code = sqlite_code(&message).map(String::from).or_else(|| match &err {
            rusqlite::Error::SqliteFailure(failure, _) => {
                Some(format!("SQLITE_{}", failure.extended_code))
            }
            _ => None,
        });

        Error::Query { message, detail: None, hint: None, code }
    }
}

fn sqlite_code(message: &str) -> Option<&'static str> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("is already in use") {
        Some(codes::DUPLICATE_SCHEMA)
    } else if lower.contains("already exists") {
        Some(codes::DUPLICATE_TABLE)
    } else if lower.starts_with("duplicate column name") {
        Some(codes::DUPLICATE_COLUMN)
    } else if lower.contains("no such database") || lower.contains("unknown database") {
        Some(codes::UNDEFINED_SCHEMA)
    } else if lower.contains("no such table") {
        Some(codes::UNDEFINED_TABLE)
    } else if lower.contains("no such column") {
        Some(codes::UNDEFINED_COLUMN)
    } else {
        None
    }
}

/// Convert from std::io::Error.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from serde_json::Error.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config { message: format!("JSON error: {err}") }
    }
}

/// Convert from a failed or aborted tokio task.
impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Error::cancelled("task")
        } else {
            Error::Internal { message: format!("Task panicked: {err}"), source: None }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_messages_map_to_benign_codes() {
        assert_eq!(sqlite_code("table \"t\" already exists"), Some(codes::DUPLICATE_TABLE));
        assert_eq!(sqlite_code("duplicate column name: v"), Some(codes::DUPLICATE_COLUMN));
        assert_eq!(sqlite_code("database test is already in use"), Some(codes::DUPLICATE_SCHEMA));
        assert_eq!(sqlite_code("no such database: test"), Some(codes::UNDEFINED_SCHEMA));
        assert_eq!(sqlite_code("unknown database test"), Some(codes::UNDEFINED_SCHEMA));
        assert_eq!(sqlite_code("no such table: test.t"), Some(codes::UNDEFINED_TABLE));
        assert_eq!(sqlite_code("no such column: \"v\""), Some(codes::UNDEFINED_COLUMN));
        assert_eq!(sqlite_code("UNIQUE constraint failed: t.row"), None);
    }

    #[test]
    fn test_benign_classification() {
        assert!(Error::query("exists", Some(codes::DUPLICATE_TABLE)).is_duplicate_object());
        assert!(Error::query("missing", Some(codes::UNDEFINED_COLUMN)).is_undefined_object());

        let genuine = Error::query("syntax error", Some("42601"));
        assert!(!genuine.is_duplicate_object());
        assert!(!genuine.is_undefined_object());
        assert_eq!(genuine.code(), Some("42601"));
    }

    #[test]
    fn test_categories_and_hints() {
        let err = Error::state("table 't' is not loaded");
        assert!(err.is_state());
        assert_eq!(err.category(), "State");
        assert!(err.hint().is_some());

        let err = Error::timeout("session.connect", Duration::from_secs(5));
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "session.connect timed out after 5000ms");

        assert!(Error::cancelled("row.save").is_cancelled());
        assert_eq!(Error::invalid_value("x").hint(), None);
    }
}
