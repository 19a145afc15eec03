//! Data models for receptor.
//!
//! - `config` - SessionConfig, SessionOptions, Backend
//! - `value` - Value, VariableType, TextSize, RowKey, BackendVersion

pub mod config;
pub mod value;

pub use config::{Backend, SessionConfig, SessionConfigBuilder, SessionOptions};
pub use value::{BackendVersion, RowKey, TextSize, Value, VariableType};
