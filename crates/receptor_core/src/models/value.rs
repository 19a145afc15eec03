//! Cell values, variable types, row keys and backend versions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A dynamically typed cell value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Any integer width
    Int(i64),
    /// Any floating point width
    Float(f64),
    /// Character data
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
}

impl Value {
    /// Check if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short name of the value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

macro_rules! value_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::Int(i64::from(v))
                }
            }
        )*
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

fn mismatch(expected: &str, got: &Value) -> Error {
    Error::invalid_value(format!("expected {expected}, found {}", got.kind()))
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Bool(b) => Ok(b),
            Value::Int(i) => Ok(i != 0),
            other => Err(mismatch("bool", &other)),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Int(i) => Ok(i),
            Value::Bool(b) => Ok(i64::from(b)),
            other => Err(mismatch("int", &other)),
        }
    }
}

macro_rules! value_try_into_int {
    ($($t:ty),*) => {
        $(
            impl TryFrom<Value> for $t {
                type Error = Error;

                fn try_from(v: Value) -> Result<Self> {
                    let wide = i64::try_from(v)?;
                    <$t>::try_from(wide).map_err(|_| {
                        Error::invalid_value(format!(
                            "{wide} is out of range for {}",
                            stringify!($t)
                        ))
                    })
                }
            }
        )*
    };
}

value_try_into_int!(i16, i32, u32);

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Float(x) => Ok(x),
            Value::Int(i) => Ok(i as f64),
            other => Err(mismatch("float", &other)),
        }
    }
}

impl TryFrom<Value> for f32 {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        f64::try_from(v).map(|x| x as f32)
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Text(s) => Ok(s),
            other => Err(mismatch("text", &other)),
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Bytes(b) => Ok(b),
            other => Err(mismatch("bytes", &other)),
        }
    }
}

/// Size class of a text variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextSize {
    /// Up to 255 characters
    Tiny,
    /// Up to 65,535 characters
    #[default]
    Normal,
    /// Up to 16,777,215 characters
    Medium,
    /// Up to 4,294,967,295 characters
    Long,
}

impl TextSize {
    /// Maximum number of characters a value of this class may hold.
    pub fn max_chars(&self) -> u64 {
        match self {
            Self::Tiny => 255,
            Self::Normal => 65_535,
            Self::Medium => 16_777_215,
            Self::Long => 4_294_967_295,
        }
    }
}

/// The type of a variable (column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    /// true/false
    Boolean,
    /// 16-bit signed integer
    SmallInt,
    /// 32-bit signed integer
    Integer,
    /// 64-bit signed integer
    BigInt,
    /// Single precision float
    Real,
    /// Double precision float
    Double,
    /// Character data of the given size class
    Text(TextSize),
    /// Binary data
    Bytes,
}

impl VariableType {
    /// Convert a raw value (as read from the backend or supplied by a caller)
    /// into the canonical representation of this type.
    ///
    /// NULL passes through; nullability is checked by the variable.
    pub fn convert(&self, raw: Value) -> Result<Value> {
        if raw.is_null() {
            return Ok(Value::Null);
        }
        match self {
            Self::Boolean => match raw {
                Value::Bool(b) => Ok(Value::Bool(b)),
                Value::Int(i) => Ok(Value::Bool(i != 0)),
                Value::Text(ref s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "1" => Ok(Value::Bool(true)),
                    "false" | "f" | "0" => Ok(Value::Bool(false)),
                    _ => Err(self.reject(&raw)),
                },
                other => Err(self.reject(&other)),
            },
            Self::SmallInt => self.integer(raw, i64::from(i16::MIN), i64::from(i16::MAX)),
            Self::Integer => self.integer(raw, i64::from(i32::MIN), i64::from(i32::MAX)),
            Self::BigInt => self.integer(raw, i64::MIN, i64::MAX),
            Self::Real => self.float(raw).map(|x| Value::Float(f64::from(x as f32))),
            Self::Double => self.float(raw).map(Value::Float),
            Self::Text(size) => {
                let text = match raw {
                    Value::Text(s) => s,
                    Value::Bool(b) => b.to_string(),
                    Value::Int(i) => i.to_string(),
                    Value::Float(x) => x.to_string(),
                    Value::Bytes(b) => String::from_utf8(b).map_err(|_| {
                        Error::invalid_value("bytes are not valid UTF-8 text")
                    })?,
                    Value::Null => return Ok(Value::Null),
                };
                let chars = text.chars().count() as u64;
                if chars > size.max_chars() {
                    return Err(Error::invalid_value(format!(
                        "text of {chars} characters exceeds the {} limit of {}",
                        self,
                        size.max_chars()
                    )));
                }
                Ok(Value::Text(text))
            }
            Self::Bytes => match raw {
                Value::Bytes(b) => Ok(Value::Bytes(b)),
                Value::Text(s) => Ok(Value::Bytes(s.into_bytes())),
                other => Err(self.reject(&other)),
            },
        }
    }

    fn integer(&self, raw: Value, min: i64, max: i64) -> Result<Value> {
        let wide = match raw {
            Value::Int(i) => i,
            Value::Bool(b) => i64::from(b),
            Value::Float(x) if x.fract() == 0.0 && x >= i64::MIN as f64 && x <= i64::MAX as f64 => {
                x as i64
            }
            Value::Text(ref s) => s.trim().parse::<i64>().map_err(|_| self.reject(&raw))?,
            other => return Err(self.reject(&other)),
        };
        if wide < min || wide > max {
            return Err(Error::invalid_value(format!("{wide} is out of range for {self}")));
        }
        Ok(Value::Int(wide))
    }

    fn float(&self, raw: Value) -> Result<f64> {
        match raw {
            Value::Float(x) => Ok(x),
            Value::Int(i) => Ok(i as f64),
            Value::Text(ref s) => s.trim().parse::<f64>().map_err(|_| self.reject(&raw)),
            other => Err(self.reject(&other)),
        }
    }

    fn reject(&self, raw: &Value) -> Error {
        Error::invalid_value(format!("cannot convert {} value {raw} to {self}", raw.kind()))
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean => write!(f, "boolean"),
            Self::SmallInt => write!(f, "smallint"),
            Self::Integer => write!(f, "integer"),
            Self::BigInt => write!(f, "bigint"),
            Self::Real => write!(f, "real"),
            Self::Double => write!(f, "double"),
            Self::Text(size) => write!(f, "text({size:?})"),
            Self::Bytes => write!(f, "bytes"),
        }
    }
}

/// Backend-assigned row identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey(pub i64);

impl RowKey {
    /// Get the raw key.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for RowKey {
    fn from(key: i64) -> Self {
        Self(key)
    }
}

impl From<RowKey> for Value {
    fn from(key: RowKey) -> Self {
        Value::Int(key.0)
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend product and version detected at connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendVersion {
    /// Product name (e.g. "PostgreSQL")
    pub product: String,
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
}

impl BackendVersion {
    /// Parse a dotted version string such as "16.2 (Debian 16.2-1)" or "3.45.1".
    pub fn parse(product: impl Into<String>, version: &str) -> Self {
        let numeric: String = version
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = numeric.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
        Self {
            product: product.into(),
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
        }
    }

    /// Check if this version is at least `major.minor`.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}", self.product, self.major, self.minor)
    }
}
