//! Runtime scalar values.

use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, TimestampNanosecondArray,
    UInt64Array, new_null_array,
};
use serde::{Deserialize, Serialize};

use super::{DataType, Timestamp};

/// A scalar literal appearing in expression nodes and `isin` sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit unsigned integer.
    UInt64(u64),
    /// 64-bit floating point.
    Float64(f64),
    /// UTF-8 string.
    String(String),
    /// Timestamp (nanoseconds since Unix epoch).
    Timestamp(Timestamp),
}

impl Value {
    /// Check if this value is null.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The data type of this value, if any.
    pub const fn data_type(&self) -> Option<DataType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(DataType::Bool),
            Self::Int64(_) => Some(DataType::Int64),
            Self::UInt64(_) => Some(DataType::UInt64),
            Self::Float64(_) => Some(DataType::Float64),
            Self::String(_) => Some(DataType::String),
            Self::Timestamp(_) => Some(DataType::Timestamp),
        }
    }

    /// Try to get as i64, widening unsigned values that fit.
    pub const fn as_int64(&self) -> Option<i64> {
        match self {
            Self::Int64(i) => Some(*i),
            Self::UInt64(u) if *u <= i64::MAX as u64 => Some(*u as i64),
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Try to get as u64.
    pub const fn as_uint64(&self) -> Option<u64> {
        match self {
            Self::UInt64(u) => Some(*u),
            Self::Int64(i) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }

    /// Try to get as f64, widening integers.
    pub fn as_float64(&self) -> Option<f64> {
        match self {
            Self::Float64(f) => Some(*f),
            Self::Int64(i) => Some(*i as f64),
            Self::UInt64(u) => Some(*u as f64),
            _ => None,
        }
    }

    /// Try to get as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Broadcast this scalar into an Arrow array of the given length.
    pub fn to_array(&self, len: usize) -> ArrayRef {
        match self {
            Self::Null => new_null_array(&arrow::datatypes::DataType::Null, len),
            Self::Bool(b) => Arc::new(BooleanArray::from(vec![*b; len])),
            Self::Int64(i) => Arc::new(Int64Array::from(vec![*i; len])),
            Self::UInt64(u) => Arc::new(UInt64Array::from(vec![*u; len])),
            Self::Float64(f) => Arc::new(Float64Array::from(vec![*f; len])),
            Self::String(s) => Arc::new(StringArray::from(vec![s.as_str(); len])),
            Self::Timestamp(t) => Arc::new(TimestampNanosecondArray::from(vec![*t; len])),
        }
    }

    /// Type name used in error messages.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Bool(_) => "Bool",
            Self::Int64(_) => "Int64",
            Self::UInt64(_) => "UInt64",
            Self::Float64(_) => "Float64",
            Self::String(_) => "String",
            Self::Timestamp(_) => "Timestamp",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int64(i) => write!(f, "{i}"),
            Self::UInt64(u) => write!(f, "{u}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "\"{s}\""),
            Self::Timestamp(t) => write!(f, "ts({t})"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int64(i)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Self::UInt64(u)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float64(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}
