//! Data type definitions for Strata columns.

use std::sync::Arc;

use arrow::datatypes::{DataType as ArrowDataType, Field, TimeUnit};
use serde::{Deserialize, Serialize};

/// Data type for pipeline columns.
///
/// This is the closed scalar vocabulary of the clause pipeline, plus
/// `List` for distinct-collect aggregation output. Segments may
/// physically store strings dictionary-encoded; that is invisible at
/// this level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Boolean type.
    Bool,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit unsigned integer.
    UInt64,
    /// 64-bit floating point.
    Float64,
    /// UTF-8 string.
    String,
    /// Timestamp with nanosecond precision.
    Timestamp,
    /// Variable-length list of a scalar element type.
    List(Box<DataType>),
}

impl DataType {
    /// Check if this type is numeric.
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int64 | Self::UInt64 | Self::Float64)
    }

    /// Check if this type is an integer type.
    pub const fn is_integer(&self) -> bool {
        matches!(self, Self::Int64 | Self::UInt64)
    }

    /// The wider of two numeric types, following the promotion lattice:
    /// any float operand promotes the result to `Float64`; signed and
    /// unsigned integers promote to `Int64`.
    pub fn promote(&self, other: &Self) -> Option<Self> {
        match (self, other) {
            _ if !self.is_numeric() || !other.is_numeric() => None,
            (Self::Float64, _) | (_, Self::Float64) => Some(Self::Float64),
            (Self::UInt64, Self::UInt64) => Some(Self::UInt64),
            _ => Some(Self::Int64),
        }
    }

    /// Convert to the equivalent Arrow data type.
    pub fn to_arrow(&self) -> ArrowDataType {
        match self {
            Self::Bool => ArrowDataType::Boolean,
            Self::Int64 => ArrowDataType::Int64,
            Self::UInt64 => ArrowDataType::UInt64,
            Self::Float64 => ArrowDataType::Float64,
            Self::String => ArrowDataType::Utf8,
            Self::Timestamp => ArrowDataType::Timestamp(TimeUnit::Nanosecond, None),
            Self::List(inner) => {
                ArrowDataType::List(Arc::new(Field::new("item", inner.to_arrow(), true)))
            }
        }
    }

    /// Convert from an Arrow data type, if representable.
    ///
    /// Dictionary-encoded string columns map to `String`; the encoding is
    /// a segment-internal detail.
    pub fn from_arrow(dt: &ArrowDataType) -> Option<Self> {
        match dt {
            ArrowDataType::Boolean => Some(Self::Bool),
            ArrowDataType::Int64 => Some(Self::Int64),
            ArrowDataType::UInt64 => Some(Self::UInt64),
            ArrowDataType::Float64 => Some(Self::Float64),
            ArrowDataType::Utf8 | ArrowDataType::LargeUtf8 => Some(Self::String),
            ArrowDataType::Timestamp(TimeUnit::Nanosecond, _) => Some(Self::Timestamp),
            ArrowDataType::Dictionary(_, value) => match value.as_ref() {
                ArrowDataType::Utf8 | ArrowDataType::LargeUtf8 => Some(Self::String),
                _ => None,
            },
            ArrowDataType::List(field) => {
                Self::from_arrow(field.data_type()).map(|inner| Self::List(Box::new(inner)))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool => f.write_str("Bool"),
            Self::Int64 => f.write_str("Int64"),
            Self::UInt64 => f.write_str("UInt64"),
            Self::Float64 => f.write_str("Float64"),
            Self::String => f.write_str("String"),
            Self::Timestamp => f.write_str("Timestamp"),
            Self::List(inner) => write!(f, "List<{inner}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion() {
        assert_eq!(
            DataType::Int64.promote(&DataType::Float64),
            Some(DataType::Float64)
        );
        assert_eq!(
            DataType::UInt64.promote(&DataType::Int64),
            Some(DataType::Int64)
        );
        assert_eq!(
            DataType::Int64.promote(&DataType::Int64),
            Some(DataType::Int64)
        );
        assert_eq!(DataType::String.promote(&DataType::Int64), None);
    }

    #[test]
    fn test_arrow_round_trip() {
        for dt in [
            DataType::Bool,
            DataType::Int64,
            DataType::UInt64,
            DataType::Float64,
            DataType::String,
            DataType::Timestamp,
            DataType::List(Box::new(DataType::Int64)),
        ] {
            assert_eq!(DataType::from_arrow(&dt.to_arrow()), Some(dt));
        }
    }
}
