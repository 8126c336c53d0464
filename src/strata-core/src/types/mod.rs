//! Scalar type system for Strata.

mod data_type;
mod value;

pub use data_type::DataType;
pub use value::Value;

/// Nanoseconds since the Unix epoch.
pub type Timestamp = i64;
