//! Core data model for the Strata columnar time-series engine.
//!
//! This crate provides the fundamental types shared by the storage layer
//! and the clause pipeline:
//! - `Value` and `DataType` for the scalar type system
//! - `Segment` for immutable columnar slabs
//! - `RowRange` / `ColRange` / `RangesAndKey` for plan elements
//! - `OutputSchema` for pipeline schema propagation

pub mod ranges;
pub mod schema;
pub mod segment;
pub mod types;

// Re-export commonly used types
pub use ranges::{ColRange, RangesAndKey, RowRange};
pub use schema::{Density, FieldDef, OutputSchema};
pub use segment::{Segment, SegmentDescriptor};
pub use types::{DataType, Timestamp, Value};
