//! Immutable columnar segments.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, TimestampNanosecondArray};
use arrow::datatypes::{Field, Schema as ArrowSchema, SchemaRef};
use arrow::record_batch::RecordBatch;

use common_error::{StrataError, StrataResult};

use crate::types::{DataType, Timestamp};

/// Static description of a segment's columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Column names and pipeline types, in column order.
    pub fields: Vec<(String, DataType)>,
    /// Name of the index column, if the segment is indexed.
    pub index_column: Option<String>,
}

/// An immutable columnar slab: an ordered list of typed columns sharing a
/// row count, plus a descriptor.
///
/// Backed by an Arrow `RecordBatch`, so cloning and row-slicing are
/// zero-copy. Strings may be stored dictionary-encoded; callers outside
/// this crate treat the physical representation as opaque.
#[derive(Debug, Clone)]
pub struct Segment {
    batch: RecordBatch,
    index_column: Option<String>,
}

impl Segment {
    /// Wrap a record batch. All columns of a `RecordBatch` already share
    /// one length, which is the segment row-count invariant.
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            batch,
            index_column: None,
        }
    }

    /// Wrap a record batch and declare its index column.
    pub fn with_index(batch: RecordBatch, index_column: impl Into<String>) -> StrataResult<Self> {
        let index_column = index_column.into();
        if batch.column_by_name(&index_column).is_none() {
            return Err(StrataError::missing_column(format!(
                "declared index column '{index_column}' is not in the segment"
            )));
        }
        Ok(Self {
            batch,
            index_column: Some(index_column),
        })
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn index_column(&self) -> Option<&str> {
        self.index_column.as_deref()
    }

    pub fn column_by_name(&self, name: &str) -> Option<&ArrayRef> {
        self.batch.column_by_name(name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.batch
            .schema_ref()
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect::<Vec<_>>()
    }

    /// The segment's descriptor in pipeline types. Columns whose Arrow
    /// type has no pipeline equivalent are rejected.
    pub fn descriptor(&self) -> StrataResult<SegmentDescriptor> {
        let mut fields = Vec::with_capacity(self.num_columns());
        for field in self.batch.schema_ref().fields() {
            let dt = DataType::from_arrow(field.data_type()).ok_or_else(|| {
                StrataError::schema_error(format!(
                    "column '{}' has unsupported type {}",
                    field.name(),
                    field.data_type()
                ))
            })?;
            fields.push((field.name().clone(), dt));
        }
        Ok(SegmentDescriptor {
            fields,
            index_column: self.index_column.clone(),
        })
    }

    /// The index column as nanosecond timestamps.
    pub fn index_values(&self) -> StrataResult<&TimestampNanosecondArray> {
        let name = self.index_column.as_deref().ok_or_else(|| {
            StrataError::schema_error("segment has no index column".to_string())
        })?;
        let col = self
            .column_by_name(name)
            .ok_or_else(|| StrataError::missing_column(name.to_string()))?;
        col.as_any()
            .downcast_ref::<TimestampNanosecondArray>()
            .ok_or_else(|| {
                StrataError::schema_error(format!(
                    "index column '{name}' is not a nanosecond timestamp"
                ))
            })
    }

    /// First and last index values. Segments are written time-sorted, so
    /// these are the segment's time bounds.
    pub fn time_bounds(&self) -> StrataResult<Option<(Timestamp, Timestamp)>> {
        let index = self.index_values()?;
        if index.is_empty() {
            return Ok(None);
        }
        Ok(Some((index.value(0), index.value(index.len() - 1))))
    }

    /// Zero-copy row slice `[offset, offset + length)`.
    pub fn slice(&self, offset: usize, length: usize) -> Self {
        Self {
            batch: self.batch.slice(offset, length),
            index_column: self.index_column.clone(),
        }
    }

    /// Keep only the rows whose bit is set, preserving order.
    pub fn filter(&self, mask: &arrow::array::BooleanArray) -> StrataResult<Self> {
        let batch = arrow::compute::filter_record_batch(&self.batch, mask)?;
        Ok(Self {
            batch,
            index_column: self.index_column.clone(),
        })
    }

    /// A new segment with `column` appended under `name`, replacing any
    /// existing column of that name in place.
    pub fn with_column(&self, name: &str, column: ArrayRef) -> StrataResult<Self> {
        let schema = self.batch.schema();
        let mut fields: Vec<Arc<Field>> = schema.fields().iter().cloned().collect();
        let mut columns: Vec<ArrayRef> = self.batch.columns().to_vec();

        let new_field = Arc::new(Field::new(name, column.data_type().clone(), true));
        match schema.index_of(name) {
            Ok(idx) => {
                fields[idx] = new_field;
                columns[idx] = column;
            }
            Err(_) => {
                fields.push(new_field);
                columns.push(column);
            }
        }

        let batch = RecordBatch::try_new(Arc::new(ArrowSchema::new(fields)), columns)?;
        Ok(Self {
            batch,
            index_column: self.index_column.clone(),
        })
    }

    /// Project onto the named columns, in the given order.
    pub fn project(&self, names: &[&str]) -> StrataResult<Self> {
        let schema = self.batch.schema();
        let indices = names
            .iter()
            .map(|n| {
                schema
                    .index_of(n)
                    .map_err(|_| StrataError::missing_column((*n).to_string()))
            })
            .collect::<StrataResult<Vec<_>>>()?;
        let batch = self.batch.project(&indices)?;
        let index_column = self
            .index_column
            .as_ref()
            .filter(|ic| names.contains(&ic.as_str()))
            .cloned();
        Ok(Self {
            batch,
            index_column,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema};

    fn test_segment() -> Segment {
        let schema = Arc::new(ArrowSchema::new(vec![
            Field::new(
                "ts",
                ArrowDataType::Timestamp(arrow::datatypes::TimeUnit::Nanosecond, None),
                false,
            ),
            Field::new("v", ArrowDataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(TimestampNanosecondArray::from(vec![10, 20, 30])),
                Arc::new(Int64Array::from(vec![1, 2, 3])),
            ],
        )
        .unwrap();
        Segment::with_index(batch, "ts").unwrap()
    }

    #[test]
    fn test_time_bounds() {
        let seg = test_segment();
        assert_eq!(seg.time_bounds().unwrap(), Some((10, 30)));
    }

    #[test]
    fn test_slice_preserves_index() {
        let seg = test_segment().slice(1, 2);
        assert_eq!(seg.num_rows(), 2);
        assert_eq!(seg.index_column(), Some("ts"));
        assert_eq!(seg.time_bounds().unwrap(), Some((20, 30)));
    }

    #[test]
    fn test_with_column_replaces() {
        let seg = test_segment();
        let replaced = seg
            .with_column("v", Arc::new(Int64Array::from(vec![7, 8, 9])) as ArrayRef)
            .unwrap();
        assert_eq!(replaced.num_columns(), 2);

        let appended = seg
            .with_column("w", Arc::new(Int64Array::from(vec![0, 0, 0])) as ArrayRef)
            .unwrap();
        assert_eq!(appended.num_columns(), 3);
    }

    #[test]
    fn test_descriptor() {
        let desc = test_segment().descriptor().unwrap();
        assert_eq!(desc.index_column.as_deref(), Some("ts"));
        assert_eq!(desc.fields[1], ("v".to_string(), DataType::Int64));
    }

    #[test]
    fn test_missing_index_column_rejected() {
        let schema = Arc::new(ArrowSchema::new(vec![Field::new(
            "v",
            ArrowDataType::Int64,
            true,
        )]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1]))]).unwrap();
        assert!(Segment::with_index(batch, "ts").is_err());
    }
}
