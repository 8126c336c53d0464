//! The in-memory working set handed to one `process` call.

use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::{Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;

use common_error::{StrataError, StrataResult};
use strata_core::{RowRange, Segment};

use crate::component::{ComponentManager, EntityBundle, EntityId};

/// A non-empty ordered list of entity bundles a clause operates on.
///
/// Owns nothing: every bundle is an `Arc` into the component manager.
/// For a row-slice unit the bundles are the column shards of one slice;
/// `combined_segment` stitches them into a single logical segment.
#[derive(Debug)]
pub struct ProcessingUnit {
    pub ids: Vec<EntityId>,
    pub bundles: Vec<Arc<EntityBundle>>,
}

impl ProcessingUnit {
    /// Materialise the bundles behind `ids`, preserving order.
    pub fn gather(manager: &ComponentManager, ids: Vec<EntityId>) -> StrataResult<Self> {
        let bundles = manager.get_many(&ids)?;
        Ok(Self { ids, bundles })
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The row range shared by a row-slice unit's bundles.
    pub fn row_range(&self) -> StrataResult<RowRange> {
        let first = self
            .bundles
            .first()
            .ok_or_else(|| StrataError::assertion("processing unit is empty"))?;
        Ok(first.row_range)
    }

    /// The unit's bundles stitched into one segment, column shards in
    /// col-range order.
    pub fn combined_segment(&self) -> StrataResult<Segment> {
        if self.bundles.is_empty() {
            return Err(StrataError::assertion("processing unit is empty"));
        }
        if self.bundles.len() == 1 {
            return Ok(self.bundles[0].segment.as_ref().clone());
        }

        let mut shards: Vec<&Arc<EntityBundle>> = self.bundles.iter().collect();
        shards.sort_by_key(|b| b.col_range.start);

        let row_count = shards[0].segment.num_rows();
        let mut fields: Vec<Arc<Field>> = Vec::new();
        let mut columns: Vec<ArrayRef> = Vec::new();
        let mut index_column = None;

        for shard in shards {
            if shard.segment.num_rows() != row_count {
                return Err(StrataError::assertion(format!(
                    "column shards of row slice {:?} disagree on row count: {} vs {}",
                    shard.row_range,
                    row_count,
                    shard.segment.num_rows()
                )));
            }
            let schema = shard.segment.schema();
            for (field, column) in schema.fields().iter().zip(shard.segment.batch().columns()) {
                if fields.iter().any(|f: &Arc<Field>| f.name() == field.name()) {
                    continue;
                }
                fields.push(field.clone());
                columns.push(column.clone());
            }
            if index_column.is_none() {
                index_column = shard.segment.index_column().map(str::to_string);
            }
        }

        let batch = RecordBatch::try_new(Arc::new(ArrowSchema::new(fields)), columns)?;
        match index_column {
            Some(index) => Segment::with_index(batch, index),
            None => Ok(Segment::new(batch)),
        }
    }
}
