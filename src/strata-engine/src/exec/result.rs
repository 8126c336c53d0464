//! The assembled result of a pipeline run.

use arrow::record_batch::RecordBatch;

use common_error::StrataResult;
use strata_core::Segment;

/// A logical table: the pipeline's output segments in final row order.
#[derive(Debug, Default)]
pub struct QueryResult {
    segments: Vec<Segment>,
}

impl QueryResult {
    pub(crate) fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.num_rows() == 0)
    }

    pub fn num_rows(&self) -> usize {
        self.segments.iter().map(Segment::num_rows).sum()
    }

    /// Concatenate into one record batch; `None` when the result has no
    /// segments at all.
    pub fn concat(&self) -> StrataResult<Option<RecordBatch>> {
        let Some(first) = self.segments.first() else {
            return Ok(None);
        };
        let batches: Vec<RecordBatch> =
            self.segments.iter().map(|s| s.batch().clone()).collect();
        let merged = arrow::compute::concat_batches(&first.schema(), &batches)?;
        Ok(Some(merged))
    }
}
