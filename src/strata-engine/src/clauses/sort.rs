//! Sort clause: stable per-row-slice sort on one column.

use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array};
use arrow::record_batch::RecordBatch;

use common_error::{StrataError, StrataResult};
use strata_core::{ColRange, OutputSchema, RangesAndKey, Segment};

use super::{Clause, ClauseBehaviour, ClauseInfo, require_manager};
use crate::aggregate::{KeyValue, scalar_at};
use crate::component::{ComponentManager, EntityBundle, EntityId};
use crate::structuring::{structure_by_row_slice_entities, structure_by_row_slice_plan};
use crate::unit::ProcessingUnit;

/// Stable sort applied per row slice. External sort is not implemented;
/// the caller guarantees the slices fit in memory. `incompletes_after`
/// skips a plan prefix that is already known sorted.
#[derive(Debug)]
pub struct SortClause {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
    column: String,
    incompletes_after: usize,
}

impl SortClause {
    pub fn new(column: impl Into<String>, incompletes_after: usize) -> Self {
        let column = column.into();
        Self {
            clause_info: ClauseInfo {
                input_columns: None,
                ..ClauseInfo::default()
            },
            manager: None,
            column,
            incompletes_after,
        }
    }

}

/// Stable sort of a segment's rows by one column; equal keys keep their
/// input order, missing keys sort last.
pub(crate) fn stable_sort_by_column(segment: &Segment, column: &str) -> StrataResult<Segment> {
    let key = segment
        .column_by_name(column)
        .ok_or_else(|| StrataError::missing_column(column.to_string()))?;

    let mut order: Vec<u32> = (0..segment.num_rows() as u32).collect();
    let keys: Vec<Option<KeyValue>> = (0..segment.num_rows())
        .map(|row| {
            Ok(scalar_at(key, row)?
                .as_ref()
                .and_then(KeyValue::from_value))
        })
        .collect::<StrataResult<_>>()?;
    order.sort_by(|&a, &b| match (&keys[a as usize], &keys[b as usize]) {
        (Some(x), Some(y)) => x.sort_cmp(y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });

    let indices = UInt32Array::from(order);
    let batch = segment.batch();
    let columns: Vec<ArrayRef> = batch
        .columns()
        .iter()
        .map(|c| arrow::compute::take(c, &indices, None))
        .collect::<Result<_, _>>()?;
    let sorted = RecordBatch::try_new(batch.schema(), columns)?;
    match segment.index_column() {
        Some(index) => Segment::with_index(sorted, index),
        None => Ok(Segment::new(sorted)),
    }
}

impl From<SortClause> for Clause {
    fn from(clause: SortClause) -> Self {
        Self::Sort(clause)
    }
}

impl ClauseBehaviour for SortClause {
    fn name(&self) -> &'static str {
        "Sort"
    }

    fn structure_for_plan(&self, plan: &mut Vec<RangesAndKey>) -> StrataResult<Vec<Vec<usize>>> {
        // The prefix is compacted data already sorted on disk.
        plan.drain(..self.incompletes_after.min(plan.len()));
        Ok(structure_by_row_slice_plan(plan))
    }

    fn structure_for_entities(
        &self,
        entity_ids: Vec<Vec<EntityId>>,
    ) -> StrataResult<Vec<Vec<EntityId>>> {
        let manager = require_manager(&self.manager, self.name())?;
        structure_by_row_slice_entities(manager, entity_ids)
    }

    fn process(&self, entity_ids: Vec<EntityId>) -> StrataResult<Vec<EntityId>> {
        if entity_ids.is_empty() {
            return Ok(vec![]);
        }
        let manager = require_manager(&self.manager, self.name())?;
        let unit = ProcessingUnit::gather(manager, entity_ids)?;
        let segment = unit.combined_segment()?;
        let row_range = unit.row_range()?;

        let sorted = stable_sort_by_column(&segment, &self.column)?;
        let cols = sorted.num_columns() as u64;
        let bundle = EntityBundle::new(sorted, row_range, ColRange::new(0, cols));
        Ok(vec![manager.push(bundle)])
    }

    fn info(&self) -> &ClauseInfo {
        &self.clause_info
    }

    fn set_component_manager(&mut self, manager: Arc<ComponentManager>) {
        self.manager = Some(manager);
    }

    fn modify_schema(&self, schema: OutputSchema) -> StrataResult<OutputSchema> {
        schema.require_columns([self.column.as_str()], self.name())?;
        Ok(schema)
    }
}
