//! Merge clause: k-way ordered merge of sorted streams.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt64Array, new_null_array};
use arrow::compute::interleave;
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;

use common_error::{StrataError, StrataResult};
use strata_core::{
    ColRange, DataType, FieldDef, OutputSchema, RangesAndKey, RowRange, Segment,
};

use super::{Clause, ClauseBehaviour, ClauseInfo, ProcessingStructure, require_manager};
use crate::component::{ComponentManager, EntityBundle, EntityId};
use crate::config::ProcessingConfig;

/// Name of the synthetic stream-id column.
const SYMBOL_COLUMN: &str = "symbol";

/// Merges its input entities on their timestamp index. Every input must
/// already be sorted on that index; equal timestamps break stably by
/// input-stream order.
#[derive(Debug)]
pub struct MergeClause {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
    add_symbol_column: bool,
    dynamic_schema: bool,
}

impl MergeClause {
    pub fn new(add_symbol_column: bool) -> Self {
        Self {
            clause_info: ClauseInfo {
                input_structure: ProcessingStructure::All,
                ..ClauseInfo::default()
            },
            manager: None,
            add_symbol_column,
            dynamic_schema: false,
        }
    }

    /// The merged column layout: index first, then columns in
    /// first-seen order. Without a dynamic schema the streams must
    /// agree exactly.
    fn merged_fields(&self, streams: &[&Segment]) -> StrataResult<Vec<(String, ArrowDataType)>> {
        let mut fields: Vec<(String, ArrowDataType)> = Vec::new();
        for stream in streams {
            for field in stream.schema().fields() {
                match fields.iter().find(|(name, _)| name == field.name()) {
                    Some((name, dt)) => {
                        if dt != field.data_type() {
                            return Err(StrataError::schema_error(format!(
                                "merge streams disagree on type of column '{name}'"
                            )));
                        }
                    }
                    None => {
                        fields.push((field.name().clone(), field.data_type().clone()));
                    }
                }
            }
        }
        if !self.dynamic_schema {
            for stream in streams {
                if stream.num_columns() != fields.len() {
                    return Err(StrataError::schema_error(
                        "merge streams have mismatched schemas and dynamic schema is off",
                    ));
                }
            }
        }
        Ok(fields)
    }

    /// K-way merge positions: `(stream, row)` per output row.
    fn merge_order(&self, streams: &[&Segment]) -> StrataResult<Vec<(usize, usize)>> {
        let indexes = streams
            .iter()
            .map(|s| s.index_values())
            .collect::<StrataResult<Vec<_>>>()?;

        let mut cursors = vec![0usize; streams.len()];
        let total: usize = streams.iter().map(|s| s.num_rows()).sum();
        let mut order = Vec::with_capacity(total);
        loop {
            let mut best: Option<(i64, usize)> = None;
            for (stream, cursor) in cursors.iter().enumerate() {
                if *cursor >= indexes[stream].len() {
                    continue;
                }
                let t = indexes[stream].value(*cursor);
                // Strict less-than keeps ties in stream order.
                if best.is_none_or(|(bt, _)| t < bt) {
                    best = Some((t, stream));
                }
            }
            let Some((_, stream)) = best else { break };
            order.push((stream, cursors[stream]));
            cursors[stream] += 1;
        }
        Ok(order)
    }
}

impl From<MergeClause> for Clause {
    fn from(clause: MergeClause) -> Self {
        Self::Merge(clause)
    }
}

impl ClauseBehaviour for MergeClause {
    fn name(&self) -> &'static str {
        "Merge"
    }

    fn structure_for_plan(&self, _plan: &mut Vec<RangesAndKey>) -> StrataResult<Vec<Vec<usize>>> {
        Err(StrataError::assertion(
            "MergeClause should never be first in the pipeline",
        ))
    }

    fn structure_for_entities(
        &self,
        entity_ids: Vec<Vec<EntityId>>,
    ) -> StrataResult<Vec<Vec<EntityId>>> {
        Ok(vec![entity_ids.into_iter().flatten().collect()])
    }

    fn process(&self, entity_ids: Vec<EntityId>) -> StrataResult<Vec<EntityId>> {
        if entity_ids.is_empty() {
            return Ok(vec![]);
        }
        let manager = require_manager(&self.manager, self.name())?;
        let bundles = manager.get_many(&entity_ids)?;
        let streams: Vec<&Segment> = bundles.iter().map(|b| b.segment.as_ref()).collect();

        let fields = self.merged_fields(&streams)?;
        let order = self.merge_order(&streams)?;

        let mut out_fields: Vec<Field> = Vec::with_capacity(fields.len() + 1);
        let mut out_columns: Vec<ArrayRef> = Vec::with_capacity(fields.len() + 1);
        for (name, data_type) in &fields {
            // Streams missing the column contribute nulls.
            let backing: Vec<ArrayRef> = streams
                .iter()
                .map(|s| {
                    s.column_by_name(name)
                        .cloned()
                        .unwrap_or_else(|| new_null_array(data_type, s.num_rows()))
                })
                .collect();
            let refs: Vec<&dyn Array> = backing.iter().map(|a| a.as_ref()).collect();
            out_fields.push(Field::new(name, data_type.clone(), true));
            out_columns.push(interleave(&refs, &order)?);
        }
        if self.add_symbol_column {
            let symbols: UInt64Array = order.iter().map(|&(s, _)| Some(s as u64)).collect();
            out_fields.push(Field::new(SYMBOL_COLUMN, ArrowDataType::UInt64, false));
            out_columns.push(Arc::new(symbols));
        }

        let batch = RecordBatch::try_new(Arc::new(ArrowSchema::new(out_fields)), out_columns)?;
        let index_name = streams[0]
            .index_column()
            .ok_or_else(|| StrataError::schema_error("merge inputs have no index column"))?
            .to_string();
        let merged = Segment::with_index(batch, index_name)?;

        let rows = merged.num_rows() as u64;
        let cols = merged.num_columns() as u64;
        let bundle = EntityBundle::new(merged, RowRange::new(0, rows), ColRange::new(0, cols));
        Ok(vec![manager.push(bundle)])
    }

    fn info(&self) -> &ClauseInfo {
        &self.clause_info
    }

    fn set_processing_config(&mut self, config: &ProcessingConfig) -> StrataResult<()> {
        self.dynamic_schema = config.dynamic_schema;
        Ok(())
    }

    fn set_component_manager(&mut self, manager: Arc<ComponentManager>) {
        self.manager = Some(manager);
    }

    fn modify_schema(&self, mut schema: OutputSchema) -> StrataResult<OutputSchema> {
        if schema.index_column.is_none() {
            return Err(StrataError::schema_error(
                "Merge requires a timestamp-indexed schema",
            ));
        }
        if self.add_symbol_column {
            schema.add_field(FieldDef::new(SYMBOL_COLUMN, DataType::UInt64));
        }
        Ok(schema)
    }
}
