//! Column-stats generation clause: per-segment summaries for index
//! pruning.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt64Array};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;

use common_error::{StrataError, StrataResult};
use strata_core::{
    ColRange, DataType, FieldDef, OutputSchema, RangesAndKey, RowRange, Segment,
};

use super::{Clause, ClauseBehaviour, ClauseInfo, require_manager};
use crate::aggregate::{AggPartial, AggregationOperator, build_scalar_column, scalar_at};
use crate::component::{ComponentManager, EntityBundle, EntityId};
use crate::structuring::{structure_by_row_slice_entities, structure_by_row_slice_plan};
use crate::unit::ProcessingUnit;

/// Computes min/max/null-count per requested column per row slice and
/// emits one summary row per slice.
#[derive(Debug)]
pub struct ColumnStatsGenerationClause {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
    columns: Vec<String>,
}

impl ColumnStatsGenerationClause {
    pub fn new(columns: Vec<String>) -> StrataResult<Self> {
        if columns.is_empty() {
            return Err(StrataError::invalid_user_argument(
                "column stats generation needs at least one column",
            ));
        }
        let clause_info = ClauseInfo {
            input_columns: Some(columns.iter().cloned().collect()),
            can_combine_with_column_selection: false,
            modifies_row_count: true,
            ..ClauseInfo::default()
        };
        Ok(Self {
            clause_info,
            manager: None,
            columns,
        })
    }

    fn stats_for(&self, segment: &Segment, row_range: RowRange) -> StrataResult<Segment> {
        let mut fields = vec![
            Field::new("start_index", ArrowDataType::UInt64, false),
            Field::new("end_index", ArrowDataType::UInt64, false),
        ];
        let mut columns: Vec<ArrayRef> = vec![
            Arc::new(UInt64Array::from(vec![row_range.start])),
            Arc::new(UInt64Array::from(vec![row_range.end])),
        ];

        for name in &self.columns {
            let column = segment
                .column_by_name(name)
                .ok_or_else(|| StrataError::missing_column(name.clone()))?;
            let data_type = DataType::from_arrow(column.data_type()).ok_or_else(|| {
                StrataError::schema_error(format!(
                    "cannot generate stats for column '{name}' of type {}",
                    column.data_type()
                ))
            })?;

            let mut min = AggPartial::new(AggregationOperator::Min, &data_type)?;
            let mut max = AggPartial::new(AggregationOperator::Max, &data_type)?;
            for row in 0..column.len() {
                if let Some(value) = scalar_at(column, row)? {
                    min.update(&value, row as u64)?;
                    max.update(&value, row as u64)?;
                }
            }

            fields.push(Field::new(format!("{name}__min"), data_type.to_arrow(), true));
            columns.push(build_scalar_column(&data_type, &[min.finalize()])?);
            fields.push(Field::new(format!("{name}__max"), data_type.to_arrow(), true));
            columns.push(build_scalar_column(&data_type, &[max.finalize()])?);
            fields.push(Field::new(
                format!("{name}__null_count"),
                ArrowDataType::UInt64,
                false,
            ));
            columns.push(Arc::new(UInt64Array::from(vec![column.null_count() as u64])));
        }

        let batch = RecordBatch::try_new(Arc::new(ArrowSchema::new(fields)), columns)?;
        Ok(Segment::new(batch))
    }
}

impl From<ColumnStatsGenerationClause> for Clause {
    fn from(clause: ColumnStatsGenerationClause) -> Self {
        Self::ColumnStatsGeneration(clause)
    }
}

impl ClauseBehaviour for ColumnStatsGenerationClause {
    fn name(&self) -> &'static str {
        "ColumnStatsGeneration"
    }

    fn structure_for_plan(&self, plan: &mut Vec<RangesAndKey>) -> StrataResult<Vec<Vec<usize>>> {
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

        let stats = self.stats_for(&segment, row_range)?;
        let cols = stats.num_columns() as u64;
        let bundle = EntityBundle::new(
            stats,
            RowRange::new(row_range.start, row_range.start + 1),
            ColRange::new(0, cols),
        );
        Ok(vec![manager.push(bundle)])
    }

    fn info(&self) -> &ClauseInfo {
        &self.clause_info
    }

    fn set_component_manager(&mut self, manager: Arc<ComponentManager>) {
        self.manager = Some(manager);
    }

    fn modify_schema(&self, schema: OutputSchema) -> StrataResult<OutputSchema> {
        schema.require_columns(self.columns.iter().map(String::as_str), self.name())?;

        let mut output = OutputSchema::new(vec![
            FieldDef::new("start_index", DataType::UInt64),
            FieldDef::new("end_index", DataType::UInt64),
        ])
        .with_dynamic(schema.dynamic);
        for name in &self.columns {
            let data_type = schema
                .field(name)
                .map(|f| f.data_type.clone())
                .unwrap_or(DataType::Float64);
            output.add_field(FieldDef::new(format!("{name}__min"), data_type.clone()));
            output.add_field(FieldDef::new(format!("{name}__max"), data_type));
            output.add_field(FieldDef::new(
                format!("{name}__null_count"),
                DataType::UInt64,
            ));
        }
        Ok(output)
    }
}
