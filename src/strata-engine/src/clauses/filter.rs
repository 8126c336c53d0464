//! Filter clause: keep the rows a predicate expression selects.

use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray};
use arrow::record_batch::RecordBatch;

use common_error::{StrataError, StrataResult};
use strata_core::{ColRange, OutputSchema, RangesAndKey, RowRange, Segment};

use super::{Clause, ClauseBehaviour, ClauseInfo, require_manager};
use crate::component::{ComponentManager, EntityBundle, EntityId};
use crate::config::{PipelineOptimisation, ProcessingConfig};
use crate::expr::{ExprEvaluator, ExpressionContext, RootKind};
use crate::structuring::{structure_by_row_slice_entities, structure_by_row_slice_plan};
use crate::unit::ProcessingUnit;

/// Evaluates a predicate expression per row slice and emits only the
/// selected rows.
#[derive(Debug)]
pub struct FilterClause {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
    expression_context: Arc<ExpressionContext>,
    config: ProcessingConfig,
    optimisation: PipelineOptimisation,
}

impl FilterClause {
    /// Build a filter from an expression whose root yields a bitset.
    pub fn new(
        expression_context: ExpressionContext,
        optimisation: Option<PipelineOptimisation>,
    ) -> StrataResult<Self> {
        if expression_context.root_kind()? != RootKind::Bitset {
            return Err(StrataError::invalid_user_argument(
                "FilterClause AST would produce a column, not a bitset",
            ));
        }
        let clause_info = ClauseInfo {
            input_columns: Some(expression_context.input_columns()?),
            modifies_row_count: true,
            ..ClauseInfo::default()
        };
        Ok(Self {
            clause_info,
            manager: None,
            expression_context: Arc::new(expression_context),
            config: ProcessingConfig::default(),
            optimisation: optimisation.unwrap_or_default(),
        })
    }

    fn filter_segment(&self, segment: &Segment, mask: &BooleanArray) -> StrataResult<Segment> {
        match self.optimisation {
            PipelineOptimisation::Speed => segment.filter(mask),
            // Work one column at a time to bound peak memory.
            PipelineOptimisation::Memory => {
                let batch = segment.batch();
                let mut columns: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());
                for column in batch.columns() {
                    columns.push(arrow::compute::filter(column, mask)?);
                }
                let filtered = RecordBatch::try_new(batch.schema(), columns)?;
                match segment.index_column() {
                    Some(index) => Segment::with_index(filtered, index),
                    None => Ok(Segment::new(filtered)),
                }
            }
        }
    }
}

impl From<FilterClause> for Clause {
    fn from(clause: FilterClause) -> Self {
        Self::Filter(clause)
    }
}

impl ClauseBehaviour for FilterClause {
    fn name(&self) -> &'static str {
        "Filter"
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

        let evaluator = ExprEvaluator::new(&self.expression_context, &self.config);
        let mask = evaluator.evaluate_bitset(segment.batch())?;

        let kept = mask.true_count();
        if kept == 0 {
            return Ok(vec![]);
        }
        if kept == segment.num_rows() {
            // Fast path: every row survives, re-publish the inputs.
            manager.bump(&unit.ids)?;
            return Ok(unit.ids);
        }

        let filtered = self.filter_segment(&segment, &mask)?;
        let col_count = filtered.num_columns() as u64;
        let bundle = EntityBundle::new(
            filtered,
            RowRange::new(row_range.start, row_range.start + kept as u64),
            ColRange::new(0, col_count),
        );
        Ok(vec![manager.push(bundle)])
    }

    fn info(&self) -> &ClauseInfo {
        &self.clause_info
    }

    fn set_processing_config(&mut self, config: &ProcessingConfig) -> StrataResult<()> {
        self.config = config.clone();
        if self.optimisation == PipelineOptimisation::Speed {
            self.optimisation = config.optimisation;
        }
        Ok(())
    }

    fn set_component_manager(&mut self, manager: Arc<ComponentManager>) {
        self.manager = Some(manager);
    }

    fn modify_schema(&self, mut schema: OutputSchema) -> StrataResult<OutputSchema> {
        if let Some(required) = &self.clause_info.input_columns {
            schema.require_columns(required.iter().map(String::as_str), self.name())?;
        }
        schema.make_sparse();
        Ok(schema)
    }
}

impl std::fmt::Display for FilterClause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut columns: Vec<&str> = self
            .clause_info
            .input_columns
            .as_ref()
            .map(|cols| cols.iter().map(String::as_str).collect())
            .unwrap_or_default();
        columns.sort_unstable();
        write!(f, "WHERE[{}]", columns.join(", "))
    }
}
