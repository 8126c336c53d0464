//! Project clause: append a computed column.

use std::sync::Arc;

use common_error::{StrataError, StrataResult};
use strata_core::{ColRange, FieldDef, OutputSchema, RangesAndKey};

use super::{Clause, ClauseBehaviour, ClauseInfo, require_manager};
use crate::component::{ComponentManager, EntityBundle, EntityId};
use crate::config::ProcessingConfig;
use crate::expr::{ExprEvaluator, ExpressionContext, RootKind};
use crate::structuring::{structure_by_row_slice_entities, structure_by_row_slice_plan};
use crate::unit::ProcessingUnit;

/// Evaluates an expression per row slice and publishes the result as a
/// new column, replacing an existing column of the same name.
#[derive(Debug)]
pub struct ProjectClause {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
    output_column: String,
    expression_context: Arc<ExpressionContext>,
    config: ProcessingConfig,
}

impl ProjectClause {
    /// Build a projection from an expression whose root yields a column
    /// or a literal broadcast.
    pub fn new(
        expression_context: ExpressionContext,
        output_column: impl Into<String>,
    ) -> StrataResult<Self> {
        if expression_context.root_kind()? != RootKind::Column {
            return Err(StrataError::invalid_user_argument(
                "ProjectClause AST would not produce a column",
            ));
        }
        let clause_info = ClauseInfo {
            input_columns: Some(expression_context.input_columns()?),
            ..ClauseInfo::default()
        };
        Ok(Self {
            clause_info,
            manager: None,
            output_column: output_column.into(),
            expression_context: Arc::new(expression_context),
            config: ProcessingConfig::default(),
        })
    }

    pub fn output_column(&self) -> &str {
        &self.output_column
    }
}

impl From<ProjectClause> for Clause {
    fn from(clause: ProjectClause) -> Self {
        Self::Project(clause)
    }
}

impl ClauseBehaviour for ProjectClause {
    fn name(&self) -> &'static str {
        "Project"
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
        let column = evaluator.evaluate_column(segment.batch())?;
        let projected = segment.with_column(&self.output_column, column)?;

        let col_count = projected.num_columns() as u64;
        let bundle = EntityBundle::new(projected, row_range, ColRange::new(0, col_count));
        Ok(vec![manager.push(bundle)])
    }

    fn info(&self) -> &ClauseInfo {
        &self.clause_info
    }

    fn set_processing_config(&mut self, config: &ProcessingConfig) -> StrataResult<()> {
        self.config = config.clone();
        Ok(())
    }

    fn set_component_manager(&mut self, manager: Arc<ComponentManager>) {
        self.manager = Some(manager);
    }

    fn modify_schema(&self, mut schema: OutputSchema) -> StrataResult<OutputSchema> {
        if let Some(required) = &self.clause_info.input_columns {
            schema.require_columns(required.iter().map(String::as_str), self.name())?;
        }
        let inferred = self.expression_context.infer_type(&schema)?;
        schema.add_field(FieldDef::new(self.output_column.clone(), inferred));
        Ok(schema)
    }
}

impl std::fmt::Display for ProjectClause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PROJECT Column[\"{}\"]", self.output_column)
    }
}
