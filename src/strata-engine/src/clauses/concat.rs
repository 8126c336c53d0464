//! Concat clause: multi-input assembly.

use std::sync::Arc;

use arrow::array::{ArrayRef, new_null_array};
use arrow::datatypes::{Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;

use common_error::{StrataError, StrataResult};
use strata_core::{ColRange, OutputSchema, RangesAndKey, RowRange, Segment};

use super::{Clause, ClauseBehaviour, ClauseInfo, ProcessingStructure, require_manager};
use crate::component::{ComponentManager, EntityBundle, EntityId};

/// Column treatment when concatenating inputs with differing schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    /// Intersection of column schemas.
    Inner,
    /// Union of column schemas, absences filled with nulls.
    Outer,
}

/// Stacks its inputs in argument order. `Inner` keeps only the shared
/// columns; `Outer` keeps all columns and null-fills the gaps.
#[derive(Debug)]
pub struct ConcatClause {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
    join_type: JoinType,
}

impl ConcatClause {
    pub fn new(join_type: JoinType) -> Self {
        Self {
            clause_info: ClauseInfo {
                input_structure: ProcessingStructure::MultiInput,
                ..ClauseInfo::default()
            },
            manager: None,
            join_type,
        }
    }

    /// The joined column layout over all input segments.
    fn joined_fields(&self, segments: &[&Segment]) -> StrataResult<Vec<Field>> {
        let mut fields: Vec<Field> = Vec::new();
        for (pos, segment) in segments.iter().enumerate() {
            match self.join_type {
                JoinType::Outer => {
                    for field in segment.schema().fields() {
                        if !fields.iter().any(|f| f.name() == field.name()) {
                            fields.push(Field::new(
                                field.name(),
                                field.data_type().clone(),
                                true,
                            ));
                        }
                    }
                }
                JoinType::Inner => {
                    if pos == 0 {
                        fields = segment
                            .schema()
                            .fields()
                            .iter()
                            .map(|f| Field::new(f.name(), f.data_type().clone(), true))
                            .collect();
                    } else {
                        fields.retain(|f| segment.column_by_name(f.name()).is_some());
                    }
                }
            }
        }
        if fields.is_empty() {
            return Err(StrataError::schema_error(
                "inner concat leaves no shared columns",
            ));
        }
        Ok(fields)
    }
}

impl From<ConcatClause> for Clause {
    fn from(clause: ConcatClause) -> Self {
        Self::Concat(clause)
    }
}

impl ClauseBehaviour for ConcatClause {
    fn name(&self) -> &'static str {
        "Concat"
    }

    fn structure_for_plan(&self, _plan: &mut Vec<RangesAndKey>) -> StrataResult<Vec<Vec<usize>>> {
        Err(StrataError::assertion(
            "ConcatClause should never be first in the pipeline",
        ))
    }

    fn structure_for_entities(
        &self,
        entity_ids: Vec<Vec<EntityId>>,
    ) -> StrataResult<Vec<Vec<EntityId>>> {
        // Inputs concatenate in argument order, so keep it.
        Ok(vec![entity_ids.into_iter().flatten().collect()])
    }

    fn process(&self, entity_ids: Vec<EntityId>) -> StrataResult<Vec<EntityId>> {
        if entity_ids.is_empty() {
            return Ok(vec![]);
        }
        let manager = require_manager(&self.manager, self.name())?;
        let bundles = manager.get_many(&entity_ids)?;
        let segments: Vec<&Segment> = bundles.iter().map(|b| b.segment.as_ref()).collect();

        let fields = self.joined_fields(&segments)?;
        let schema = Arc::new(ArrowSchema::new(fields));

        let mut output = Vec::new();
        let mut next_row = 0u64;
        for segment in segments {
            let columns: Vec<ArrayRef> = schema
                .fields()
                .iter()
                .map(|field| {
                    segment.column_by_name(field.name()).cloned().unwrap_or_else(|| {
                        new_null_array(field.data_type(), segment.num_rows())
                    })
                })
                .collect();
            let batch = RecordBatch::try_new(schema.clone(), columns)?;
            let aligned = match segment.index_column() {
                Some(index) if schema.column_with_name(index).is_some() => {
                    Segment::with_index(batch, index)?
                }
                _ => Segment::new(batch),
            };

            let rows = aligned.num_rows() as u64;
            let cols = aligned.num_columns() as u64;
            let bundle = EntityBundle::new(
                aligned,
                RowRange::new(next_row, next_row + rows),
                ColRange::new(0, cols),
            );
            next_row += rows;
            output.push(manager.push(bundle));
        }
        Ok(output)
    }

    fn info(&self) -> &ClauseInfo {
        &self.clause_info
    }

    fn set_component_manager(&mut self, manager: Arc<ComponentManager>) {
        self.manager = Some(manager);
    }

    fn modify_schema(&self, schema: OutputSchema) -> StrataResult<OutputSchema> {
        Ok(schema)
    }

    fn join_schemas(&self, schemas: Vec<OutputSchema>) -> StrataResult<OutputSchema> {
        let mut iter = schemas.into_iter();
        let Some(mut joined) = iter.next() else {
            return Ok(OutputSchema::default());
        };
        for schema in iter {
            joined = match self.join_type {
                JoinType::Outer => joined.union(&schema)?,
                JoinType::Inner => joined.intersection(&schema)?,
            };
        }
        Ok(joined)
    }
}

impl std::fmt::Display for ConcatClause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.join_type {
            JoinType::Inner => f.write_str("CONCAT(INNER)"),
            JoinType::Outer => f.write_str("CONCAT(OUTER)"),
        }
    }
}
