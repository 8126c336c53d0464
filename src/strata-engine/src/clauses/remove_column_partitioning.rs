//! Collapse column-sharded row slices into single segments.

use std::sync::Arc;

use common_error::StrataResult;
use strata_core::{ColRange, OutputSchema, RangesAndKey};

use super::{Clause, ClauseBehaviour, ClauseInfo, require_manager};
use crate::component::{ComponentManager, EntityBundle, EntityId};
use crate::structuring::{structure_by_row_slice_entities, structure_by_row_slice_plan};
use crate::unit::ProcessingUnit;

/// Joins the column shards of each row slice into one segment spanning
/// the whole column range. Repartitioning is slow on wide tables; the
/// pipeline driver emits a once-per-run warning when this clause is
/// present.
#[derive(Debug)]
pub struct RemoveColumnPartitioningClause {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
    incompletes_after: usize,
}

impl RemoveColumnPartitioningClause {
    pub fn new(incompletes_after: usize) -> Self {
        Self {
            clause_info: ClauseInfo {
                can_combine_with_column_selection: false,
                ..ClauseInfo::default()
            },
            manager: None,
            incompletes_after,
        }
    }
}

impl Default for RemoveColumnPartitioningClause {
    fn default() -> Self {
        Self::new(0)
    }
}

impl From<RemoveColumnPartitioningClause> for Clause {
    fn from(clause: RemoveColumnPartitioningClause) -> Self {
        Self::RemoveColumnPartitioning(clause)
    }
}

impl ClauseBehaviour for RemoveColumnPartitioningClause {
    fn name(&self) -> &'static str {
        "RemoveColumnPartitioning"
    }

    fn structure_for_plan(&self, plan: &mut Vec<RangesAndKey>) -> StrataResult<Vec<Vec<usize>>> {
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

        if unit.bundles.len() == 1 {
            manager.bump(&unit.ids)?;
            return Ok(unit.ids);
        }

        let segment = unit.combined_segment()?;
        let row_range = unit.row_range()?;
        let cols = segment.num_columns() as u64;
        let bundle = EntityBundle::new(segment, row_range, ColRange::new(0, cols));
        Ok(vec![manager.push(bundle)])
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
}
