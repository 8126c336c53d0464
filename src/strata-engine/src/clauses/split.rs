//! Split clause: divide segments into fixed-row chunks.

use std::sync::Arc;

use common_error::{StrataResult, user_check};
use strata_core::{OutputSchema, RangesAndKey, RowRange};

use super::{Clause, ClauseBehaviour, ClauseInfo, require_manager};
use crate::component::{ComponentManager, EntityBundle, EntityId};
use crate::structuring::{structure_by_row_slice_entities, structure_by_row_slice_plan};
use crate::unit::ProcessingUnit;

/// Re-chunks each incoming segment into pieces of `rows` rows; the last
/// chunk may be shorter.
#[derive(Debug)]
pub struct SplitClause {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
    rows: usize,
}

impl SplitClause {
    pub fn new(rows: usize) -> StrataResult<Self> {
        user_check!(rows > 0, "SplitClause chunk size must be positive");
        Ok(Self {
            clause_info: ClauseInfo {
                modifies_row_count: true,
                ..ClauseInfo::default()
            },
            manager: None,
            rows,
        })
    }
}

impl From<SplitClause> for Clause {
    fn from(clause: SplitClause) -> Self {
        Self::Split(clause)
    }
}

impl ClauseBehaviour for SplitClause {
    fn name(&self) -> &'static str {
        "Split"
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
        let manager = require_manager(&self.manager, self.name())?;
        let unit = ProcessingUnit::gather(manager, entity_ids)?;

        let mut output = Vec::new();
        for (&id, bundle) in unit.ids.iter().zip(&unit.bundles) {
            let total = bundle.segment.num_rows();
            if total <= self.rows {
                // Chunk already small enough: re-publish as-is.
                manager.bump(&[id])?;
                output.push(id);
                continue;
            }
            let mut offset = 0usize;
            while offset < total {
                let length = self.rows.min(total - offset);
                let chunk = bundle.segment.slice(offset, length);
                let start = bundle.row_range.start + offset as u64;
                output.push(manager.push(EntityBundle::new(
                    chunk,
                    RowRange::new(start, start + length as u64),
                    bundle.col_range,
                )));
                offset += length;
            }
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
}
