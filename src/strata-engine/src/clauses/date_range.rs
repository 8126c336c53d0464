//! Date-range clause: discard rows outside a timestamp window.

use std::sync::Arc;

use common_error::{StrataError, StrataResult};
use strata_core::{OutputSchema, RangesAndKey, RowRange, Timestamp};

use super::{Clause, ClauseBehaviour, ClauseInfo, require_manager};
use crate::component::{ComponentManager, EntityBundle, EntityId};
use crate::structuring::{structure_by_row_slice_entities, structure_by_row_slice_plan};

/// Keeps rows whose index timestamp lies in `[start, end]`, inclusive of
/// both ends. Plan entries whose catalog time range misses the window
/// are dropped before anything is fetched.
#[derive(Debug)]
pub struct DateRangeClause {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
    start: Timestamp,
    end: Timestamp,
}

impl DateRangeClause {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self {
            clause_info: ClauseInfo {
                modifies_row_count: true,
                ..ClauseInfo::default()
            },
            manager: None,
            start,
            end,
        }
    }

    pub const fn start(&self) -> Timestamp {
        self.start
    }

    pub const fn end(&self) -> Timestamp {
        self.end
    }
}

impl From<DateRangeClause> for Clause {
    fn from(clause: DateRangeClause) -> Self {
        Self::DateRange(clause)
    }
}

impl ClauseBehaviour for DateRangeClause {
    fn name(&self) -> &'static str {
        "DateRange"
    }

    fn structure_for_plan(&self, plan: &mut Vec<RangesAndKey>) -> StrataResult<Vec<Vec<usize>>> {
        plan.retain(|rk| rk.overlaps_time(self.start, self.end));
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
        let bundles = manager.get_many(&entity_ids)?;

        let mut output = Vec::new();
        for (&id, bundle) in entity_ids.iter().zip(&bundles) {
            let index = bundle.segment.index_values()?;
            let values = index.values();
            let from = values.partition_point(|&t| t < self.start);
            let to = values.partition_point(|&t| t <= self.end);
            if from >= to {
                continue;
            }
            if from == 0 && to == values.len() {
                manager.bump(&[id])?;
                output.push(id);
                continue;
            }
            let trimmed = bundle.segment.slice(from, to - from);
            let start = bundle.row_range.start + from as u64;
            output.push(manager.push(EntityBundle::new(
                trimmed,
                RowRange::new(start, start + (to - from) as u64),
                bundle.col_range,
            )));
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
        if schema.index_column.is_none() {
            return Err(StrataError::schema_error(
                "DateRange requires a timestamp-indexed schema",
            ));
        }
        Ok(schema)
    }
}

impl std::fmt::Display for DateRangeClause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DATE RANGE [{}, {}]", self.start, self.end)
    }
}
