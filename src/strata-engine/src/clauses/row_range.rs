//! Row-range clause: head, tail and explicit row windows.

use std::sync::Arc;

use common_error::{StrataError, StrataResult};
use strata_core::{OutputSchema, RangesAndKey, RowRange};

use super::{Clause, ClauseBehaviour, ClauseInfo, ProcessingStructure, require_manager};
use crate::component::{ComponentManager, EntityBundle, EntityId};
use crate::config::ProcessingConfig;
use crate::structuring::{structure_by_row_slice_entities, structure_by_row_slice_plan};

/// Which rows the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowRangeKind {
    Head(i64),
    Tail(i64),
    Range(i64, i64),
}

/// Discards rows outside a pipeline-wide window. `HEAD(n)`/`TAIL(n)`
/// normalise against the total row count handed over by
/// `set_processing_config`; explicit ranges accept negative values
/// counting from the end, clamped.
#[derive(Debug)]
pub struct RowRangeClause {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
    kind: RowRangeKind,
    /// Normalised window, zero-indexed, half-open.
    start: u64,
    end: u64,
}

impl RowRangeClause {
    pub fn head(n: i64) -> Self {
        Self::with_kind(RowRangeKind::Head(n))
    }

    pub fn tail(n: i64) -> Self {
        Self::with_kind(RowRangeKind::Tail(n))
    }

    pub fn range(start: i64, end: i64) -> Self {
        Self::with_kind(RowRangeKind::Range(start, end))
    }

    fn with_kind(kind: RowRangeKind) -> Self {
        Self {
            clause_info: ClauseInfo {
                input_structure: ProcessingStructure::All,
                modifies_row_count: true,
                ..ClauseInfo::default()
            },
            manager: None,
            kind,
            start: 0,
            end: 0,
        }
    }

    fn calculate_start_and_end(&mut self, total_rows: u64) {
        let total = total_rows as i64;
        let clamp = |v: i64| -> u64 {
            let wrapped = if v < 0 { total + v } else { v };
            wrapped.clamp(0, total) as u64
        };
        let (start, end) = match self.kind {
            RowRangeKind::Head(n) => (0, clamp(n)),
            RowRangeKind::Tail(n) => (clamp(-n), total_rows),
            RowRangeKind::Range(start, end) => (clamp(start), clamp(end)),
        };
        self.start = start;
        self.end = end.max(start);
    }

    const fn window(&self) -> RowRange {
        RowRange {
            start: self.start,
            end: self.end,
        }
    }
}

impl From<RowRangeClause> for Clause {
    fn from(clause: RowRangeClause) -> Self {
        Self::RowRange(clause)
    }
}

impl ClauseBehaviour for RowRangeClause {
    fn name(&self) -> &'static str {
        "RowRange"
    }

    fn structure_for_plan(&self, plan: &mut Vec<RangesAndKey>) -> StrataResult<Vec<Vec<usize>>> {
        let window = self.window();
        plan.retain(|rk| rk.row_range.intersects(&window));
        Ok(structure_by_row_slice_plan(plan))
    }

    fn structure_for_entities(
        &self,
        entity_ids: Vec<Vec<EntityId>>,
    ) -> StrataResult<Vec<Vec<EntityId>>> {
        let manager = require_manager(&self.manager, self.name())?;
        let window = self.window();
        let groups = structure_by_row_slice_entities(manager, entity_ids)?;
        let mut kept = Vec::new();
        for group in groups {
            let bundles = manager.get_many(&group)?;
            if bundles.iter().any(|b| b.row_range.intersects(&window)) {
                kept.push(group);
            }
        }
        Ok(kept)
    }

    fn process(&self, entity_ids: Vec<EntityId>) -> StrataResult<Vec<EntityId>> {
        let manager = require_manager(&self.manager, self.name())?;
        let window = self.window();
        let bundles = manager.get_many(&entity_ids)?;

        let mut output = Vec::new();
        for (&id, bundle) in entity_ids.iter().zip(&bundles) {
            let keep = bundle.row_range.intersection(&window);
            if keep.is_empty() {
                continue;
            }
            if keep == bundle.row_range {
                manager.bump(&[id])?;
                output.push(id);
                continue;
            }
            let offset = (keep.start - bundle.row_range.start) as usize;
            let trimmed = bundle.segment.slice(offset, keep.len() as usize);
            output.push(manager.push(EntityBundle::new(trimmed, keep, bundle.col_range)));
        }
        Ok(output)
    }

    fn info(&self) -> &ClauseInfo {
        &self.clause_info
    }

    fn set_processing_config(&mut self, config: &ProcessingConfig) -> StrataResult<()> {
        self.calculate_start_and_end(config.total_rows);
        Ok(())
    }

    fn set_component_manager(&mut self, manager: Arc<ComponentManager>) {
        self.manager = Some(manager);
    }

    fn modify_schema(&self, schema: OutputSchema) -> StrataResult<OutputSchema> {
        Ok(schema)
    }
}

impl std::fmt::Display for RowRangeClause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            RowRangeKind::Head(n) => write!(f, "HEAD({n})"),
            RowRangeKind::Tail(n) => write!(f, "TAIL({n})"),
            RowRangeKind::Range(start, end) => write!(f, "ROWRANGE({start}, {end})"),
        }
    }
}
