//! Identity clause.

use std::sync::Arc;

use common_error::StrataResult;
use strata_core::{OutputSchema, RangesAndKey};

use super::{Clause, ClauseBehaviour, ClauseInfo, require_manager};
use crate::component::{ComponentManager, EntityId};
use crate::structuring::preserve_order_plan;

/// Forwards its inputs untouched, preserving the caller's plan order.
#[derive(Debug, Default)]
pub struct PassthroughClause {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
}

impl PassthroughClause {
    pub fn new() -> Self {
        Self::default()
    }
}

impl From<PassthroughClause> for Clause {
    fn from(clause: PassthroughClause) -> Self {
        Self::Passthrough(clause)
    }
}

impl ClauseBehaviour for PassthroughClause {
    fn name(&self) -> &'static str {
        "Passthrough"
    }

    fn structure_for_plan(&self, plan: &mut Vec<RangesAndKey>) -> StrataResult<Vec<Vec<usize>>> {
        Ok(preserve_order_plan(plan))
    }

    fn structure_for_entities(
        &self,
        entity_ids: Vec<Vec<EntityId>>,
    ) -> StrataResult<Vec<Vec<EntityId>>> {
        Ok(entity_ids)
    }

    fn process(&self, entity_ids: Vec<EntityId>) -> StrataResult<Vec<EntityId>> {
        let manager = require_manager(&self.manager, self.name())?;
        manager.bump(&entity_ids)?;
        Ok(entity_ids)
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
