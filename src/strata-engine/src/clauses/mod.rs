//! The clause set: every operator of the read pipeline, behind one
//! polymorphic contract.
//!
//! Rather than type-erasing through trait objects, the closed clause set
//! is a tagged [`Clause`] enum with match-based dispatch; every variant
//! implements the same [`ClauseBehaviour`] contract.

mod aggregation;
mod column_stats;
mod concat;
mod date_range;
mod filter;
mod merge;
mod partition;
mod passthrough;
mod project;
mod remove_column_partitioning;
mod resample;
mod row_range;
mod sort;
mod split;

use std::collections::HashSet;
use std::sync::Arc;

use common_error::{StrataError, StrataResult};
use strata_core::{OutputSchema, RangesAndKey};

pub use aggregation::AggregationClause;
pub use column_stats::ColumnStatsGenerationClause;
pub use concat::{ConcatClause, JoinType};
pub use date_range::DateRangeClause;
pub use filter::FilterClause;
pub use merge::MergeClause;
pub use partition::{Bucketizer, Grouper, HashGrouper, ModuloBucketizer, PartitionClause};
pub use passthrough::PassthroughClause;
pub use project::ProjectClause;
pub use remove_column_partitioning::RemoveColumnPartitioningClause;
pub use resample::{BucketGenerator, ResampleClause, ResampleOrigin};
pub use row_range::RowRangeClause;
pub use sort::SortClause;
pub(crate) use sort::stable_sort_by_column;
pub use split::SplitClause;

use crate::component::{ComponentManager, EntityId};
use crate::config::ProcessingConfig;

/// How a clause wants its inputs batched before `process` is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingStructure {
    /// One unit per horizontal row slice.
    #[default]
    RowSlice,
    /// One unit per run of time buckets.
    TimeBucket,
    /// Everything in one unit.
    All,
    /// Joins several upstream pipelines.
    MultiInput,
}

/// How the final assembler must order a clause's output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputOrder {
    /// Concatenate in first-clause plan order (row ascending).
    #[default]
    PlanOrder,
    /// K-way merge the output units on the named column, ascending.
    SortedBy(String),
}

/// Static description of a clause.
#[derive(Debug, Clone)]
pub struct ClauseInfo {
    /// Columns the clause needs, or `None` for "all".
    pub input_columns: Option<HashSet<String>>,
    /// Whether column pruning may be pushed below this clause.
    pub can_combine_with_column_selection: bool,
    pub input_structure: ProcessingStructure,
    pub modifies_row_count: bool,
    pub output_order: OutputOrder,
}

impl Default for ClauseInfo {
    fn default() -> Self {
        Self {
            input_columns: None,
            can_combine_with_column_selection: true,
            input_structure: ProcessingStructure::RowSlice,
            modifies_row_count: false,
            output_order: OutputOrder::PlanOrder,
        }
    }
}

/// The capability set every clause implements.
pub trait ClauseBehaviour {
    /// Clause name for diagnostics.
    fn name(&self) -> &'static str;

    /// Invoked only when the clause is first in the pipeline. May
    /// reorder the plan in place; returns one group of plan indexes per
    /// processing unit to build.
    fn structure_for_plan(&self, plan: &mut Vec<RangesAndKey>) -> StrataResult<Vec<Vec<usize>>>;

    /// Regroup already-materialised entities per the clause's input
    /// requirement.
    fn structure_for_entities(
        &self,
        entity_ids: Vec<Vec<EntityId>>,
    ) -> StrataResult<Vec<Vec<EntityId>>>;

    /// The unit of work: read the listed entities, publish new ones.
    fn process(&self, entity_ids: Vec<EntityId>) -> StrataResult<Vec<EntityId>>;

    fn info(&self) -> &ClauseInfo;

    /// Called once after construction with pipeline-global facts.
    fn set_processing_config(&mut self, _config: &ProcessingConfig) -> StrataResult<()> {
        Ok(())
    }

    /// Wire the shared component manager.
    fn set_component_manager(&mut self, _manager: Arc<ComponentManager>) {}

    /// Schema inference; pure.
    fn modify_schema(&self, schema: OutputSchema) -> StrataResult<OutputSchema>;

    /// Only multi-input clauses may be asked to join schemas.
    fn join_schemas(&self, _schemas: Vec<OutputSchema>) -> StrataResult<OutputSchema> {
        Err(StrataError::assertion(format!(
            "{}::join_schemas should never be called",
            self.name()
        )))
    }
}

pub(crate) fn require_manager<'a>(
    manager: &'a Option<Arc<ComponentManager>>,
    clause: &str,
) -> StrataResult<&'a ComponentManager> {
    manager.as_deref().ok_or_else(|| {
        StrataError::assertion(format!("{clause} has no component manager wired"))
    })
}

/// The closed clause set.
#[derive(Debug)]
pub enum Clause {
    Passthrough(PassthroughClause),
    Filter(FilterClause),
    Project(ProjectClause),
    Partition(PartitionClause),
    Aggregation(AggregationClause),
    ResampleClosedLeft(ResampleClause<true>),
    ResampleClosedRight(ResampleClause<false>),
    RemoveColumnPartitioning(RemoveColumnPartitioningClause),
    Split(SplitClause),
    Sort(SortClause),
    Merge(MergeClause),
    ColumnStatsGeneration(ColumnStatsGenerationClause),
    RowRange(RowRangeClause),
    DateRange(DateRangeClause),
    Concat(ConcatClause),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Clause::Passthrough($inner) => $body,
            Clause::Filter($inner) => $body,
            Clause::Project($inner) => $body,
            Clause::Partition($inner) => $body,
            Clause::Aggregation($inner) => $body,
            Clause::ResampleClosedLeft($inner) => $body,
            Clause::ResampleClosedRight($inner) => $body,
            Clause::RemoveColumnPartitioning($inner) => $body,
            Clause::Split($inner) => $body,
            Clause::Sort($inner) => $body,
            Clause::Merge($inner) => $body,
            Clause::ColumnStatsGeneration($inner) => $body,
            Clause::RowRange($inner) => $body,
            Clause::DateRange($inner) => $body,
            Clause::Concat($inner) => $body,
        }
    };
}

impl ClauseBehaviour for Clause {
    fn name(&self) -> &'static str {
        dispatch!(self, c => c.name())
    }

    fn structure_for_plan(&self, plan: &mut Vec<RangesAndKey>) -> StrataResult<Vec<Vec<usize>>> {
        dispatch!(self, c => c.structure_for_plan(plan))
    }

    fn structure_for_entities(
        &self,
        entity_ids: Vec<Vec<EntityId>>,
    ) -> StrataResult<Vec<Vec<EntityId>>> {
        dispatch!(self, c => c.structure_for_entities(entity_ids))
    }

    fn process(&self, entity_ids: Vec<EntityId>) -> StrataResult<Vec<EntityId>> {
        dispatch!(self, c => c.process(entity_ids))
    }

    fn info(&self) -> &ClauseInfo {
        dispatch!(self, c => c.info())
    }

    fn set_processing_config(&mut self, config: &ProcessingConfig) -> StrataResult<()> {
        dispatch!(self, c => c.set_processing_config(config))
    }

    fn set_component_manager(&mut self, manager: Arc<ComponentManager>) {
        dispatch!(self, c => c.set_component_manager(manager));
    }

    fn modify_schema(&self, schema: OutputSchema) -> StrataResult<OutputSchema> {
        dispatch!(self, c => c.modify_schema(schema))
    }

    fn join_schemas(&self, schemas: Vec<OutputSchema>) -> StrataResult<OutputSchema> {
        dispatch!(self, c => c.join_schemas(schemas))
    }
}

impl std::fmt::Display for Clause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filter(c) => write!(f, "{c}"),
            Self::Project(c) => write!(f, "{c}"),
            Self::Partition(c) => write!(f, "{c}"),
            Self::Aggregation(c) => write!(f, "{c}"),
            Self::ResampleClosedLeft(c) => write!(f, "{c}"),
            Self::ResampleClosedRight(c) => write!(f, "{c}"),
            Self::RowRange(c) => write!(f, "{c}"),
            Self::DateRange(c) => write!(f, "{c}"),
            other => f.write_str(other.name()),
        }
    }
}
