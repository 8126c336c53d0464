//! Clause pipeline execution engine for Strata.
//!
//! This crate is the read path of the storage engine: a user's clause
//! list (filter, project, group-by, resample, merge, ...) is planned
//! over the segments of a symbol, streamed through the clause chain and
//! reassembled into a result whose schema is known up front.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌─────────────────┐    ┌──────────────────┐
//! │ RangesAndKey │ ─▶ │ structuring     │ ─▶ │ PipelineRunner   │
//! │ plan         │    │ (row slices,    │    │ (fetch, process, │
//! │              │    │  time buckets)  │    │  assemble)       │
//! └──────────────┘    └─────────────────┘    └──────────────────┘
//!                                                     │
//!                                                     ▼
//!                                            ComponentManager
//!                                            (entity bundles)
//! ```
//!
//! # Key Components
//!
//! - [`Clause`]: tagged variant over the closed clause set; every
//!   variant implements the [`ClauseBehaviour`] contract
//!   (`structure_for_plan` / `structure_for_entities` / `process` /
//!   `modify_schema` / `join_schemas`).
//! - [`ComponentManager`]: striped, refcounted store handing short-lived
//!   entity bundles between clauses by opaque [`EntityId`].
//! - [`expr`]: name-keyed expression DAGs plus the post-order evaluator
//!   behind the filter and project clauses.
//! - [`aggregate`]: two-phase (combine + finalize) aggregation partials
//!   shared by group-by and resample.
//! - [`PipelineRunner`]: bounded-concurrency driver with storage retry,
//!   backpressure against live bundle count, cooperative cancellation
//!   and deterministic error surfacing.
//!
//! [`Clause`]: clauses::Clause
//! [`ClauseBehaviour`]: clauses::ClauseBehaviour
//! [`ComponentManager`]: component::ComponentManager
//! [`EntityId`]: component::EntityId
//! [`PipelineRunner`]: exec::PipelineRunner

pub mod aggregate;
pub mod clauses;
pub mod component;
pub mod config;
pub mod exec;
pub mod expr;
pub mod read_options;
pub mod structuring;
pub mod unit;

// Re-export commonly used types
pub use aggregate::{AggregationOperator, NamedAggregator};
pub use clauses::{
    AggregationClause, Clause, ClauseBehaviour, ClauseInfo, ColumnStatsGenerationClause,
    ConcatClause, DateRangeClause, FilterClause, JoinType, MergeClause, OutputOrder,
    PartitionClause, PassthroughClause, ProcessingStructure, ProjectClause,
    RemoveColumnPartitioningClause, ResampleClause, ResampleOrigin, RowRangeClause, SortClause,
    SplitClause,
};
pub use component::{ComponentManager, EntityBundle, EntityId};
pub use config::{PipelineOptimisation, ProcessingConfig};
pub use exec::{CancellationHandle, PipelineRunner, QueryResult, RuntimeConfig};
pub use read_options::{OutputFormat, ReadOptions};
pub use structuring::ResampleBoundary;
