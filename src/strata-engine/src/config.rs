//! Pipeline-global processing configuration.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use strata_core::Timestamp;

/// Trade-off knob for clauses that can spend memory to go faster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineOptimisation {
    /// Materialise contiguous output arrays.
    #[default]
    Speed,
    /// Work column-at-a-time to bound peak memory.
    Memory,
}

/// Facts about the whole pipeline run, handed to every clause once after
/// construction via `set_processing_config`.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Missing columns become all-null columns instead of errors.
    pub dynamic_schema: bool,
    /// Total row count of the symbol being read.
    pub total_rows: u64,
    /// Min/max of the symbol's timestamp index, if indexed.
    pub index_range: Option<(Timestamp, Timestamp)>,
    /// Number of hash buckets used by the partition clause.
    pub partition_buckets: usize,
    pub optimisation: PipelineOptimisation,
    /// One-shot latch for the dynamic-schema missing-column warning.
    /// Owned here so the warning fires once per run, not once per clause.
    pub missing_column_warned: Arc<AtomicBool>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            dynamic_schema: false,
            total_rows: 0,
            index_range: None,
            partition_buckets: 16,
            optimisation: PipelineOptimisation::Speed,
            missing_column_warned: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ProcessingConfig {
    pub fn with_total_rows(mut self, total_rows: u64) -> Self {
        self.total_rows = total_rows;
        self
    }

    pub fn with_dynamic_schema(mut self, dynamic_schema: bool) -> Self {
        self.dynamic_schema = dynamic_schema;
        self
    }

    pub fn with_index_range(mut self, start: Timestamp, end: Timestamp) -> Self {
        self.index_range = Some((start, end));
        self
    }

    pub fn with_partition_buckets(mut self, buckets: usize) -> Self {
        self.partition_buckets = buckets.max(1);
        self
    }

    pub fn with_optimisation(mut self, optimisation: PipelineOptimisation) -> Self {
        self.optimisation = optimisation;
        self
    }
}
