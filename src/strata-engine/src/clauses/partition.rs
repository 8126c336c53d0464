//! Partition clause: hash rows of a row slice into group buckets.
//!
//! First stage of group-by aggregation. The `Grouper` maps raw key
//! values to a 64-bit hash, the `Bucketizer` folds the hash onto a fixed
//! bucket count; entities from the same bucket across different row
//! slices share a bucket-id label and are regrouped by the aggregation
//! clause that follows.

use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array, UInt64Array};
use arrow::record_batch::RecordBatch;

use common_error::{StrataError, StrataResult};
use strata_core::{ColRange, OutputSchema, RangesAndKey, RowRange, Segment};

use super::{Clause, ClauseBehaviour, ClauseInfo, require_manager};
use crate::aggregate::{KeyValue, scalar_at};
use crate::component::{ComponentManager, EntityBundle, EntityId};
use crate::config::ProcessingConfig;
use crate::structuring::{structure_by_row_slice_entities, structure_by_row_slice_plan};
use crate::unit::ProcessingUnit;

/// Maps raw grouping values to 64-bit hashes.
pub trait Grouper: Send + Sync + std::fmt::Debug {
    fn hash_value(&self, value: &KeyValue) -> u64;
}

/// Seeded `ahash` grouper. The seeds are fixed so every row slice lands
/// equal keys in equal buckets.
#[derive(Debug, Default)]
pub struct HashGrouper;

impl Grouper for HashGrouper {
    fn hash_value(&self, value: &KeyValue) -> u64 {
        let state = ahash::RandomState::with_seeds(
            0x6a09_e667_f3bc_c908,
            0xbb67_ae85_84ca_a73b,
            0x3c6e_f372_fe94_f82b,
            0xa54f_f53a_5f1d_36f1,
        );
        let mut hasher = state.build_hasher();
        value.hash(&mut hasher);
        std::hash::Hasher::finish(&hasher)
    }
}

/// Maps a hash to one of `B` buckets, fixed per pipeline run.
pub trait Bucketizer: Send + Sync + std::fmt::Debug {
    fn for_buckets(buckets: usize) -> Self
    where
        Self: Sized;

    fn bucket(&self, hash: u64) -> u64;

    fn num_buckets(&self) -> usize;
}

#[derive(Debug)]
pub struct ModuloBucketizer {
    buckets: u64,
}

impl Bucketizer for ModuloBucketizer {
    fn for_buckets(buckets: usize) -> Self {
        Self {
            buckets: buckets.max(1) as u64,
        }
    }

    fn bucket(&self, hash: u64) -> u64 {
        hash % self.buckets
    }

    fn num_buckets(&self) -> usize {
        self.buckets as usize
    }
}

/// Hash-partition each row slice on the grouping column.
#[derive(Debug)]
pub struct PartitionClause<G: Grouper = HashGrouper, B: Bucketizer = ModuloBucketizer> {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
    grouping_column: String,
    grouper: G,
    bucketizer: B,
    dynamic_schema: bool,
}

impl PartitionClause<HashGrouper, ModuloBucketizer> {
    pub fn new(grouping_column: impl Into<String>) -> Self {
        let grouping_column = grouping_column.into();
        let clause_info = ClauseInfo {
            input_columns: Some([grouping_column.clone()].into_iter().collect()),
            modifies_row_count: true,
            ..ClauseInfo::default()
        };
        Self {
            clause_info,
            manager: None,
            grouping_column,
            grouper: HashGrouper,
            bucketizer: ModuloBucketizer::for_buckets(16),
            dynamic_schema: false,
        }
    }

    pub fn grouping_column(&self) -> &str {
        &self.grouping_column
    }
}

impl From<PartitionClause> for Clause {
    fn from(clause: PartitionClause) -> Self {
        Self::Partition(clause)
    }
}

impl<G: Grouper, B: Bucketizer> PartitionClause<G, B> {
    fn partition_segment(
        &self,
        segment: &Segment,
        row_range: RowRange,
    ) -> StrataResult<Vec<(u64, Segment, UInt64Array)>> {
        let Some(key_column) = segment.column_by_name(&self.grouping_column) else {
            // Every key is missing, so every row belongs to no group.
            if self.dynamic_schema {
                return Ok(vec![]);
            }
            return Err(StrataError::missing_column(self.grouping_column.clone()));
        };

        let mut bucket_rows: Vec<Vec<u32>> = vec![Vec::new(); self.bucketizer.num_buckets()];
        for row in 0..segment.num_rows() {
            // Rows with a missing grouping key belong to no group.
            let Some(value) = scalar_at(key_column, row)? else {
                continue;
            };
            let Some(key) = KeyValue::from_value(&value) else {
                continue;
            };
            let bucket = self.bucketizer.bucket(self.grouper.hash_value(&key));
            bucket_rows[bucket as usize].push(row as u32);
        }

        let mut partitions = Vec::new();
        for (bucket, rows) in bucket_rows.into_iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            let row_indexes: UInt64Array = rows
                .iter()
                .map(|&r| Some(row_range.start + u64::from(r)))
                .collect();
            let indices = UInt32Array::from(rows);

            let batch = segment.batch();
            let columns: Vec<ArrayRef> = batch
                .columns()
                .iter()
                .map(|c| arrow::compute::take(c, &indices, None))
                .collect::<Result<_, _>>()?;
            let taken = RecordBatch::try_new(batch.schema(), columns)?;
            let taken = match segment.index_column() {
                Some(index) => Segment::with_index(taken, index)?,
                None => Segment::new(taken),
            };
            partitions.push((bucket as u64, taken, row_indexes));
        }
        Ok(partitions)
    }
}

impl<G: Grouper, B: Bucketizer> ClauseBehaviour for PartitionClause<G, B> {
    fn name(&self) -> &'static str {
        "GroupBy"
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

        let mut output = Vec::new();
        for (bucket, partitioned, row_indexes) in
            self.partition_segment(&segment, row_range)?
        {
            let rows = partitioned.num_rows() as u64;
            let cols = partitioned.num_columns() as u64;
            let bundle = EntityBundle::new(
                partitioned,
                RowRange::new(row_range.start, row_range.start + rows),
                ColRange::new(0, cols),
            )
            .with_bucket_id(bucket)
            .with_row_indexes(row_indexes);
            output.push(manager.push(bundle));
        }
        Ok(output)
    }

    fn info(&self) -> &ClauseInfo {
        &self.clause_info
    }

    fn set_processing_config(&mut self, config: &ProcessingConfig) -> StrataResult<()> {
        self.bucketizer = B::for_buckets(config.partition_buckets);
        self.dynamic_schema = config.dynamic_schema;
        Ok(())
    }

    fn set_component_manager(&mut self, manager: Arc<ComponentManager>) {
        self.manager = Some(manager);
    }

    fn modify_schema(&self, schema: OutputSchema) -> StrataResult<OutputSchema> {
        schema.require_columns([self.grouping_column.as_str()], self.name())?;
        Ok(schema)
    }
}

impl<G: Grouper, B: Bucketizer> std::fmt::Display for PartitionClause<G, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GROUPBY Column[\"{}\"]", self.grouping_column)
    }
}
