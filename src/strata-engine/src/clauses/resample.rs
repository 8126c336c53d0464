//! Resample clause: sorted aggregation over caller-defined time buckets.

use std::sync::Arc;

use ahash::AHashMap;
use arrow::array::{ArrayRef, TimestampNanosecondArray};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, TimeUnit};
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use common_error::{StrataError, StrataResult};
use strata_core::{
    ColRange, DataType, FieldDef, OutputSchema, RangesAndKey, RowRange, Segment, Timestamp,
};

use super::{Clause, ClauseBehaviour, ClauseInfo, ProcessingStructure, require_manager};
use crate::aggregate::sorted::{BucketInput, aggregate_buckets};
use crate::aggregate::{NamedAggregator, build_column};
use crate::component::{ComponentManager, EntityBundle, EntityId};
use crate::config::ProcessingConfig;
use crate::structuring::{ResampleBoundary, TimeBucketGroup, assign_bucket_owners};
use crate::unit::ProcessingUnit;

/// Where the bucket grid is anchored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResampleOrigin {
    /// A preset name interpreted by the boundary generator
    /// ("epoch", "start_day", ...).
    Preset(String),
    /// An explicit anchor timestamp.
    Timestamp(Timestamp),
}

impl Default for ResampleOrigin {
    fn default() -> Self {
        Self::Preset("epoch".to_string())
    }
}

/// Caller-supplied bucket boundary generator.
///
/// Injected so the core carries no calendar-library dependency: the host
/// interprets `rule` ("3s", "1h", ...) and returns a strictly increasing
/// boundary sequence covering `[first_ts, last_ts]`.
pub type BucketGenerator = Arc<
    dyn Fn(Timestamp, Timestamp, &str, ResampleBoundary, Timestamp, &ResampleOrigin) -> Vec<Timestamp>
        + Send
        + Sync,
>;

/// Time-bucketed aggregation. `CLOSED_LEFT` shapes the interval
/// semantics: buckets are `[b_i, b_{i+1})` when true, `(b_i, b_{i+1}]`
/// when false.
pub struct ResampleClause<const CLOSED_LEFT: bool> {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
    rule: String,
    label_boundary: ResampleBoundary,
    /// User date range intersected with the symbol's timestamp span.
    date_range: Option<(Timestamp, Timestamp)>,
    user_date_range: Option<(Timestamp, Timestamp)>,
    generate_bucket_boundaries: BucketGenerator,
    bucket_boundaries: Vec<Timestamp>,
    aggregators: Vec<NamedAggregator>,
    offset: Timestamp,
    origin: ResampleOrigin,
    /// Owner row-slice start → owned bucket run, filled at structuring
    /// time and read back in `process`.
    ownership: Mutex<AHashMap<u64, (usize, usize)>>,
}

impl<const CLOSED_LEFT: bool> std::fmt::Debug for ResampleClause<CLOSED_LEFT> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResampleClause")
            .field("rule", &self.rule)
            .field("closed", &Self::closed_boundary())
            .field("label", &self.label_boundary)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl<const CLOSED_LEFT: bool> ResampleClause<CLOSED_LEFT> {
    pub const fn closed_boundary() -> ResampleBoundary {
        if CLOSED_LEFT {
            ResampleBoundary::Left
        } else {
            ResampleBoundary::Right
        }
    }

    pub fn new(
        rule: impl Into<String>,
        label_boundary: ResampleBoundary,
        generate_bucket_boundaries: BucketGenerator,
        offset: Timestamp,
        origin: ResampleOrigin,
    ) -> Self {
        let clause_info = ClauseInfo {
            input_structure: ProcessingStructure::TimeBucket,
            modifies_row_count: true,
            can_combine_with_column_selection: false,
            ..ClauseInfo::default()
        };
        Self {
            clause_info,
            manager: None,
            rule: rule.into(),
            label_boundary,
            date_range: None,
            user_date_range: None,
            generate_bucket_boundaries,
            bucket_boundaries: Vec::new(),
            aggregators: Vec::new(),
            offset,
            origin,
            ownership: Mutex::new(AHashMap::new()),
        }
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }

    pub fn set_aggregations(&mut self, aggregators: Vec<NamedAggregator>) {
        let input_columns = aggregators.iter().map(|a| a.input_column.clone()).collect();
        self.clause_info.input_columns = Some(input_columns);
        self.aggregators = aggregators;
    }

    pub fn set_date_range(&mut self, start: Timestamp, end: Timestamp) {
        self.user_date_range = Some((start, end));
    }

    pub fn bucket_boundaries(&self) -> &[Timestamp] {
        &self.bucket_boundaries
    }

    /// Record group ownership, asserting each owner claims once.
    fn record_ownership(&self, groups: &[TimeBucketGroup]) -> StrataResult<()> {
        let mut ownership = self.ownership.lock();
        for group in groups {
            if ownership
                .insert(group.owner_row_start, group.bucket_range)
                .is_some()
            {
                return Err(StrataError::assertion(format!(
                    "row slice at {} claims responsibility for two bucket runs",
                    group.owner_row_start
                )));
            }
        }
        Ok(())
    }

    /// Split a unit's bundles into row slices, each combined into one
    /// segment, ordered by row start.
    fn unit_slices(&self, unit: &ProcessingUnit) -> StrataResult<Vec<(u64, Segment)>> {
        let mut ordered: Vec<&Arc<EntityBundle>> = unit.bundles.iter().collect();
        ordered.sort_by_key(|b| (b.row_range.start, b.col_range.start));

        let mut slices: Vec<(u64, Vec<&Arc<EntityBundle>>)> = Vec::new();
        for bundle in ordered {
            match slices.last_mut() {
                Some((start, shards)) if *start == bundle.row_range.start => {
                    shards.push(bundle);
                }
                _ => slices.push((bundle.row_range.start, vec![bundle])),
            }
        }

        slices
            .into_iter()
            .map(|(start, shards)| {
                let ids: Vec<EntityId> = Vec::new();
                let unit = ProcessingUnit {
                    ids,
                    bundles: shards.iter().map(|&b| Arc::clone(b)).collect(),
                };
                Ok((start, unit.combined_segment()?))
            })
            .collect()
    }

    /// Output index value for a bucket.
    fn bucket_label(&self, bucket: usize) -> Timestamp {
        let boundary = match self.label_boundary {
            ResampleBoundary::Left => self.bucket_boundaries[bucket],
            ResampleBoundary::Right => self.bucket_boundaries[bucket + 1],
        };
        boundary + self.offset
    }
}

impl From<ResampleClause<true>> for Clause {
    fn from(clause: ResampleClause<true>) -> Self {
        Self::ResampleClosedLeft(clause)
    }
}

impl From<ResampleClause<false>> for Clause {
    fn from(clause: ResampleClause<false>) -> Self {
        Self::ResampleClosedRight(clause)
    }
}

impl<const CLOSED_LEFT: bool> ClauseBehaviour for ResampleClause<CLOSED_LEFT> {
    fn name(&self) -> &'static str {
        "Resample"
    }

    fn structure_for_plan(&self, plan: &mut Vec<RangesAndKey>) -> StrataResult<Vec<Vec<usize>>> {
        let slice_groups = crate::structuring::structure_by_row_slice_plan(plan);

        // One span per row slice; shards of a slice stay together.
        let mut spans = Vec::new();
        let mut spanned_slices = Vec::new();
        for (slice_idx, slice) in slice_groups.iter().enumerate() {
            let row_start = plan[slice[0]].row_range.start;
            let Some(time_range) = slice.iter().find_map(|&i| plan[i].time_range) else {
                return Err(StrataError::invalid_user_argument(
                    "resample as first clause needs catalog time ranges on the plan",
                ));
            };
            spans.push((row_start, time_range));
            spanned_slices.push(slice_idx);
        }

        let groups = assign_bucket_owners(&spans, &self.bucket_boundaries, Self::closed_boundary())?;
        self.record_ownership(&groups)?;

        Ok(groups
            .iter()
            .map(|g| {
                g.members
                    .iter()
                    .flat_map(|&m| slice_groups[spanned_slices[m]].iter().copied())
                    .collect()
            })
            .collect())
    }

    fn structure_for_entities(
        &self,
        entity_ids: Vec<Vec<EntityId>>,
    ) -> StrataResult<Vec<Vec<EntityId>>> {
        let manager = require_manager(&self.manager, self.name())?;
        let flat: Vec<EntityId> = entity_ids.into_iter().flatten().collect();
        let bundles = manager.get_many(&flat)?;

        // Row slices first: column shards share a time span.
        let mut slices: Vec<(u64, Vec<usize>)> = Vec::new();
        let mut order: Vec<usize> = (0..flat.len()).collect();
        order.sort_by_key(|&i| (bundles[i].row_range.start, bundles[i].col_range.start));
        for i in order {
            let start = bundles[i].row_range.start;
            match slices.last_mut() {
                Some((s, members)) if *s == start => members.push(i),
                _ => slices.push((start, vec![i])),
            }
        }

        let mut spans = Vec::new();
        for (start, members) in &slices {
            let span = members
                .iter()
                .find_map(|&i| bundles[i].segment.time_bounds().ok().flatten());
            let Some(span) = span else {
                return Err(StrataError::schema_error(
                    "resample requires segments with a timestamp index",
                ));
            };
            spans.push((*start, span));
        }

        let groups = assign_bucket_owners(&spans, &self.bucket_boundaries, Self::closed_boundary())?;
        self.record_ownership(&groups)?;

        Ok(groups
            .iter()
            .map(|g| {
                g.members
                    .iter()
                    .flat_map(|&m| slices[m].1.iter().map(|&i| flat[i]))
                    .collect()
            })
            .collect())
    }

    fn process(&self, entity_ids: Vec<EntityId>) -> StrataResult<Vec<EntityId>> {
        if entity_ids.is_empty() {
            return Ok(vec![]);
        }
        let manager = require_manager(&self.manager, self.name())?;
        let unit = ProcessingUnit::gather(manager, entity_ids)?;
        let slices = self.unit_slices(&unit)?;

        let owner_row_start = slices
            .iter()
            .map(|(start, _)| *start)
            .min()
            .ok_or_else(|| StrataError::assertion("resample unit has no slices"))?;
        let owned = {
            let ownership = self.ownership.lock();
            *ownership.get(&owner_row_start).ok_or_else(|| {
                StrataError::assertion(format!(
                    "no bucket ownership recorded for row slice at {owner_row_start}"
                ))
            })?
        };

        let inputs: Vec<BucketInput<'_>> = slices
            .iter()
            .map(|(start, segment)| BucketInput {
                segment,
                row_start: *start,
            })
            .collect();
        let bucketed = aggregate_buckets(
            &inputs,
            &self.aggregators,
            &self.bucket_boundaries,
            Self::closed_boundary(),
            owned,
        )?;
        if bucketed.occupied.is_empty() {
            return Ok(vec![]);
        }

        let index_name = slices[0].1.index_column().unwrap_or("index").to_string();
        let labels: TimestampNanosecondArray = bucketed
            .occupied
            .iter()
            .map(|&bucket| Some(self.bucket_label(bucket)))
            .collect();

        let mut fields = vec![Field::new(
            &index_name,
            ArrowDataType::Timestamp(TimeUnit::Nanosecond, None),
            false,
        )];
        let mut columns: Vec<ArrayRef> = vec![Arc::new(labels)];
        for (agg_idx, agg) in self.aggregators.iter().enumerate() {
            let column = build_column(
                agg.operator,
                &bucketed.input_types[agg_idx],
                &bucketed.partials[agg_idx],
            )?;
            fields.push(Field::new(
                &agg.output_column,
                column.data_type().clone(),
                true,
            ));
            columns.push(column);
        }

        let batch = RecordBatch::try_new(Arc::new(ArrowSchema::new(fields)), columns)?;
        let segment = Segment::with_index(batch, index_name)?;

        let rows = segment.num_rows() as u64;
        let cols = segment.num_columns() as u64;
        let first_owned = owned.0 as u64;
        let bundle = EntityBundle::new(
            segment,
            RowRange::new(first_owned, first_owned + rows),
            ColRange::new(0, cols),
        );
        Ok(vec![manager.push(bundle)])
    }

    fn info(&self) -> &ClauseInfo {
        &self.clause_info
    }

    fn set_processing_config(&mut self, config: &ProcessingConfig) -> StrataResult<()> {
        // The bucketed range is the user date range clipped to the
        // symbol's own span.
        self.date_range = match (self.user_date_range, config.index_range) {
            (Some((us, ue)), Some((ss, se))) => {
                let start = us.max(ss);
                let end = ue.min(se);
                (start <= end).then_some((start, end))
            }
            (None, symbol) => symbol,
            (user, None) => user,
        };

        self.bucket_boundaries = match self.date_range {
            Some((first, last)) => (self.generate_bucket_boundaries)(
                first,
                last,
                &self.rule,
                Self::closed_boundary(),
                self.offset,
                &self.origin,
            ),
            None => Vec::new(),
        };
        if self.bucket_boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(StrataError::invalid_user_argument(
                "bucket boundary generator returned a non-increasing sequence",
            ));
        }
        Ok(())
    }

    fn set_component_manager(&mut self, manager: Arc<ComponentManager>) {
        self.manager = Some(manager);
    }

    fn modify_schema(&self, schema: OutputSchema) -> StrataResult<OutputSchema> {
        let Some(index_column) = schema.index_column.clone() else {
            return Err(StrataError::schema_error(
                "Resample requires a timestamp-indexed schema",
            ));
        };
        if let Some(required) = &self.clause_info.input_columns {
            schema.require_columns(required.iter().map(String::as_str), self.name())?;
        }

        let mut output = OutputSchema::new(vec![FieldDef::new(
            index_column.clone(),
            DataType::Timestamp,
        )])
        .with_index(index_column)
        .with_dynamic(schema.dynamic);

        for agg in &self.aggregators {
            let input_type = match schema.field(&agg.input_column) {
                Some(field) => field.data_type.clone(),
                None if schema.dynamic => DataType::Float64,
                None => {
                    return Err(StrataError::schema_error(format!(
                        "Resample requires column '{}' which is not in the schema",
                        agg.input_column
                    )));
                }
            };
            output.add_field(FieldDef::new(
                agg.output_column.clone(),
                agg.operator.output_type(&input_type)?,
            ));
        }
        Ok(output)
    }
}

impl<const CLOSED_LEFT: bool> std::fmt::Display for ResampleClause<CLOSED_LEFT> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RESAMPLE[{}]", self.rule)
    }
}
