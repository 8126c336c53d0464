//! Sorted aggregation over time buckets, used by resample.
//!
//! Unlike the hash-grouped path, input rows arrive in time order, so the
//! aggregator streams through them advancing a bucket pointer on
//! boundary crossings and emits one partial per bucket.

use arrow::array::Array;

use common_error::{StrataError, StrataResult};
use strata_core::{DataType, Segment, Timestamp};

use super::{AggPartial, NamedAggregator, scalar_at};
use crate::structuring::ResampleBoundary;

/// One time-ordered input to a bucket run: a segment plus its pipeline
/// row offset (for deterministic first/last).
pub struct BucketInput<'a> {
    pub segment: &'a Segment,
    pub row_start: u64,
}

/// Partials for one run of owned buckets.
pub struct BucketedPartials {
    /// Owned bucket indexes that saw at least one row, ascending.
    pub occupied: Vec<usize>,
    /// `partials[aggregator][occupied position]`.
    pub partials: Vec<Vec<AggPartial>>,
    /// Input column type per aggregator, for output column building.
    pub input_types: Vec<DataType>,
}

fn bucket_of(boundaries: &[Timestamp], closed: ResampleBoundary, t: Timestamp) -> Option<usize> {
    let idx = match closed {
        ResampleBoundary::Left => boundaries.partition_point(|b| *b <= t),
        ResampleBoundary::Right => boundaries.partition_point(|b| *b < t),
    };
    let idx = idx.checked_sub(1)?;
    if idx + 1 >= boundaries.len() {
        return None;
    }
    Some(idx)
}

/// Stream `inputs` in row order and fold every row that lands in an
/// owned bucket into per-bucket partials.
pub fn aggregate_buckets(
    inputs: &[BucketInput<'_>],
    aggregators: &[NamedAggregator],
    boundaries: &[Timestamp],
    closed: ResampleBoundary,
    owned: (usize, usize),
) -> StrataResult<BucketedPartials> {
    let (first_owned, end_owned) = owned;
    let owned_count = end_owned.saturating_sub(first_owned);

    let input_types: Vec<DataType> = aggregators
        .iter()
        .map(|agg| {
            inputs
                .iter()
                .find_map(|input| {
                    input
                        .segment
                        .column_by_name(&agg.input_column)
                        .and_then(|arr| DataType::from_arrow(arr.data_type()))
                })
                // Absent everywhere: an all-missing column of inferred type.
                .unwrap_or(DataType::Float64)
        })
        .collect();

    let mut partials: Vec<Vec<Option<AggPartial>>> =
        vec![vec![None; owned_count]; aggregators.len()];
    let mut seen = vec![false; owned_count];

    for input in inputs {
        let index = input.segment.index_values()?;
        let columns: Vec<_> = aggregators
            .iter()
            .map(|agg| input.segment.column_by_name(&agg.input_column))
            .collect();

        for row in 0..index.len() {
            let t = index.value(row);
            let Some(bucket) = bucket_of(boundaries, closed, t) else {
                continue;
            };
            if bucket < first_owned || bucket >= end_owned {
                continue;
            }
            let slot = bucket - first_owned;
            seen[slot] = true;

            for (agg_idx, (agg, column)) in aggregators.iter().zip(&columns).enumerate() {
                let Some(column) = *column else { continue };
                let Some(value) = scalar_at(column, row)? else {
                    continue;
                };
                let partial = match &mut partials[agg_idx][slot] {
                    Some(p) => p,
                    empty => empty.insert(AggPartial::new(
                        agg.operator,
                        &input_types[agg_idx],
                    )?),
                };
                partial.update(&value, input.row_start + row as u64)?;
            }
        }
    }

    let occupied: Vec<usize> = (0..owned_count)
        .filter(|&slot| seen[slot])
        .map(|slot| first_owned + slot)
        .collect();

    let mut finished: Vec<Vec<AggPartial>> = Vec::with_capacity(aggregators.len());
    for (agg_idx, agg) in aggregators.iter().enumerate() {
        let mut per_bucket = Vec::with_capacity(occupied.len());
        for &bucket in &occupied {
            let slot = bucket - first_owned;
            let partial = match partials[agg_idx][slot].take() {
                Some(p) => p,
                None => AggPartial::new(agg.operator, &input_types[agg_idx])?,
            };
            per_bucket.push(partial);
        }
        finished.push(per_bucket);
    }

    Ok(BucketedPartials {
        occupied,
        partials: finished,
        input_types,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{Int64Array, TimestampNanosecondArray};
    use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, TimeUnit};
    use arrow::record_batch::RecordBatch;

    use crate::aggregate::AggregationOperator;
    use strata_core::Value;

    fn segment(ts: Vec<i64>, values: Vec<i64>) -> Segment {
        let schema = Arc::new(ArrowSchema::new(vec![
            Field::new(
                "ts",
                ArrowDataType::Timestamp(TimeUnit::Nanosecond, None),
                false,
            ),
            Field::new("v", ArrowDataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(TimestampNanosecondArray::from(ts)),
                Arc::new(Int64Array::from(values)),
            ],
        )
        .unwrap();
        Segment::with_index(batch, "ts").unwrap()
    }

    #[test]
    fn test_three_second_buckets_closed_left() {
        // Timestamps 0..=5s, values 1..=6, boundaries [0, 3s, 6s]:
        // bucket 0 sums 1+2+3, bucket 1 sums 4+5+6.
        let s = 1_000_000_000i64;
        let seg = segment(
            vec![0, s, 2 * s, 3 * s, 4 * s, 5 * s],
            vec![1, 2, 3, 4, 5, 6],
        );
        let inputs = [BucketInput {
            segment: &seg,
            row_start: 0,
        }];
        let aggs = [NamedAggregator::new(AggregationOperator::Sum, "v", "v_sum")];
        let result = aggregate_buckets(
            &inputs,
            &aggs,
            &[0, 3 * s, 6 * s],
            ResampleBoundary::Left,
            (0, 2),
        )
        .unwrap();

        assert_eq!(result.occupied, vec![0, 1]);
        assert_eq!(result.partials[0][0].finalize(), Value::Int64(6));
        assert_eq!(result.partials[0][1].finalize(), Value::Int64(15));
    }

    #[test]
    fn test_closed_right_boundary_membership() {
        // With (b_i, b_{i+1}] a row exactly on 3s closes bucket 0.
        let s = 1_000_000_000i64;
        let seg = segment(vec![s, 3 * s, 4 * s], vec![10, 20, 30]);
        let inputs = [BucketInput {
            segment: &seg,
            row_start: 0,
        }];
        let aggs = [NamedAggregator::new(AggregationOperator::Sum, "v", "v_sum")];
        let result = aggregate_buckets(
            &inputs,
            &aggs,
            &[0, 3 * s, 6 * s],
            ResampleBoundary::Right,
            (0, 2),
        )
        .unwrap();

        assert_eq!(result.occupied, vec![0, 1]);
        assert_eq!(result.partials[0][0].finalize(), Value::Int64(30));
        assert_eq!(result.partials[0][1].finalize(), Value::Int64(30));
    }

    #[test]
    fn test_empty_bucket_omitted() {
        let s = 1_000_000_000i64;
        let seg = segment(vec![0, 7 * s], vec![1, 2]);
        let inputs = [BucketInput {
            segment: &seg,
            row_start: 0,
        }];
        let aggs = [NamedAggregator::new(AggregationOperator::Sum, "v", "v_sum")];
        let result = aggregate_buckets(
            &inputs,
            &aggs,
            &[0, 3 * s, 6 * s, 9 * s],
            ResampleBoundary::Left,
            (0, 3),
        )
        .unwrap();

        // Bucket 1 ([3s, 6s)) saw no rows and is omitted.
        assert_eq!(result.occupied, vec![0, 2]);
    }

    #[test]
    fn test_rows_outside_owned_range_skipped() {
        let s = 1_000_000_000i64;
        let seg = segment(vec![0, s, 4 * s], vec![1, 2, 100]);
        let inputs = [BucketInput {
            segment: &seg,
            row_start: 0,
        }];
        let aggs = [NamedAggregator::new(AggregationOperator::Sum, "v", "v_sum")];
        let result = aggregate_buckets(
            &inputs,
            &aggs,
            &[0, 3 * s, 6 * s],
            ResampleBoundary::Left,
            (0, 1),
        )
        .unwrap();

        assert_eq!(result.occupied, vec![0]);
        assert_eq!(result.partials[0][0].finalize(), Value::Int64(3));
    }
}
