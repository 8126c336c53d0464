//! Structuring primitives: how plan elements and entity bundles are
//! grouped into processing units.

use common_error::{StrataError, StrataResult};
use strata_core::{RangesAndKey, Timestamp};

use crate::component::{ComponentManager, EntityId};

/// Which side of a resample bucket interval is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleBoundary {
    Left,
    Right,
}

/// Sort the plan lexicographically by `(row_range.start, col_range.start)`
/// and partition it so each group holds the entries of exactly one row
/// slice: a horizontal slice across all column shards for the same rows.
pub fn structure_by_row_slice_plan(plan: &mut [RangesAndKey]) -> Vec<Vec<usize>> {
    plan.sort_by_key(|rk| (rk.row_range.start, rk.col_range.start));

    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (idx, entry) in plan.iter().enumerate() {
        match groups.last_mut() {
            Some(group) if plan[group[0]].row_range == entry.row_range => group.push(idx),
            _ => groups.push(vec![idx]),
        }
    }
    groups
}

/// Group consecutive plan entries sharing a row range without reordering
/// anything. Used by the passthrough clause, which preserves the
/// caller's order.
pub fn preserve_order_plan(plan: &[RangesAndKey]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (idx, entry) in plan.iter().enumerate() {
        match groups.last_mut() {
            Some(group) if plan[group[0]].row_range == entry.row_range => group.push(idx),
            _ => groups.push(vec![idx]),
        }
    }
    groups
}

/// Same idea as [`structure_by_row_slice_plan`], but over materialised
/// bundles: row ranges are read out of the component manager.
pub fn structure_by_row_slice_entities(
    manager: &ComponentManager,
    entity_ids: Vec<Vec<EntityId>>,
) -> StrataResult<Vec<Vec<EntityId>>> {
    let flat: Vec<EntityId> = entity_ids.into_iter().flatten().collect();
    let bundles = manager.get_many(&flat)?;

    let mut keyed: Vec<(u64, u64, EntityId)> = flat
        .iter()
        .zip(&bundles)
        .map(|(&id, b)| (b.row_range.start, b.col_range.start, id))
        .collect();
    keyed.sort_by_key(|&(row, col, _)| (row, col));

    let mut groups: Vec<(u64, Vec<EntityId>)> = Vec::new();
    for (row, _, id) in keyed {
        match groups.last_mut() {
            Some((last_row, group)) if *last_row == row => group.push(id),
            _ => groups.push((row, vec![id])),
        }
    }
    Ok(groups.into_iter().map(|(_, ids)| ids).collect())
}

/// One resample group: the entities needed to finalise a contiguous run
/// of buckets, together with which member owns them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeBucketGroup {
    /// Indexes into the caller's entity/plan order.
    pub members: Vec<usize>,
    /// Row-range start of the owner: the member with the smallest row
    /// start among those straddling the group's first boundary.
    pub owner_row_start: u64,
    /// Owned buckets, `[first, last)` as indexes into the boundary list.
    pub bucket_range: (usize, usize),
}

/// Index of the first and last bucket a time span `[t0, t1]` overlaps,
/// under the given closed side. `None` when the span misses every bucket.
fn overlapped_buckets(
    boundaries: &[Timestamp],
    closed: ResampleBoundary,
    t0: Timestamp,
    t1: Timestamp,
) -> Option<(usize, usize)> {
    let num_buckets = boundaries.len().checked_sub(1)?;
    if num_buckets == 0 {
        return None;
    }
    let (first, last) = match closed {
        // Bucket i is [b_i, b_{i+1}).
        ResampleBoundary::Left => {
            let first = boundaries[1..].partition_point(|b| *b <= t0);
            let last = boundaries.partition_point(|b| *b <= t1);
            (first, last.checked_sub(1)?)
        }
        // Bucket i is (b_i, b_{i+1}].
        ResampleBoundary::Right => {
            let first = boundaries[1..].partition_point(|b| *b < t0);
            let last = boundaries.partition_point(|b| *b < t1);
            (first, last.checked_sub(1)?)
        }
    };
    if first >= num_buckets || first > last {
        return None;
    }
    Some((first, last.min(num_buckets - 1)))
}

/// Assign bucket ownership over time spans sorted by row order.
///
/// Each span is `(row_range.start, (first_ts, last_ts))`. A bucket is
/// owned by the first span (in row order) overlapping it; a span
/// overlapping `k` owners' buckets appears in `k` groups. Exactly-once
/// finalisation falls out: every bucket belongs to one group.
pub fn assign_bucket_owners(
    spans: &[(u64, (Timestamp, Timestamp))],
    boundaries: &[Timestamp],
    closed: ResampleBoundary,
) -> StrataResult<Vec<TimeBucketGroup>> {
    let mut ordered: Vec<usize> = (0..spans.len()).collect();
    ordered.sort_by_key(|&i| spans[i].0);
    for pair in ordered.windows(2) {
        if spans[pair[0]].0 == spans[pair[1]].0 {
            return Err(StrataError::assertion(format!(
                "two entities at row {} claim responsibility for the same bucket boundary",
                spans[pair[0]].0
            )));
        }
    }

    let overlaps: Vec<Option<(usize, usize)>> = ordered
        .iter()
        .map(|&i| {
            let (t0, t1) = spans[i].1;
            overlapped_buckets(boundaries, closed, t0, t1)
        })
        .collect();

    let mut groups = Vec::new();
    let mut next_unowned = 0usize;
    for (pos, &idx) in ordered.iter().enumerate() {
        let Some((first, last)) = overlaps[pos] else {
            continue;
        };
        let owned_first = first.max(next_unowned);
        if owned_first > last {
            continue;
        }
        next_unowned = last + 1;

        let members: Vec<usize> = ordered
            .iter()
            .enumerate()
            .filter(|&(other_pos, _)| {
                overlaps[other_pos]
                    .is_some_and(|(of, ol)| of <= last && owned_first <= ol)
            })
            .map(|(_, &other_idx)| other_idx)
            .collect();

        groups.push(TimeBucketGroup {
            members,
            owner_row_start: spans[idx].0,
            bucket_range: (owned_first, last + 1),
        });
    }
    Ok(groups)
}

/// Partition materialised entities so each group holds every entity
/// whose time span overlaps one run of owned buckets.
pub fn structure_by_time_bucket(
    manager: &ComponentManager,
    entity_ids: Vec<Vec<EntityId>>,
    boundaries: &[Timestamp],
    closed: ResampleBoundary,
) -> StrataResult<(Vec<Vec<EntityId>>, Vec<TimeBucketGroup>)> {
    let flat: Vec<EntityId> = entity_ids.into_iter().flatten().collect();
    let bundles = manager.get_many(&flat)?;

    let mut spans = Vec::with_capacity(flat.len());
    let mut spanned_ids = Vec::with_capacity(flat.len());
    for (&id, bundle) in flat.iter().zip(&bundles) {
        if let Some((first, last)) = bundle.segment.time_bounds()? {
            spans.push((bundle.row_range.start, (first, last)));
            spanned_ids.push(id);
        }
    }

    let groups = assign_bucket_owners(&spans, boundaries, closed)?;
    let id_groups = groups
        .iter()
        .map(|g| g.members.iter().map(|&i| spanned_ids[i]).collect())
        .collect();
    Ok((id_groups, groups))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{ColRange, RowRange};

    fn rk(rows: (u64, u64), cols: (u64, u64)) -> RangesAndKey {
        RangesAndKey::new(
            RowRange::new(rows.0, rows.1),
            ColRange::new(cols.0, cols.1),
            format!("k/{}-{}/{}", rows.0, rows.1, cols.0),
        )
    }

    #[test]
    fn test_row_slice_plan_sorts_and_groups() {
        let mut plan = vec![
            rk((100, 200), (1, 2)),
            rk((0, 100), (0, 1)),
            rk((100, 200), (0, 1)),
            rk((0, 100), (1, 2)),
        ];
        let groups = structure_by_row_slice_plan(&mut plan);
        assert_eq!(groups, vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(plan[0].row_range, RowRange::new(0, 100));
        assert_eq!(plan[3].col_range, ColRange::new(1, 2));
    }

    #[test]
    fn test_preserve_order_keeps_caller_order() {
        let plan = vec![rk((100, 200), (0, 1)), rk((0, 100), (0, 1))];
        let groups = preserve_order_plan(&plan);
        assert_eq!(groups, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_overlapped_buckets_closed_left() {
        let boundaries = [0, 3, 6, 9];
        // Exactly on a boundary belongs to the bucket it opens.
        assert_eq!(
            overlapped_buckets(&boundaries, ResampleBoundary::Left, 3, 3),
            Some((1, 1))
        );
        assert_eq!(
            overlapped_buckets(&boundaries, ResampleBoundary::Left, 0, 8),
            Some((0, 2))
        );
        assert_eq!(
            overlapped_buckets(&boundaries, ResampleBoundary::Left, 9, 12),
            None
        );
    }

    #[test]
    fn test_overlapped_buckets_closed_right() {
        let boundaries = [0, 3, 6, 9];
        // Exactly on a boundary belongs to the bucket it closes.
        assert_eq!(
            overlapped_buckets(&boundaries, ResampleBoundary::Right, 3, 3),
            Some((0, 0))
        );
        assert_eq!(
            overlapped_buckets(&boundaries, ResampleBoundary::Right, 0, 9),
            Some((0, 2))
        );
    }

    #[test]
    fn test_bucket_ownership_straddle() {
        // Entity 0 covers [0, 4], entity 1 covers [5, 8]: bucket 1
        // ([3, 6)) straddles both and must be owned by entity 0 only.
        let spans = vec![(0u64, (0i64, 4i64)), (100u64, (5i64, 8i64))];
        let boundaries = [0, 3, 6, 9];
        let groups = assign_bucket_owners(&spans, &boundaries, ResampleBoundary::Left).unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].bucket_range, (0, 2));
        assert_eq!(groups[0].members, vec![0, 1]);
        assert_eq!(groups[1].bucket_range, (2, 3));
        assert_eq!(groups[1].members, vec![1]);
    }

    #[test]
    fn test_duplicate_owner_claim_is_assertion() {
        let spans = vec![(0u64, (0i64, 4i64)), (0u64, (2i64, 8i64))];
        let boundaries = [0, 3, 6];
        let err =
            assign_bucket_owners(&spans, &boundaries, ResampleBoundary::Left).unwrap_err();
        assert!(matches!(err, StrataError::AssertionFailure(_)));
    }
}
