//! Property tests for the structuring primitives.

use proptest::prelude::*;

use strata_core::{ColRange, RangesAndKey, RowRange};
use strata_engine::structuring::structure_by_row_slice_plan;

fn arbitrary_plan() -> impl Strategy<Value = Vec<RangesAndKey>> {
    // Row slices of varying width, some split into several column shards.
    prop::collection::vec((0u64..20, 1u64..50, 1usize..4), 0..12).prop_map(|slices| {
        let mut plan = Vec::new();
        let mut row = 0u64;
        for (gap, width, shards) in slices {
            let start = row + gap;
            for shard in 0..shards {
                plan.push(RangesAndKey::new(
                    RowRange::new(start, start + width),
                    ColRange::new(shard as u64, shard as u64 + 1),
                    format!("k/{start}/{shard}"),
                ));
            }
            row = start + width;
        }
        plan
    })
}

proptest! {
    #[test]
    fn row_slice_groups_partition_the_plan(mut plan in arbitrary_plan()) {
        let original_len = plan.len();
        let groups = structure_by_row_slice_plan(&mut plan);

        // Every index appears exactly once.
        let mut seen: Vec<usize> = groups.iter().flatten().copied().collect();
        seen.sort_unstable();
        prop_assert_eq!(seen, (0..original_len).collect::<Vec<_>>());

        // Each group is one row slice, and groups ascend by row start.
        let mut last_start = None;
        for group in &groups {
            let row_range = plan[group[0]].row_range;
            for &idx in group {
                prop_assert_eq!(plan[idx].row_range, row_range);
            }
            if let Some(last) = last_start {
                prop_assert!(last < row_range.start);
            }
            last_start = Some(row_range.start);
        }
    }

    #[test]
    fn row_slice_sort_is_by_row_then_col(mut plan in arbitrary_plan()) {
        structure_by_row_slice_plan(&mut plan);
        for pair in plan.windows(2) {
            let a = (pair[0].row_range.start, pair[0].col_range.start);
            let b = (pair[1].row_range.start, pair[1].col_range.start);
            prop_assert!(a <= b);
        }
    }
}
