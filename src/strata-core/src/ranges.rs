//! Row and column ranges, and the plan elements built from them.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Half-open interval of pipeline-wide row indexes, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowRange {
    pub start: u64,
    pub end: u64,
}

impl RowRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "row range start must not exceed end");
        Self { start, end }
    }

    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub const fn contains(&self, row: u64) -> bool {
        row >= self.start && row < self.end
    }

    pub const fn intersects(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The overlap with `other`, empty at `self.start` if disjoint.
    pub fn intersection(&self, other: &Self) -> Self {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end).max(start);
        Self { start, end }
    }
}

/// Half-open interval of column indexes local to the column schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColRange {
    pub start: u64,
    pub end: u64,
}

impl ColRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "col range start must not exceed end");
        Self { start, end }
    }

    pub const fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// A plan element: a segment not yet loaded, identified by its storage
/// key together with where it sits in the logical table.
///
/// `time_range` carries the catalog-known min/max of the segment's index
/// column; date-range and resample structuring prune and group the plan
/// with it before anything is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangesAndKey {
    pub row_range: RowRange,
    pub col_range: ColRange,
    pub key: String,
    pub time_range: Option<(Timestamp, Timestamp)>,
}

impl RangesAndKey {
    pub fn new(row_range: RowRange, col_range: ColRange, key: impl Into<String>) -> Self {
        Self {
            row_range,
            col_range,
            key: key.into(),
            time_range: None,
        }
    }

    pub fn with_time_range(mut self, start: Timestamp, end: Timestamp) -> Self {
        self.time_range = Some((start, end));
        self
    }

    /// Whether the segment's known time span intersects `[start, end]`
    /// (inclusive both ends, matching date-range semantics). Entries with
    /// no catalog time range are conservatively kept.
    pub fn overlaps_time(&self, start: Timestamp, end: Timestamp) -> bool {
        match self.time_range {
            Some((first, last)) => first <= end && start <= last,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_range_intersection() {
        let a = RowRange::new(0, 100);
        let b = RowRange::new(50, 150);
        assert!(a.intersects(&b));
        assert_eq!(a.intersection(&b), RowRange::new(50, 100));

        let c = RowRange::new(100, 200);
        assert!(!a.intersects(&c));
        assert!(a.intersection(&c).is_empty());
    }

    #[test]
    fn test_time_overlap() {
        let rk = RangesAndKey::new(RowRange::new(0, 10), ColRange::new(0, 1), "k")
            .with_time_range(100, 200);
        assert!(rk.overlaps_time(150, 300));
        assert!(rk.overlaps_time(200, 300));
        assert!(!rk.overlaps_time(201, 300));

        let unknown = RangesAndKey::new(RowRange::new(0, 10), ColRange::new(0, 1), "k");
        assert!(unknown.overlaps_time(0, 0));
    }
}
