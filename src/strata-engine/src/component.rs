//! The component manager: a process-local store of short-lived entity
//! bundles, addressed by opaque id.
//!
//! Clauses never hand segments to each other directly; they publish
//! bundles here and pass ids. Lookup goes through a striped map and each
//! slot carries an atomic refcount, so concurrent `process` tasks can
//! read and release without a global lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arrow::array::UInt64Array;
use parking_lot::RwLock;
use tokio::sync::Notify;

use common_error::{StrataError, StrataResult};
use strata_core::{ColRange, RowRange, Segment};

const STRIPES: usize = 16;

/// Opaque handle to one entity bundle. Ids are minted strictly
/// increasing and never reused within a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// The heterogeneous payload behind one entity id: at minimum a segment
/// and its ranges, optionally clause-attached extras.
#[derive(Debug, Clone)]
pub struct EntityBundle {
    pub segment: Arc<Segment>,
    pub row_range: RowRange,
    pub col_range: ColRange,
    /// Bucket label attached by the partition clause.
    pub bucket_id: Option<u64>,
    /// Original pipeline-wide row index per row, attached by the
    /// partition clause so first/last aggregation stays deterministic
    /// after the hash reshuffle.
    pub row_indexes: Option<Arc<UInt64Array>>,
}

impl EntityBundle {
    pub fn new(segment: Segment, row_range: RowRange, col_range: ColRange) -> Self {
        Self {
            segment: Arc::new(segment),
            row_range,
            col_range,
            bucket_id: None,
            row_indexes: None,
        }
    }

    pub fn with_bucket_id(mut self, bucket_id: u64) -> Self {
        self.bucket_id = Some(bucket_id);
        self
    }

    pub fn with_row_indexes(mut self, row_indexes: UInt64Array) -> Self {
        self.row_indexes = Some(Arc::new(row_indexes));
        self
    }
}

struct Slot {
    bundle: Arc<EntityBundle>,
    refcount: AtomicUsize,
}

/// Striped, refcounted id → bundle store.
///
/// Segments are immutable once published; readers hold `Arc` clones of
/// the bundle, so a lookup never blocks behind a writer for long. The
/// live-slot count feeds the driver's backpressure.
pub struct ComponentManager {
    stripes: Vec<RwLock<HashMap<u64, Slot, ahash::RandomState>>>,
    next_id: AtomicU64,
    live: AtomicUsize,
    released: Notify,
}

impl Default for ComponentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ComponentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentManager")
            .field("live", &self.live_slots())
            .finish_non_exhaustive()
    }
}

impl ComponentManager {
    pub fn new() -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| RwLock::new(HashMap::default())).collect(),
            next_id: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            released: Notify::new(),
        }
    }

    fn stripe(&self, id: u64) -> &RwLock<HashMap<u64, Slot, ahash::RandomState>> {
        &self.stripes[(id as usize) % STRIPES]
    }

    /// Publish a bundle, minting a fresh id with refcount one.
    pub fn push(&self, bundle: EntityBundle) -> EntityId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Slot {
            bundle: Arc::new(bundle),
            refcount: AtomicUsize::new(1),
        };
        self.stripe(id).write().insert(id, slot);
        self.live.fetch_add(1, Ordering::Relaxed);
        EntityId(id)
    }

    /// Typed lookup. A missing id is a contract violation.
    pub fn get(&self, id: EntityId) -> StrataResult<Arc<EntityBundle>> {
        self.stripe(id.0)
            .read()
            .get(&id.0)
            .map(|slot| Arc::clone(&slot.bundle))
            .ok_or_else(|| StrataError::assertion(format!("{id} is not in the component manager")))
    }

    /// Batched lookup preserving id order.
    pub fn get_many(&self, ids: &[EntityId]) -> StrataResult<Vec<Arc<EntityBundle>>> {
        ids.iter().map(|&id| self.get(id)).collect()
    }

    /// Bump refcounts so the ids survive the caller's hand-off release.
    /// Used by clauses that re-emit their inputs unchanged.
    pub fn bump(&self, ids: &[EntityId]) -> StrataResult<()> {
        for &id in ids {
            let stripe = self.stripe(id.0).read();
            let slot = stripe.get(&id.0).ok_or_else(|| {
                StrataError::assertion(format!("{id} is not in the component manager"))
            })?;
            slot.refcount.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Decrement refcounts, freeing slots that reach zero.
    pub fn release(&self, ids: &[EntityId]) -> StrataResult<()> {
        let mut freed = false;
        for &id in ids {
            let mut stripe = self.stripe(id.0).write();
            let slot = stripe.get(&id.0).ok_or_else(|| {
                StrataError::assertion(format!("released {id} twice"))
            })?;
            if slot.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
                stripe.remove(&id.0);
                self.live.fetch_sub(1, Ordering::Relaxed);
                freed = true;
            }
        }
        if freed {
            self.released.notify_waiters();
        }
        Ok(())
    }

    /// Number of live slots.
    pub fn live_slots(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Park until the live-slot count drops below `high_water`.
    pub async fn wait_below(&self, high_water: usize) {
        loop {
            // Register interest before re-checking so a concurrent
            // release between the check and the await is not lost.
            let notified = self.released.notified();
            if self.live_slots() < high_water {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema};
    use arrow::record_batch::RecordBatch;

    fn bundle(rows: std::ops::Range<u64>) -> EntityBundle {
        let schema = StdArc::new(ArrowSchema::new(vec![Field::new(
            "v",
            ArrowDataType::Int64,
            true,
        )]));
        let values: Vec<i64> = (rows.start as i64..rows.end as i64).collect();
        let batch =
            RecordBatch::try_new(schema, vec![StdArc::new(Int64Array::from(values))]).unwrap();
        EntityBundle::new(
            Segment::new(batch),
            RowRange::new(rows.start, rows.end),
            ColRange::new(0, 1),
        )
    }

    #[test]
    fn test_ids_strictly_increase() {
        let mgr = ComponentManager::new();
        let a = mgr.push(bundle(0..10));
        let b = mgr.push(bundle(10..20));
        assert!(b > a);
    }

    #[test]
    fn test_release_frees_slot() {
        let mgr = ComponentManager::new();
        let id = mgr.push(bundle(0..10));
        assert_eq!(mgr.live_slots(), 1);

        mgr.release(&[id]).unwrap();
        assert_eq!(mgr.live_slots(), 0);
        assert!(mgr.get(id).is_err());
    }

    #[test]
    fn test_bump_keeps_slot_alive_across_release() {
        let mgr = ComponentManager::new();
        let id = mgr.push(bundle(0..10));
        mgr.bump(&[id]).unwrap();

        mgr.release(&[id]).unwrap();
        assert!(mgr.get(id).is_ok());

        mgr.release(&[id]).unwrap();
        assert!(mgr.get(id).is_err());
    }

    #[test]
    fn test_double_release_is_assertion() {
        let mgr = ComponentManager::new();
        let id = mgr.push(bundle(0..10));
        mgr.release(&[id]).unwrap();
        let err = mgr.release(&[id]).unwrap_err();
        assert!(matches!(err, StrataError::AssertionFailure(_)));
    }

    #[test]
    fn test_get_many_preserves_order() {
        let mgr = ComponentManager::new();
        let a = mgr.push(bundle(0..5));
        let b = mgr.push(bundle(5..9));
        let bundles = mgr.get_many(&[b, a]).unwrap();
        assert_eq!(bundles[0].row_range, RowRange::new(5, 9));
        assert_eq!(bundles[1].row_range, RowRange::new(0, 5));
    }
}
