use duracheck_session::{ContextHandle, Options, StackSource};
use smallvec::SmallVec;

use crate::{
    overlap_map::OverlapMap,
    region::MemRegion,
    store::{Store, StoreState, contexts_equal, value_drop_low, value_keep_low},
    warnings::{DiagnosticKind, DiagnosticOverflow, WarningBuffer},
};

/// The subset of session options the store tracker acts on.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerConfig {
    /// Track overwrites of unflushed stores instead of merging overlapping
    /// stores.
    pub track_multiple_stores: bool,
    /// Superblock window within which a bit-identical re-store is idempotent.
    pub store_sb_indiff: u64,
    /// Report redundant and superfluous flushes.
    pub check_flush: bool,
    /// Three-state model: flushed stores drain on fence, no fenced/committed
    /// states.
    pub weak_clflush: bool,
}

impl TrackerConfig {
    pub fn from_options(options: &Options) -> Self {
        Self {
            track_multiple_stores: options.track_multiple_stores,
            store_sb_indiff: options.store_sb_indiff,
            check_flush: options.check_flush,
            weak_clflush: options.weak_clflush,
        }
    }
}

/// A flush that covered no tracked store, kept for the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushRecord {
    pub region: MemRegion,
    pub context: ContextHandle,
}

/// The durability state machine over the global store set.
///
/// Stores enter dirty, advance on flushes, fences and commits, and leave the
/// set once durable. Overlap between records never survives an operation:
/// a write over an existing record either discards the overlapped part
/// (possibly reporting it as an overwrite) or splits the record into
/// non-overlapping fragments.
#[derive(Debug)]
pub struct StoreTracker {
    stores: OverlapMap<Store>,
    overwrites: WarningBuffer<Store>,
    redundant_flushes: WarningBuffer<Store>,
    superfluous_flushes: WarningBuffer<FlushRecord>,
    config: TrackerConfig,
}

/// Result of splitting an existing store around an overlapping new one.
struct SplitPieces {
    /// Non-overlapping fragments of the old store, to be reinserted.
    kept: SmallVec<[Store; 2]>,
    /// The overlapped portion of the old store.
    clobbered: Store,
}

impl StoreTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            stores: OverlapMap::new(),
            overwrites: WarningBuffer::new(DiagnosticKind::Overwrite),
            redundant_flushes: WarningBuffer::new(DiagnosticKind::RedundantFlush),
            superfluous_flushes: WarningBuffer::new(DiagnosticKind::SuperfluousFlush),
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Ingest an observed store to persistent memory.
    ///
    /// The caller has already applied the persistence filter; every store
    /// passed here is tracked.
    pub fn handle_store(
        &mut self,
        store: Store,
        stacks: &dyn StackSource,
    ) -> Result<(), DiagnosticOverflow> {
        debug_assert_eq!(store.state, StoreState::Dirty);
        if self.config.track_multiple_stores {
            self.ingest_tracking_overwrites(store)
        } else {
            self.ingest_merging(store, stacks);
            Ok(())
        }
    }

    /// Simple mode: discard overlapped parts of existing records and grow the
    /// new record over mergeable neighbors.
    fn ingest_merging(&mut self, mut store: Store, stacks: &dyn StackSource) {
        while let Some((_, old)) = self.stores.take_overlapping(store.region) {
            let pieces = split_store(old, &store);
            for fragment in pieces.kept {
                self.stores.insert(fragment.region, fragment);
            }
        }

        // try to grow over the store touching either end; probes are based on
        // the original range, the set holds nothing overlapping it anymore
        let base = store.region;
        let probes = [
            MemRegion::new(base.addr.saturating_sub(1), base.size),
            MemRegion::new(base.addr + 1, base.size),
        ];
        for probe in probes {
            let neighbor = match self.stores.get_overlapping(probe) {
                Some((region, neighbor))
                    if neighbor.state == store.state
                        && contexts_equal(stacks, neighbor.context, store.context) =>
                {
                    Some(region)
                }
                _ => None,
            };
            if let Some(region) = neighbor {
                self.stores.take_overlapping(probe);
                store.region = store.region.merge(&region);
            }
        }
        self.stores.insert(store.region, store);
    }

    /// Overwrite-tracking mode: report every overlapped dirty byte, except
    /// for bit-identical re-stores within the superblock window.
    fn ingest_tracking_overwrites(&mut self, store: Store) -> Result<(), DiagnosticOverflow> {
        while let Some((_, old)) = self.stores.take_overlapping(store.region) {
            let idempotent = store.block.saturating_sub(old.block) < self.config.store_sb_indiff
                && old.region == store.region
                && old.masked_value() == store.masked_value();
            if idempotent {
                log::trace!(target: "track", "idempotent re-store at {}", store.region);
                continue;
            }
            let pieces = split_store(old, &store);
            for fragment in pieces.kept {
                self.stores.insert(fragment.region, fragment);
            }
            self.overwrites.record(pieces.clobbered)?;
        }
        self.stores.insert(store.region, store);
        Ok(())
    }

    /// Apply a cache-line flush over `region`.
    ///
    /// Dirty bytes inside the range become flushed, splitting off still-dirty
    /// slivers where a store straddles the flush boundary. Non-dirty stores
    /// in range are reported as redundantly flushed; a flush covering no
    /// store at all is superfluous.
    pub fn flush(
        &mut self,
        region: MemRegion,
        context: ContextHandle,
    ) -> Result<(), DiagnosticOverflow> {
        let keys = self.stores.overlapping_keys(region);
        if keys.is_empty() {
            if self.config.check_flush {
                self.superfluous_flushes.record(FlushRecord { region, context })?;
            }
            return Ok(());
        }

        for key in keys {
            let Some((stored, mut store)) = self.stores.take_overlapping(key) else {
                continue;
            };
            if store.state != StoreState::Dirty {
                if self.config.check_flush {
                    self.redundant_flushes.record(store.clone())?;
                }
                self.stores.insert(stored, store);
                continue;
            }

            // non-flushed slivers survive as separate dirty records
            if stored.addr < region.addr {
                let mut head = store.clone();
                head.region = MemRegion::from_bounds(stored.addr, region.addr);
                self.stores.insert(head.region, head);
            }
            if stored.end() > region.end() {
                let mut tail = store.clone();
                tail.region = MemRegion::from_bounds(region.end(), stored.end());
                self.stores.insert(tail.region, tail);
            }
            store.region = stored.intersect(&region);
            store.state = StoreState::Flushed;
            self.stores.insert(store.region, store);
        }
        Ok(())
    }

    /// Apply a store-ordering fence.
    ///
    /// Full model: flushed stores become fenced, committed stores drain.
    /// Weak-clflush model: flushed stores drain.
    pub fn fence(&mut self) {
        if self.config.weak_clflush {
            self.stores.retain(|_, store| store.state != StoreState::Flushed);
        } else {
            self.stores.retain(|_, store| match store.state {
                StoreState::Flushed => {
                    store.state = StoreState::Fenced;
                    true
                }
                StoreState::Committed => false,
                _ => true,
            });
        }
    }

    /// Apply the platform commit: fenced stores become committed.
    ///
    /// No-op in the weak-clflush model, which has no commit notion.
    pub fn commit(&mut self) {
        if self.config.weak_clflush {
            return;
        }
        for store in self.stores.values_mut() {
            if store.state == StoreState::Fenced {
                store.state = StoreState::Committed;
            }
        }
    }

    /// Forget every tracked byte in `range`, without diagnostics.
    pub fn set_clean(&mut self, range: MemRegion) {
        self.stores.remove_splitting_with(range, |store, sliver| Store {
            region: sliver,
            ..store.clone()
        });
    }

    /// The tracked stores, in address order.
    pub fn stores(&self) -> impl Iterator<Item = &Store> + '_ {
        self.stores.iter().map(|(_, store)| store)
    }

    /// Number of stores that never became durable.
    pub fn dangling_count(&self) -> usize {
        self.stores.len()
    }

    /// Total bytes of the stores that never became durable.
    pub fn dangling_bytes(&self) -> u64 {
        self.stores.iter().map(|(region, _)| region.size).sum()
    }

    pub fn overwrites(&self) -> &[Store] {
        self.overwrites.as_slice()
    }

    pub fn redundant_flushes(&self) -> &[Store] {
        self.redundant_flushes.as_slice()
    }

    pub fn superfluous_flushes(&self) -> &[FlushRecord] {
        self.superfluous_flushes.as_slice()
    }

    /// Total diagnostics chargeable to this tracker, including the stores
    /// still dangling in the set.
    pub fn error_count(&self) -> usize {
        self.dangling_count()
            + self.overwrites.len()
            + self.redundant_flushes.len()
            + self.superfluous_flushes.len()
    }
}

/// Split `old` around the range of `new`, adjusting fragment values to the
/// byte ranges they still cover.
fn split_store(old: Store, new: &Store) -> SplitPieces {
    let old_start = old.region.addr;
    let old_end = old.region.end();
    let new_start = new.region.addr;
    let new_end = new.region.end();

    // old fully covered: the whole record is clobbered
    if new.region.contains(&old.region) {
        return SplitPieces {
            kept: SmallVec::new(),
            clobbered: old,
        };
    }

    if old_start < new_start && old_end > new_end {
        // new lands inside old: keep both slivers, the cut-out range is
        // reported with the old store's context
        let mut left = old.clone();
        left.region = MemRegion::from_bounds(old_start, new_start);
        left.value = value_drop_low(old.value, old_end - new_start);
        let mut right = old.clone();
        right.region = MemRegion::from_bounds(new_end, old_end);
        right.value = value_keep_low(old.value, old_end - new_end);
        let clobbered = Store {
            context: old.context,
            ..new.clone()
        };
        SplitPieces {
            kept: SmallVec::from_buf([left, right]),
            clobbered,
        }
    } else if old_start < new_start {
        // tail of old is overlapped
        let mut clobbered = old.clone();
        clobbered.region = MemRegion::from_bounds(new_start, old_end);
        let mut left = old;
        left.region = MemRegion::from_bounds(old_start, new_start);
        left.value = value_drop_low(left.value, old_end - new_start);
        SplitPieces {
            kept: SmallVec::from_iter([left]),
            clobbered,
        }
    } else {
        // head of old is overlapped
        let mut clobbered = old.clone();
        clobbered.region = MemRegion::from_bounds(old_start, new_end);
        let mut right = old;
        right.region = MemRegion::from_bounds(new_end, old_end);
        right.value = value_keep_low(right.value, old_end - new_end);
        SplitPieces {
            kept: SmallVec::from_iter([right]),
            clobbered,
        }
    }
}
