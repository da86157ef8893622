use core::cmp::Ordering;
use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::region::MemRegion;

/// Key wrapper imposing the "disjoint-before" ordering: a region is less than
/// another iff it ends at or before the other's start, greater iff it starts
/// at or after the other's end, and equal otherwise (any kind of overlap).
///
/// This is only a consistent total order while the keys in a map are pairwise
/// non-overlapping, which [OverlapMap] maintains as an invariant. A probe key
/// then compares equal to exactly the stored keys it touches, and those form
/// a contiguous run in the ordering.
#[derive(Clone, Copy, Debug)]
struct SpanKey(MemRegion);

impl Ord for SpanKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0.end() <= other.0.addr {
            Ordering::Less
        } else if self.0.addr >= other.0.end() {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

impl PartialOrd for SpanKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SpanKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SpanKey {}

/// An ordered map keyed by non-overlapping address regions, supporting
/// overlap-aware lookup.
///
/// Lookups take a probe region and resolve to a stored entry that touches the
/// probe (any stored entry, if several do). Mutating operations keep the
/// non-overlap invariant; [insert](OverlapMap::insert) requires the caller to
/// have cleared overlapping entries first.
///
/// Probe regions must be non-empty; an empty probe sitting strictly inside a
/// stored region would compare equal to it while sharing no byte with it.
#[derive(Debug, Clone)]
pub struct OverlapMap<V> {
    entries: BTreeMap<SpanKey, V>,
}

impl<V> Default for OverlapMap<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<V> OverlapMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Insert an entry for `region`.
    ///
    /// The region must not overlap any stored entry; remove overlapping
    /// entries first (e.g. with [take_overlapping](Self::take_overlapping)).
    pub fn insert(&mut self, region: MemRegion, value: V) {
        debug_assert!(!region.is_empty(), "inserting empty region {region:?}");
        let replaced = self.entries.insert(SpanKey(region), value);
        debug_assert!(replaced.is_none(), "inserted region {region:?} overlapped a stored entry");
    }

    /// Find a stored entry overlapping `probe`.
    pub fn get_overlapping(&self, probe: MemRegion) -> Option<(MemRegion, &V)> {
        self.entries.get_key_value(&SpanKey(probe)).map(|(key, value)| (key.0, value))
    }

    /// Remove and return a stored entry overlapping `probe`.
    pub fn take_overlapping(&mut self, probe: MemRegion) -> Option<(MemRegion, V)> {
        self.entries.remove_entry(&SpanKey(probe)).map(|(key, value)| (key.0, value))
    }

    /// The regions of all stored entries overlapping `probe`, in address
    /// order.
    ///
    /// This snapshots the keys so the caller can mutate the map while
    /// processing them.
    pub fn overlapping_keys(&self, probe: MemRegion) -> SmallVec<[MemRegion; 4]> {
        let key = SpanKey(probe);
        self.entries.range(key..=key).map(|(stored, _)| stored.0).collect()
    }

    /// Iterate over all entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = (MemRegion, &V)> + '_ {
        self.entries.iter().map(|(key, value)| (key.0, value))
    }

    /// Iterate over all values in address order, mutably.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> + '_ {
        self.entries.values_mut()
    }

    /// Retain only the entries for which `keep` returns true; `keep` may
    /// mutate the value but not its region.
    pub fn retain(&mut self, mut keep: impl FnMut(MemRegion, &mut V) -> bool) {
        self.entries.retain(|key, value| keep(key.0, value));
    }

    /// Remove every stored byte intersecting `range`, preserving
    /// non-intersecting head and tail slivers of partially covered entries.
    ///
    /// `remap` derives the sliver value from the original entry's value and
    /// the sliver's region.
    pub fn remove_splitting_with(
        &mut self,
        range: MemRegion,
        mut remap: impl FnMut(&V, MemRegion) -> V,
    ) {
        if range.is_empty() {
            return;
        }
        while let Some((old, value)) = self.take_overlapping(range) {
            if old.addr < range.addr {
                let head = MemRegion::from_bounds(old.addr, range.addr);
                let head_value = remap(&value, head);
                self.insert(head, head_value);
            }
            if old.end() > range.end() {
                let tail = MemRegion::from_bounds(range.end(), old.end());
                let tail_value = remap(&value, tail);
                self.insert(tail, tail_value);
            }
        }
    }
}
