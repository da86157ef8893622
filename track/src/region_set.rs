use crate::{overlap_map::OverlapMap, region::MemRegion};

/// How a probe region relates to a region set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionCover {
    /// No stored region overlaps the probe.
    Absent = 0,
    /// A single stored region contains the whole probe.
    Full = 1,
    /// The probe overlaps stored regions without being contained in one.
    Partial = 2,
}

/// An ordered set of non-overlapping regions with insertion-time coalescing
/// and deletion-time splitting.
///
/// Each region carries a payload `V` (unit for plain address sets; a capture
/// context for transaction member regions). Coalescing keeps the payload of
/// the inserted region; splitting clones the payload into the slivers.
#[derive(Debug, Clone)]
pub struct RegionSet<V = ()> {
    map: OverlapMap<V>,
}

impl<V> Default for RegionSet<V> {
    fn default() -> Self {
        Self {
            map: OverlapMap::new(),
        }
    }
}

impl<V: Clone> RegionSet<V> {
    pub fn new() -> Self {
        Self {
            map: OverlapMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Insert `region`, merging it with every stored region it overlaps or
    /// touches. The union keeps `value`.
    pub fn insert_coalescing(&mut self, region: MemRegion, value: V) {
        let mut grown = region;
        loop {
            // scan one byte beyond both ends so touching neighbors merge too
            let scan = MemRegion::from_bounds(
                grown.addr.saturating_sub(1),
                grown.end().saturating_add(1),
            );
            match self.map.take_overlapping(scan) {
                Some((old, _)) => grown = grown.merge(&old),
                None => break,
            }
        }
        self.map.insert(grown, value);
    }

    /// Remove every stored byte intersecting `range`; non-intersecting head
    /// and tail slivers of partially covered regions survive.
    pub fn remove_splitting(&mut self, range: MemRegion) {
        self.map.remove_splitting_with(range, |value, _| value.clone());
    }

    /// Classify `probe` against the stored regions.
    pub fn classify(&self, probe: MemRegion) -> RegionCover {
        match self.map.get_overlapping(probe) {
            None => RegionCover::Absent,
            Some((stored, _)) if stored.contains(&probe) => RegionCover::Full,
            Some(_) => RegionCover::Partial,
        }
    }

    /// Whether any stored region overlaps `probe`.
    pub fn overlaps(&self, probe: MemRegion) -> bool {
        self.map.get_overlapping(probe).is_some()
    }

    /// Whether a single stored region contains the whole of `probe`.
    pub fn covers(&self, probe: MemRegion) -> bool {
        self.classify(probe) == RegionCover::Full
    }

    /// A stored region overlapping `probe`, with its payload.
    pub fn get_overlapping(&self, probe: MemRegion) -> Option<(MemRegion, &V)> {
        self.map.get_overlapping(probe)
    }

    /// Iterate over the stored regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = (MemRegion, &V)> + '_ {
        self.map.iter()
    }
}
