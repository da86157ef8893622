use crate::{
    region::MemRegion,
    region_set::{RegionCover, RegionSet},
};

/// The registered persistent mappings and the optional loggable regions.
///
/// The mappings set is the persistence filter consulted on every observed
/// store; the loggable set gates store-log emission when global logging is
/// off.
#[derive(Debug, Default)]
pub struct RegionRegistry {
    mappings: RegionSet,
    loggable: RegionSet,
}

impl RegionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_mapping(&mut self, region: MemRegion) {
        log::debug!(target: "track", "registering persistent mapping {region}");
        self.mappings.insert_coalescing(region, ());
    }

    pub fn remove_mapping(&mut self, region: MemRegion) {
        log::debug!(target: "track", "removing persistent mapping {region}");
        self.mappings.remove_splitting(region);
    }

    /// Classify a range against the registered mappings.
    pub fn check_mapping(&self, region: MemRegion) -> RegionCover {
        self.mappings.classify(region)
    }

    /// The persistence filter: whether a store to `region` touches persistent
    /// memory at all.
    pub fn is_pmem_access(&self, region: MemRegion) -> bool {
        self.mappings.overlaps(region)
    }

    /// The registered mappings, in address order.
    pub fn mappings(&self) -> impl Iterator<Item = MemRegion> + '_ {
        self.mappings.iter().map(|(region, _)| region)
    }

    pub fn add_log_region(&mut self, region: MemRegion) {
        self.loggable.insert_coalescing(region, ());
    }

    pub fn remove_log_region(&mut self, region: MemRegion) {
        self.loggable.remove_splitting(region);
    }

    /// Whether the loggable-region set asks for a store to `region` to be
    /// logged: the set is non-empty and fully covers the store.
    pub fn loggable_covers(&self, region: MemRegion) -> bool {
        !self.loggable.is_empty() && self.loggable.classify(region) == RegionCover::Full
    }
}
