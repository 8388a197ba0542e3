//! Region registry: the single owner of live region objects.
//!
//! Components hold region ids, never owning back-pointers; lookups return
//! shared handles and the registry outlives every transitive reference.

use std::sync::Arc;

use dashmap::DashMap;
use kite_common::types::RegionId;

use crate::region::{Region, RegionState};

#[derive(Default)]
pub struct RegionRegistry {
    regions: DashMap<RegionId, Arc<Region>>,
}

impl RegionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, region: Arc<Region>) {
        self.regions.insert(region.id(), region);
    }

    pub fn get(&self, region_id: RegionId) -> Option<Arc<Region>> {
        self.regions.get(&region_id).map(|r| Arc::clone(r.value()))
    }

    pub fn remove(&self, region_id: RegionId) -> Option<Arc<Region>> {
        self.regions.remove(&region_id).map(|(_, r)| r)
    }

    /// Regions that are serving or transitioning; Tombstone and Orphan
    /// replicas are excluded.
    pub fn alive_regions(&self) -> Vec<Arc<Region>> {
        self.regions
            .iter()
            .filter(|e| {
                !matches!(
                    e.value().state(),
                    RegionState::Tombstone | RegionState::Orphan
                )
            })
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn region_ids(&self) -> Vec<RegionId> {
        self.regions.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
