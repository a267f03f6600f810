//! Region Index
//!
//! Maps devices to regions and regions to their ranked tiers of candidate
//! master nodes. Devices without a binding are balanced over all active
//! nodes.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::error::{Error, Result};
use crate::role::{DeviceId, NodeId, RegionId};

/// A topology region and its ranked candidate tiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    /// Tier 0 is the preferred pool of masters, later tiers are fallbacks
    pub master_tiers: Vec<BTreeSet<NodeId>>,
}

impl Region {
    pub fn new(id: RegionId, master_tiers: Vec<BTreeSet<NodeId>>) -> Self {
        Self { id, master_tiers }
    }

    /// Check that the region has tiers, none of them empty, and that no
    /// node appears in two tiers.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::UnknownRegionConfig {
            region: self.id.to_string(),
            reason,
        };

        if self.master_tiers.is_empty() {
            return Err(invalid("region has no master tiers".into()));
        }

        let mut seen = BTreeSet::new();
        for (index, tier) in self.master_tiers.iter().enumerate() {
            if tier.is_empty() {
                return Err(invalid(format!("tier {} is empty", index)));
            }
            for node in tier {
                if !seen.insert(node) {
                    return Err(invalid(format!("node {} appears in more than one tier", node)));
                }
            }
        }
        Ok(())
    }

    /// Tier a node belongs to
    pub fn tier_of(&self, node: &NodeId) -> Option<usize> {
        self.master_tiers.iter().position(|tier| tier.contains(node))
    }

    /// First tier with at least one active node, as (index, active members)
    pub fn active_tier(&self, active: &BTreeSet<NodeId>) -> Option<(usize, BTreeSet<NodeId>)> {
        first_active_tier(&self.master_tiers, active)
    }
}

/// First tier in `tiers` with at least one node in `active`
pub fn first_active_tier(
    tiers: &[BTreeSet<NodeId>],
    active: &BTreeSet<NodeId>,
) -> Option<(usize, BTreeSet<NodeId>)> {
    tiers.iter().enumerate().find_map(|(index, tier)| {
        let live: BTreeSet<NodeId> = tier.intersection(active).cloned().collect();
        if live.is_empty() {
            None
        } else {
            Some((index, live))
        }
    })
}

/// Region topology change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    RegionUpdated(RegionId),
    RegionRemoved(RegionId),
    DeviceBound { device: DeviceId, region: RegionId },
    DeviceUnbound(DeviceId),
}

/// Device to region bindings and region tiers
pub struct RegionIndex {
    regions: RwLock<HashMap<RegionId, Region>>,
    bindings: RwLock<HashMap<DeviceId, RegionId>>,
    events: broadcast::Sender<TopologyEvent>,
}

impl RegionIndex {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            regions: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to topology changes
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: TopologyEvent) {
        tracing::debug!("Topology change: {:?}", event);
        let _ = self.events.send(event);
    }

    /// Add or replace a region after validating its tiers
    pub async fn upsert_region(&self, region: Region) -> Result<()> {
        region.validate()?;
        self.load_region(region).await;
        Ok(())
    }

    /// Mirror a region from the topology store as-is.
    ///
    /// Malformed tiers are kept and reported when the region is balanced.
    pub async fn load_region(&self, region: Region) {
        let id = region.id.clone();
        let changed = self.regions.write().await.insert(id.clone(), region.clone()) != Some(region);
        if changed {
            self.notify(TopologyEvent::RegionUpdated(id));
        }
    }

    /// Remove a region together with its device bindings
    pub async fn remove_region(&self, id: &RegionId) -> Option<Region> {
        let removed = self.regions.write().await.remove(id);
        if removed.is_some() {
            self.bindings.write().await.retain(|_, region| region != id);
            self.notify(TopologyEvent::RegionRemoved(id.clone()));
        }
        removed
    }

    /// Bind a device to an existing region
    pub async fn bind_device(&self, device: DeviceId, region: RegionId) -> Result<()> {
        if !self.regions.read().await.contains_key(&region) {
            return Err(Error::UnknownRegion(region.to_string()));
        }
        let previous = self
            .bindings
            .write()
            .await
            .insert(device.clone(), region.clone());
        if previous.as_ref() != Some(&region) {
            self.notify(TopologyEvent::DeviceBound { device, region });
        }
        Ok(())
    }

    /// Remove a device binding
    pub async fn unbind_device(&self, device: &DeviceId) -> Option<RegionId> {
        let removed = self.bindings.write().await.remove(device);
        if removed.is_some() {
            self.notify(TopologyEvent::DeviceUnbound(device.clone()));
        }
        removed
    }

    /// Region a device is bound to
    pub async fn region_for(&self, device: &DeviceId) -> Option<RegionId> {
        self.bindings.read().await.get(device).cloned()
    }

    /// Validated tiers of a region
    pub async fn tiers_for(&self, id: &RegionId) -> Result<Vec<BTreeSet<NodeId>>> {
        let regions = self.regions.read().await;
        let region = regions
            .get(id)
            .ok_or_else(|| Error::UnknownRegion(id.to_string()))?;
        region.validate()?;
        Ok(region.master_tiers.clone())
    }

    pub async fn get_region(&self, id: &RegionId) -> Option<Region> {
        self.regions.read().await.get(id).cloned()
    }

    /// All regions, ordered by id
    pub async fn regions(&self) -> Vec<Region> {
        let mut regions: Vec<_> = self.regions.read().await.values().cloned().collect();
        regions.sort_by(|a, b| a.id.cmp(&b.id));
        regions
    }

    /// Devices bound to a region
    pub async fn devices_in(&self, id: &RegionId) -> BTreeSet<DeviceId> {
        self.bindings
            .read()
            .await
            .iter()
            .filter(|(_, region)| *region == id)
            .map(|(device, _)| device.clone())
            .collect()
    }

    /// Snapshot of all device bindings
    pub async fn bindings(&self) -> HashMap<DeviceId, RegionId> {
        self.bindings.read().await.clone()
    }
}

impl Default for RegionIndex {
    fn default() -> Self {
        Self::new()
    }
}
