//! Cluster View
//!
//! Read-side caches of the two external inputs the coordinator depends on:
//! which controller nodes are alive, and how devices are grouped into
//! regions with ranked candidate tiers.

mod membership;
mod region;

pub use membership::{ClusterSummary, ControllerNode, MembershipEvent, MembershipView, NodeStatus};
pub use region::{first_active_tier, Region, RegionIndex, TopologyEvent};
