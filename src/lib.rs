//! WolfMaster - Device Mastership Coordinator
//!
//! Decides, for every network device, which controller node in a cluster is
//! its master and which nodes are ordered standbys, and keeps that decision
//! consistent while nodes come and go.
//!
//! # Architecture
//!
//! Every node runs one [`coordinator::MastershipCoordinator`]. Coordinators
//! never talk to each other directly: they share a versioned role store
//! and settle every decision with compare-and-set transactions on it.
//! Each committed master change bumps a per-device fencing term so stale
//! masters can be told apart from current ones.
//!
//! # Features
//!
//! - Exclusive mastership with ordered standby promotion
//! - Monotonic fencing terms per device
//! - Region tiers with fallback to the next tier when a tier goes dark
//! - Balancing of masters across the active nodes of each region
//! - Ordered mastership events and local role sync to the device layer
//! - In-memory and SQLite role stores
//! - HTTP API for role queries and manual changes

pub mod api;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod gateway;
pub mod role;
pub mod store;
pub mod term;

pub use config::WolfMasterConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{MembershipView, NodeStatus, Region, RegionIndex};
    pub use crate::config::WolfMasterConfig;
    pub use crate::coordinator::{BalanceReport, CoordinatorConfig, MastershipCoordinator};
    pub use crate::error::{Error, Result};
    pub use crate::events::{MastershipEvent, MastershipEventKind};
    pub use crate::gateway::{RoleSyncGateway, RoleSyncListener};
    pub use crate::role::{DeviceId, MastershipRole, MastershipTerm, NodeId, RegionId, RoleRecord};
    pub use crate::store::{MemoryRoleStore, RoleStore, SqliteRoleStore};
}
