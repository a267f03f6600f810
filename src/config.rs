//! WolfMaster Configuration
//!
//! This module provides configuration structures for the WolfMaster
//! mastership coordination node.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::Region;
use crate::coordinator::CoordinatorConfig;
use crate::role::{DeviceId, NodeId, RegionId};

/// Main WolfMaster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfMasterConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster membership configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Role store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Balancer configuration
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Election configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// Static regions
    #[serde(default)]
    pub regions: Vec<RegionConfig>,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Data directory for the role database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address other nodes and tools use to reach this node
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// A peer controller node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: String,
    pub address: String,
}

/// Cluster membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Other controller nodes
    #[serde(default)]
    pub members: Vec<MemberConfig>,

    /// Silence after which a member is considered inactive
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// How often heartbeat timeouts are checked
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

/// Role store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

/// Role store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
}

/// Balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Run balance passes in the background
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Periodic pass interval in seconds (0 = only on triggers)
    #[serde(default = "default_balance_interval_secs")]
    pub interval_secs: u64,

    /// Maximum random delay before a pass, in milliseconds
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// Balance when a node joins, leaves or changes status
    #[serde(default = "default_true")]
    pub on_membership_change: bool,

    /// Balance when regions or device bindings change
    #[serde(default = "default_true")]
    pub on_topology_change: bool,
}

/// Election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Bootstrap elections honour region tiers
    #[serde(default = "default_true")]
    pub respect_region_policy: bool,

    /// Local role re-push interval in seconds (0 = disabled)
    #[serde(default = "default_integrity_check_secs")]
    pub integrity_check_secs: u64,
}

/// A region with ranked master tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub id: String,

    /// Node ids per tier, most preferred first
    pub tiers: Vec<Vec<String>>,

    /// Devices bound to this region
    #[serde(default)]
    pub devices: Vec<String>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_heartbeat_timeout_ms() -> u64 {
    3000
}

fn default_check_interval_ms() -> u64 {
    1000
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_balance_interval_secs() -> u64 {
    30
}

fn default_jitter_ms() -> u64 {
    500
}

fn default_integrity_check_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8180".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfmaster")
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_balance_interval_secs(),
            jitter_ms: default_jitter_ms(),
            on_membership_change: true,
            on_topology_change: true,
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            respect_region_policy: true,
            integrity_check_secs: default_integrity_check_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RegionConfig {
    /// Convert to a region, without validating the tiers
    pub fn to_region(&self) -> Region {
        Region::new(
            RegionId::new(self.id.as_str()),
            self.tiers
                .iter()
                .map(|tier| tier.iter().map(|n| NodeId::new(n.as_str())).collect::<BTreeSet<_>>())
                .collect(),
        )
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|d| DeviceId::new(d.as_str())).collect()
    }
}

impl WolfMasterConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfMasterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        let mut members = HashSet::new();
        members.insert(self.node.id.as_str());
        for member in &self.cluster.members {
            if member.id.is_empty() {
                return Err(crate::Error::Config("cluster member id cannot be empty".into()));
            }
            if !members.insert(member.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "cluster member {} is listed more than once",
                    member.id
                )));
            }
        }

        if self.cluster.heartbeat_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "cluster.heartbeat_timeout_ms must be positive".into(),
            ));
        }

        let mut bound: HashMap<&str, &str> = HashMap::new();
        let mut region_ids = HashSet::new();
        for region in &self.regions {
            if !region_ids.insert(region.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "region {} is defined more than once",
                    region.id
                )));
            }
            region.to_region().validate()?;
            for device in &region.devices {
                if let Some(other) = bound.insert(device.as_str(), region.id.as_str()) {
                    return Err(crate::Error::Config(format!(
                        "device {} is bound to both {} and {}",
                        device, other, region.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Get the advertised address (or the API address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.api.bind_address)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get heartbeat timeout as Duration
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_timeout_ms)
    }

    /// Get timeout check interval as Duration
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.check_interval_ms.max(1))
    }

    /// Coordinator tuning derived from the balancer and election sections
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let balancer = &self.balancer;
        CoordinatorConfig {
            respect_region_policy: self.election.respect_region_policy,
            balance_interval: (balancer.enabled && balancer.interval_secs > 0)
                .then(|| Duration::from_secs(balancer.interval_secs)),
            balance_jitter: Duration::from_millis(balancer.jitter_ms),
            balance_on_membership_change: balancer.enabled && balancer.on_membership_change,
            balance_on_topology_change: balancer.enabled && balancer.on_topology_change,
            integrity_check_interval: (self.election.integrity_check_secs > 0)
                .then(|| Duration::from_secs(self.election.integrity_check_secs)),
        }
    }
}
