//! Role Model
//!
//! Identifiers, mastership roles and the per-device role record that the
//! coordinator reads and writes through the role store.

mod record;

pub use record::RoleRecord;

use serde::{Deserialize, Serialize};

/// Fencing term of a device. Starts at 0 and grows by one per master change.
pub type MastershipTerm = u64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of a cluster member
    NodeId
);

string_id!(
    /// Identifier of a managed network device
    DeviceId
);

string_id!(
    /// Identifier of a topology region
    RegionId
);

/// Role a node holds for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MastershipRole {
    /// Authoritative controller of the device
    Master,
    /// Fallback controller, promoted in list order
    Standby,
    /// No role held; one may be requested
    None,
}

impl std::fmt::Display for MastershipRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MastershipRole::Master => write!(f, "MASTER"),
            MastershipRole::Standby => write!(f, "STANDBY"),
            MastershipRole::None => write!(f, "NONE"),
        }
    }
}

impl std::str::FromStr for MastershipRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MASTER" => Ok(MastershipRole::Master),
            "STANDBY" => Ok(MastershipRole::Standby),
            "NONE" => Ok(MastershipRole::None),
            other => Err(crate::Error::Config(format!("unknown mastership role '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_and_display() {
        for role in [MastershipRole::Master, MastershipRole::Standby, MastershipRole::None] {
            let parsed: MastershipRole = role.to_string().parse().unwrap();
            assert_eq!(parsed, role);
        }
        assert_eq!("standby".parse::<MastershipRole>().unwrap(), MastershipRole::Standby);
        assert!("leader".parse::<MastershipRole>().is_err());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let node = NodeId::new("node-1");
        assert_eq!(serde_json::to_string(&node).unwrap(), "\"node-1\"");
        let device: DeviceId = serde_json::from_str("\"of:0000000000000001\"").unwrap();
        assert_eq!(device.as_str(), "of:0000000000000001");
        assert_eq!(serde_json::to_string(&MastershipRole::Master).unwrap(), "\"MASTER\"");
    }
}
