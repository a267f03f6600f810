//! Role Record
//!
//! The per-device assignment: current master, ordered standbys and term.

use serde::{Deserialize, Serialize};

use super::{MastershipRole, MastershipTerm, NodeId};

/// Role assignment of a single device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRecord {
    /// Current master (None = unowned)
    pub master: Option<NodeId>,
    /// Standby nodes in promotion order (index 0 is promoted next)
    pub standbys: Vec<NodeId>,
    /// Fencing term
    pub term: MastershipTerm,
}

impl RoleRecord {
    /// Create the empty record used for a device seen for the first time
    pub fn new() -> Self {
        Self::default()
    }

    /// Role held by `node` in this record
    pub fn role_of(&self, node: &NodeId) -> MastershipRole {
        if self.is_master(node) {
            MastershipRole::Master
        } else if self.standbys.contains(node) {
            MastershipRole::Standby
        } else {
            MastershipRole::None
        }
    }

    /// Check whether `node` is the master
    pub fn is_master(&self, node: &NodeId) -> bool {
        self.master.as_ref() == Some(node)
    }

    /// A device without a master must go through an election before use
    pub fn is_unowned(&self) -> bool {
        self.master.is_none()
    }

    /// All nodes holding a role, master first
    pub fn nodes(&self) -> Vec<NodeId> {
        self.master
            .iter()
            .chain(self.standbys.iter())
            .cloned()
            .collect()
    }

    /// Install `node` as master.
    ///
    /// The previous master, if any, moves to the head of the standby list.
    /// Returns the previous master. Does not touch the term.
    pub(crate) fn install_master(&mut self, node: NodeId) -> Option<NodeId> {
        if self.is_master(&node) {
            return None;
        }
        self.remove_standby(&node);
        let previous = self.master.replace(node);
        if let Some(prev) = &previous {
            if !self.standbys.contains(prev) {
                self.standbys.insert(0, prev.clone());
            }
        }
        previous
    }

    /// Drop the current master without promoting anyone
    pub(crate) fn clear_master(&mut self) -> Option<NodeId> {
        self.master.take()
    }

    /// Promote the first standby accepted by `eligible`.
    ///
    /// Only valid while the device has no master.
    pub(crate) fn promote_first<F>(&mut self, eligible: F) -> Option<NodeId>
    where
        F: Fn(&NodeId) -> bool,
    {
        debug_assert!(self.master.is_none());
        let index = self.standbys.iter().position(|n| eligible(n))?;
        let node = self.standbys.remove(index);
        self.master = Some(node.clone());
        Some(node)
    }

    /// Append `node` to the standby list if it holds no role yet
    pub(crate) fn push_standby(&mut self, node: NodeId) -> bool {
        if self.is_master(&node) || self.standbys.contains(&node) {
            return false;
        }
        self.standbys.push(node);
        true
    }

    /// Make `node` the highest priority standby
    pub(crate) fn push_standby_front(&mut self, node: NodeId) {
        self.remove_standby(&node);
        self.standbys.insert(0, node);
    }

    pub(crate) fn remove_standby(&mut self, node: &NodeId) -> bool {
        let before = self.standbys.len();
        self.standbys.retain(|n| n != node);
        before != self.standbys.len()
    }

    /// Verify the record invariants: the master is never a standby and
    /// standbys hold no duplicates.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if let Some(master) = &self.master {
            if self.standbys.contains(master) {
                return Err(format!("master {} is also listed as standby", master));
            }
        }
        for (i, node) in self.standbys.iter().enumerate() {
            if self.standbys[i + 1..].contains(node) {
                return Err(format!("standby {} listed twice", node));
            }
        }
        Ok(())
    }
}
