//! Cluster Membership View
//!
//! Tracks which controller nodes are known and which of them are ACTIVE.
//! Fed by the membership service (snapshots or heartbeats); the coordinator
//! only reads it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::error::{Error, Result};
use crate::role::NodeId;

/// Liveness of a node as seen by the membership service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    /// Reachable and eligible for mastership
    Active,
    /// Known but currently unreachable
    Inactive,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "ACTIVE"),
            NodeStatus::Inactive => write!(f, "INACTIVE"),
        }
    }
}

/// A controller node of the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerNode {
    /// Unique node identifier
    pub id: NodeId,
    /// Node address (host:port)
    pub address: String,
    /// Current status
    pub status: NodeStatus,
    /// Last heartbeat time (not serialized)
    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
    /// When the node was first seen
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

impl ControllerNode {
    pub fn new(id: NodeId, address: String, status: NodeStatus) -> Self {
        Self {
            id,
            address,
            status,
            last_heartbeat: None,
            joined_at: chrono::Utc::now(),
        }
    }

    /// Check if the node is healthy (received heartbeat recently)
    pub fn is_healthy(&self, timeout: Duration) -> bool {
        match self.last_heartbeat {
            Some(last) => last.elapsed() < timeout,
            None => false,
        }
    }

    /// Update heartbeat time
    pub fn touch(&mut self) {
        self.last_heartbeat = Some(Instant::now());
    }
}

/// Membership change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeAdded(NodeId),
    NodeRemoved(NodeId),
    NodeActivated(NodeId),
    NodeDeactivated(NodeId),
}

/// Snapshot of cluster membership
pub struct MembershipView {
    /// This node's ID
    local_id: NodeId,
    /// All known nodes (including self)
    nodes: RwLock<HashMap<NodeId, ControllerNode>>,
    /// Silence after which a node is considered INACTIVE
    heartbeat_timeout: Duration,
    /// Change notifications
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipView {
    /// Create a view containing only the local node, ACTIVE
    pub fn new(local_id: NodeId, address: String, heartbeat_timeout: Duration) -> Self {
        let mut nodes = HashMap::new();
        let mut self_node = ControllerNode::new(local_id.clone(), address, NodeStatus::Active);
        self_node.touch();
        nodes.insert(local_id.clone(), self_node);

        let (events, _) = broadcast::channel(256);
        Self {
            local_id,
            nodes: RwLock::new(nodes),
            heartbeat_timeout,
            events,
        }
    }

    /// Get this node's ID
    pub fn local_node_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Subscribe to membership changes
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: MembershipEvent) {
        tracing::debug!("Membership change: {:?}", event);
        let _ = self.events.send(event);
    }

    /// Add a node. Returns false if it was already known.
    pub async fn add_node(&self, id: NodeId, address: String, status: NodeStatus) -> bool {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&id) {
            return false;
        }
        let mut node = ControllerNode::new(id.clone(), address, status);
        if status == NodeStatus::Active {
            node.touch();
        }
        nodes.insert(id.clone(), node);
        drop(nodes);

        self.notify(MembershipEvent::NodeAdded(id));
        true
    }

    /// Forget a node entirely
    pub async fn remove_node(&self, id: &NodeId) -> Option<ControllerNode> {
        let removed = self.nodes.write().await.remove(id);
        if removed.is_some() {
            self.notify(MembershipEvent::NodeRemoved(id.clone()));
        }
        removed
    }

    /// Set a node's status. Returns true if it changed.
    pub async fn set_status(&self, id: &NodeId, status: NodeStatus) -> Result<bool> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| Error::InvalidNode(id.to_string()))?;
        if node.status == status {
            return Ok(false);
        }
        node.status = status;
        if status == NodeStatus::Active {
            node.touch();
        }
        drop(nodes);

        self.notify(match status {
            NodeStatus::Active => MembershipEvent::NodeActivated(id.clone()),
            NodeStatus::Inactive => MembershipEvent::NodeDeactivated(id.clone()),
        });
        Ok(true)
    }

    /// Record a heartbeat from a node, reactivating it if needed
    pub async fn record_heartbeat(&self, id: &NodeId) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| Error::InvalidNode(id.to_string()))?;
        node.touch();
        if node.status == NodeStatus::Inactive {
            node.status = NodeStatus::Active;
            drop(nodes);
            tracing::info!("Node {} is back online", id);
            self.notify(MembershipEvent::NodeActivated(id.clone()));
        }
        Ok(())
    }

    /// Mark nodes without a recent heartbeat INACTIVE.
    ///
    /// Only nodes a heartbeat was ever received from can time out; the local
    /// node never does. Returns the nodes that went INACTIVE.
    pub async fn check_timeouts(&self) -> Vec<NodeId> {
        let mut nodes = self.nodes.write().await;
        let mut timed_out = Vec::new();

        for (id, node) in nodes.iter_mut() {
            if id == &self.local_id || node.last_heartbeat.is_none() {
                continue;
            }
            if node.status == NodeStatus::Active && !node.is_healthy(self.heartbeat_timeout) {
                node.status = NodeStatus::Inactive;
                timed_out.push(id.clone());
            }
        }
        drop(nodes);

        for id in &timed_out {
            tracing::warn!("Node {} timed out", id);
            self.notify(MembershipEvent::NodeDeactivated(id.clone()));
        }
        timed_out
    }

    /// Apply a snapshot of active nodes from the membership service.
    ///
    /// Known nodes absent from `active` become INACTIVE; unknown ids are
    /// added. Returns true if anything changed.
    pub async fn refresh(&self, active: &HashSet<NodeId>) -> bool {
        let mut changes = Vec::new();
        {
            let mut nodes = self.nodes.write().await;
            for (id, node) in nodes.iter_mut() {
                let status = if active.contains(id) {
                    NodeStatus::Active
                } else {
                    NodeStatus::Inactive
                };
                if node.status != status {
                    node.status = status;
                    changes.push(match status {
                        NodeStatus::Active => MembershipEvent::NodeActivated(id.clone()),
                        NodeStatus::Inactive => MembershipEvent::NodeDeactivated(id.clone()),
                    });
                }
            }
            for id in active {
                if !nodes.contains_key(id) {
                    let mut node = ControllerNode::new(id.clone(), String::new(), NodeStatus::Active);
                    node.touch();
                    nodes.insert(id.clone(), node);
                    changes.push(MembershipEvent::NodeAdded(id.clone()));
                }
            }
        }

        let changed = !changes.is_empty();
        for event in changes {
            self.notify(event);
        }
        changed
    }

    /// Check whether a node is a known member (any status)
    pub async fn is_member(&self, id: &NodeId) -> bool {
        self.nodes.read().await.contains_key(id)
    }

    /// Check whether a node is ACTIVE
    pub async fn is_active(&self, id: &NodeId) -> bool {
        self.nodes
            .read()
            .await
            .get(id)
            .map(|n| n.status == NodeStatus::Active)
            .unwrap_or(false)
    }

    /// All ACTIVE nodes
    pub async fn all_active(&self) -> BTreeSet<NodeId> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .map(|n| n.id.clone())
            .collect()
    }

    /// All known node ids
    pub async fn all_members(&self) -> BTreeSet<NodeId> {
        self.nodes.read().await.keys().cloned().collect()
    }

    /// All known nodes, ordered by id
    pub async fn all_nodes(&self) -> Vec<ControllerNode> {
        let mut nodes: Vec<_> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Get a node
    pub async fn get_node(&self, id: &NodeId) -> Option<ControllerNode> {
        self.nodes.read().await.get(id).cloned()
    }

    /// Get cluster summary
    pub async fn summary(&self) -> ClusterSummary {
        let nodes = self.nodes.read().await;
        let active_nodes = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .count();
        ClusterSummary {
            total_nodes: nodes.len(),
            active_nodes,
            inactive_nodes: nodes.len() - active_nodes,
        }
    }
}

/// Cluster summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub inactive_nodes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> MembershipView {
        MembershipView::new(
            NodeId::new("node-1"),
            "localhost:7654".to_string(),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_membership_add_and_status() {
        let view = view();
        let node2 = NodeId::new("node-2");
        assert!(view.add_node(node2.clone(), "localhost:7655".into(), NodeStatus::Inactive).await);
        assert!(!view.add_node(node2.clone(), "localhost:7655".into(), NodeStatus::Active).await);

        assert!(view.is_member(&node2).await);
        assert!(!view.is_active(&node2).await);
        assert!(view.set_status(&node2, NodeStatus::Active).await.unwrap());
        assert!(!view.set_status(&node2, NodeStatus::Active).await.unwrap());
        assert_eq!(view.all_active().await.len(), 2);

        let err = view.set_status(&NodeId::new("node-9"), NodeStatus::Active).await;
        assert!(matches!(err, Err(Error::InvalidNode(_))));
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_and_recovery() {
        let view = view();
        let node2 = NodeId::new("node-2");
        view.add_node(node2.clone(), "localhost:7655".into(), NodeStatus::Active).await;
        let mut rx = view.subscribe();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let timed_out = view.check_timeouts().await;
        assert_eq!(timed_out, vec![node2.clone()]);
        assert!(!view.is_active(&node2).await);
        // Local node never times out
        assert!(view.is_active(&NodeId::new("node-1")).await);
        assert_eq!(rx.recv().await.unwrap(), MembershipEvent::NodeDeactivated(node2.clone()));

        view.record_heartbeat(&node2).await.unwrap();
        assert!(view.is_active(&node2).await);
        assert_eq!(rx.recv().await.unwrap(), MembershipEvent::NodeActivated(node2));
    }

    #[tokio::test]
    async fn test_refresh_from_snapshot() {
        let view = view();
        view.add_node(NodeId::new("node-2"), String::new(), NodeStatus::Active).await;

        let active: HashSet<NodeId> = [NodeId::new("node-1"), NodeId::new("node-3")].into_iter().collect();
        assert!(view.refresh(&active).await);
        assert!(!view.refresh(&active).await);

        assert!(!view.is_active(&NodeId::new("node-2")).await);
        assert!(view.is_active(&NodeId::new("node-3")).await);
        let summary = view.summary().await;
        assert_eq!(summary.total_nodes, 3);
        assert_eq!(summary.active_nodes, 2);
        assert_eq!(summary.inactive_nodes, 1);
    }
}
