//! Role Sync Gateway
//!
//! Edge between the coordinator and the device-facing protocol layer.
//! Whenever the local node's resolved role for a device changes, the role
//! and its fencing term are pushed to the registered listener. The
//! protocol layer answers with a confirmation or a rejection, which is
//! logged and kept for diagnostics; rejections are not rolled back here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::role::{DeviceId, MastershipRole, MastershipTerm, NodeId};
use crate::store::RoleStoreEvent;

/// Receives the local node's role for each device
#[async_trait]
pub trait RoleSyncListener: Send + Sync {
    /// Negotiate `role` with the device, fenced by `term`
    async fn push_local_role(&self, device: &DeviceId, role: MastershipRole, term: MastershipTerm);
}

/// A role pushed to the device layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolePush {
    pub device: DeviceId,
    pub role: MastershipRole,
    pub term: MastershipTerm,
}

/// Listener that forwards pushes into a channel
pub struct ChannelRoleListener {
    tx: mpsc::UnboundedSender<RolePush>,
}

impl ChannelRoleListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RolePush>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RoleSyncListener for ChannelRoleListener {
    async fn push_local_role(&self, device: &DeviceId, role: MastershipRole, term: MastershipTerm) {
        let _ = self.tx.send(RolePush {
            device: device.clone(),
            role,
            term,
        });
    }
}

/// Device-side answer to the last pushed role
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoleAck {
    /// Pushed, no answer yet
    Pending,
    /// The device accepted the role
    Confirmed,
    /// The device refused the role
    Rejected { reason: String },
    /// The device reports a role other than the one pushed
    Mismatch {
        expected: MastershipRole,
        reported: MastershipRole,
    },
}

/// Last role pushed for a device and its acknowledgement
#[derive(Debug, Clone, Serialize)]
pub struct SyncState {
    pub role: MastershipRole,
    pub term: MastershipTerm,
    pub ack: RoleAck,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Pushes local roles down and collects acknowledgements
pub struct RoleSyncGateway {
    local_id: NodeId,
    listener: RwLock<Option<Arc<dyn RoleSyncListener>>>,
    states: RwLock<HashMap<DeviceId, SyncState>>,
    /// Held from the state check until the push returns, so pushes reach
    /// the listener in the order their states were recorded
    push_order: Mutex<()>,
}

impl RoleSyncGateway {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            listener: RwLock::new(None),
            states: RwLock::new(HashMap::new()),
            push_order: Mutex::new(()),
        }
    }

    /// Register the device layer, replacing any previous listener
    pub async fn register(&self, listener: Arc<dyn RoleSyncListener>) {
        *self.listener.write().await = Some(listener);
    }

    pub async fn unregister(&self) {
        *self.listener.write().await = None;
    }

    /// Push `role` unless it (and, for a master, its term) was already pushed.
    ///
    /// Devices never pushed are not told about `NONE`. Roles fenced by a term
    /// older than the last pushed one are dropped, as is a MASTER at the term
    /// of a pushed non-master role: a committed mastership always carries a
    /// newer term than the state it replaced. Returns true if the listener
    /// was called.
    pub async fn sync(&self, device: &DeviceId, role: MastershipRole, term: MastershipTerm) -> bool {
        let listener = match self.listener.read().await.clone() {
            Some(listener) => listener,
            None => return false,
        };

        let _order = self.push_order.lock().await;
        {
            let mut states = self.states.write().await;
            let skip = match states.get_mut(device) {
                Some(state) if term < state.term => {
                    tracing::debug!(
                        "Dropping stale role {} for {} (term {}, pushed term {})",
                        role,
                        device,
                        term,
                        state.term
                    );
                    true
                }
                Some(state) if term == state.term => {
                    state.role == role
                        || (role == MastershipRole::Master && state.role != MastershipRole::Master)
                }
                Some(state) if state.role == role && role != MastershipRole::Master => {
                    // Same role under a newer term: nothing to push, but older
                    // terms are stale from here on
                    state.term = term;
                    true
                }
                Some(_) => false,
                None => role == MastershipRole::None,
            };
            if skip {
                return false;
            }
            states.insert(
                device.clone(),
                SyncState {
                    role,
                    term,
                    ack: RoleAck::Pending,
                    updated_at: chrono::Utc::now(),
                },
            );
        }

        tracing::info!("Pushing local role {} for {} (term {})", role, device, term);
        listener.push_local_role(device, role, term).await;
        true
    }

    /// Push the local role resulting from a committed store write
    pub async fn handle_transition(&self, change: &RoleStoreEvent) -> bool {
        let (role, term) = match &change.current {
            Some(record) => (record.role_of(&self.local_id), record.term),
            None => {
                let term = change.previous.as_ref().map(|r| r.term).unwrap_or(0);
                let pushed = self.sync(&change.device, MastershipRole::None, term).await;
                self.forget(&change.device).await;
                return pushed;
            }
        };
        self.sync(&change.device, role, term).await
    }

    /// The device accepted a role
    pub async fn confirm_role(&self, device: &DeviceId, role: MastershipRole) {
        let mut states = self.states.write().await;
        match states.get_mut(device) {
            Some(state) if state.role == role => {
                tracing::debug!("Device {} confirmed role {}", device, role);
                state.ack = RoleAck::Confirmed;
                state.updated_at = chrono::Utc::now();
            }
            Some(state) => {
                tracing::warn!(
                    "Role mismatch on {}: pushed {}, device reports {}",
                    device,
                    state.role,
                    role
                );
                state.ack = RoleAck::Mismatch {
                    expected: state.role,
                    reported: role,
                };
                state.updated_at = chrono::Utc::now();
            }
            None => {
                tracing::warn!("Device {} confirmed role {} that was never pushed", device, role);
            }
        }
    }

    /// The device refused the last pushed role
    pub async fn reject_role(&self, device: &DeviceId, reason: &str) {
        let mut states = self.states.write().await;
        match states.get_mut(device) {
            Some(state) => {
                tracing::warn!(
                    "Device {} rejected role {} (term {}): {}",
                    device,
                    state.role,
                    state.term,
                    reason
                );
                state.ack = RoleAck::Rejected {
                    reason: reason.to_string(),
                };
                state.updated_at = chrono::Utc::now();
            }
            None => {
                tracing::warn!("Device {} rejected a role that was never pushed: {}", device, reason);
            }
        }
    }

    pub async fn state(&self, device: &DeviceId) -> Option<SyncState> {
        self.states.read().await.get(device).cloned()
    }

    /// All sync states, ordered by device
    pub async fn states(&self) -> Vec<(DeviceId, SyncState)> {
        let mut all: Vec<_> = self
            .states
            .read()
            .await
            .iter()
            .map(|(d, s)| (d.clone(), s.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub async fn forget(&self, device: &DeviceId) {
        self.states.write().await.remove(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::RoleRecord;

    async fn gateway() -> (RoleSyncGateway, mpsc::UnboundedReceiver<RolePush>) {
        let gateway = RoleSyncGateway::new(NodeId::new("node-1"));
        let (listener, rx) = ChannelRoleListener::new();
        gateway.register(Arc::new(listener)).await;
        (gateway, rx)
    }

    fn change(previous: Option<RoleRecord>, current: Option<RoleRecord>) -> RoleStoreEvent {
        RoleStoreEvent {
            device: DeviceId::new("of:1"),
            previous,
            current,
        }
    }

    fn record(master: Option<&str>, standbys: &[&str], term: u64) -> RoleRecord {
        RoleRecord {
            master: master.map(NodeId::new),
            standbys: standbys.iter().map(|s| NodeId::new(*s)).collect(),
            term,
        }
    }

    #[tokio::test]
    async fn test_pushes_only_on_local_role_change() {
        let (gateway, mut rx) = gateway().await;

        assert!(gateway.handle_transition(&change(None, Some(record(Some("node-1"), &[], 1)))).await);
        let push = rx.recv().await.unwrap();
        assert_eq!(push.role, MastershipRole::Master);
        assert_eq!(push.term, 1);

        // Standby list change does not affect the local role
        assert!(!gateway
            .handle_transition(&change(None, Some(record(Some("node-1"), &["node-2"], 1))))
            .await);

        assert!(gateway
            .handle_transition(&change(None, Some(record(Some("node-2"), &["node-1"], 2))))
            .await);
        assert_eq!(rx.recv().await.unwrap().role, MastershipRole::Standby);
    }

    #[tokio::test]
    async fn test_superseded_term_is_not_pushed() {
        let (gateway, mut rx) = gateway().await;
        let device = DeviceId::new("of:1");

        assert!(gateway.sync(&device, MastershipRole::Master, 3).await);
        rx.recv().await.unwrap();

        assert!(gateway
            .handle_transition(&change(None, Some(record(Some("node-2"), &["node-1"], 4))))
            .await);
        assert_eq!(rx.recv().await.unwrap().role, MastershipRole::Standby);

        // A resync from an older snapshot still sees node-1 as master
        assert!(!gateway.sync(&device, MastershipRole::Master, 3).await);
        assert!(!gateway.sync(&device, MastershipRole::Master, 4).await);
        let state = gateway.state(&device).await.unwrap();
        assert_eq!(state.role, MastershipRole::Standby);
        assert_eq!(state.term, 4);
        assert!(rx.try_recv().is_err());

        // Still a standby under node-3; the term moves without a push
        assert!(!gateway.sync(&device, MastershipRole::Standby, 6).await);
        assert!(!gateway.sync(&device, MastershipRole::Master, 5).await);
        assert_eq!(gateway.state(&device).await.unwrap().term, 6);

        assert!(gateway.sync(&device, MastershipRole::Master, 7).await);
        assert_eq!(
            rx.recv().await.unwrap(),
            RolePush {
                device: device.clone(),
                role: MastershipRole::Master,
                term: 7
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_syncs_push_in_state_order() {
        let (gateway, mut rx) = gateway().await;
        let gateway = Arc::new(gateway);
        let device = DeviceId::new("of:1");

        let handles: Vec<_> = (1..=50u64)
            .map(|term| {
                let gateway = Arc::clone(&gateway);
                let device = device.clone();
                tokio::spawn(async move { gateway.sync(&device, MastershipRole::Master, term).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let mut last = 0;
        while let Ok(push) = rx.try_recv() {
            assert!(push.term > last, "term {} pushed after {}", push.term, last);
            last = push.term;
        }
        assert_eq!(gateway.state(&device).await.unwrap().term, last);
    }

    #[tokio::test]
    async fn test_none_is_not_pushed_for_unknown_device() {
        let (gateway, _rx) = gateway().await;
        assert!(!gateway.handle_transition(&change(None, Some(record(Some("node-2"), &[], 1)))).await);
        assert!(gateway.state(&DeviceId::new("of:1")).await.is_none());
    }

    #[tokio::test]
    async fn test_acknowledgements_are_recorded() {
        let (gateway, _rx) = gateway().await;
        let device = DeviceId::new("of:1");
        gateway.sync(&device, MastershipRole::Master, 3).await;
        assert_eq!(gateway.state(&device).await.unwrap().ack, RoleAck::Pending);

        gateway.confirm_role(&device, MastershipRole::Master).await;
        assert_eq!(gateway.state(&device).await.unwrap().ack, RoleAck::Confirmed);

        gateway.confirm_role(&device, MastershipRole::Standby).await;
        assert_eq!(
            gateway.state(&device).await.unwrap().ack,
            RoleAck::Mismatch {
                expected: MastershipRole::Master,
                reported: MastershipRole::Standby
            }
        );

        gateway.reject_role(&device, "channel closed").await;
        assert!(matches!(
            gateway.state(&device).await.unwrap().ack,
            RoleAck::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_purge_pushes_none_and_forgets() {
        let (gateway, mut rx) = gateway().await;
        let mastered = record(Some("node-1"), &[], 1);
        gateway.handle_transition(&change(None, Some(mastered.clone()))).await;
        rx.recv().await.unwrap();

        assert!(gateway.handle_transition(&change(Some(mastered), None)).await);
        assert_eq!(rx.recv().await.unwrap().role, MastershipRole::None);
        assert!(gateway.states().await.is_empty());
    }
}
