//! Mastership Events
//!
//! Turns committed role store writes into typed events for listeners that
//! the owner of the coordinator registers. Events for a device come out in
//! the order its writes were committed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::role::{DeviceId, RoleRecord};
use crate::store::RoleStoreEvent;

/// Kind of mastership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MastershipEventKind {
    /// A new master was installed
    MasterChanged,
    /// Only the standby list changed
    BackupsChanged,
    /// The device lost its master and none was promoted
    Suspended,
    /// The fencing term moved
    TermChanged,
    /// The device record was purged
    Purged,
}

/// A mastership change of one device
#[derive(Debug, Clone, Serialize)]
pub struct MastershipEvent {
    pub kind: MastershipEventKind,
    pub device: DeviceId,
    /// Record after the change (the last record for `Purged`)
    pub record: RoleRecord,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Broadcasts mastership events
pub struct MastershipEventPublisher {
    tx: broadcast::Sender<MastershipEvent>,
    published: AtomicU64,
}

impl MastershipEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    /// Register a listener
    pub fn subscribe(&self) -> broadcast::Receiver<MastershipEvent> {
        self.tx.subscribe()
    }

    /// Events describing the move from `previous` to `current`
    pub fn transition_events(
        device: &DeviceId,
        previous: Option<&RoleRecord>,
        current: Option<&RoleRecord>,
    ) -> Vec<MastershipEvent> {
        let timestamp = chrono::Utc::now();
        let event = |kind, record: &RoleRecord| MastershipEvent {
            kind,
            device: device.clone(),
            record: record.clone(),
            timestamp,
        };

        let current = match current {
            Some(current) => current,
            None => {
                return previous
                    .map(|last| vec![event(MastershipEventKind::Purged, last)])
                    .unwrap_or_default();
            }
        };
        let empty = RoleRecord::new();
        let previous = previous.unwrap_or(&empty);

        let mut events = Vec::new();
        if current.master != previous.master {
            if current.master.is_some() {
                events.push(event(MastershipEventKind::MasterChanged, current));
            } else {
                events.push(event(MastershipEventKind::Suspended, current));
            }
        } else if current.standbys != previous.standbys {
            events.push(event(MastershipEventKind::BackupsChanged, current));
        }
        if current.term != previous.term {
            events.push(event(MastershipEventKind::TermChanged, current));
        }
        events
    }

    /// Publish the events of a committed write. Returns how many were sent.
    pub fn publish(&self, change: &RoleStoreEvent) -> usize {
        let events = Self::transition_events(
            &change.device,
            change.previous.as_ref(),
            change.current.as_ref(),
        );
        let count = events.len();
        for event in events {
            tracing::debug!(
                "Mastership event {:?} for {} (term {})",
                event.kind,
                event.device,
                event.record.term
            );
            // No receivers is fine
            let _ = self.tx.send(event);
        }
        self.published.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Total events published
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for MastershipEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::NodeId;

    fn record(master: Option<&str>, standbys: &[&str], term: u64) -> RoleRecord {
        RoleRecord {
            master: master.map(NodeId::new),
            standbys: standbys.iter().map(|s| NodeId::new(*s)).collect(),
            term,
        }
    }

    fn kinds(events: &[MastershipEvent]) -> Vec<MastershipEventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_master_change_emits_term_change() {
        let device = DeviceId::new("of:1");
        let events = MastershipEventPublisher::transition_events(
            &device,
            None,
            Some(&record(Some("node-1"), &[], 1)),
        );
        assert_eq!(
            kinds(&events),
            vec![MastershipEventKind::MasterChanged, MastershipEventKind::TermChanged]
        );
    }

    #[test]
    fn test_backup_and_suspend_and_purge() {
        let device = DeviceId::new("of:1");
        let before = record(Some("node-1"), &["node-2"], 1);

        let events = MastershipEventPublisher::transition_events(
            &device,
            Some(&before),
            Some(&record(Some("node-1"), &["node-2", "node-3"], 1)),
        );
        assert_eq!(kinds(&events), vec![MastershipEventKind::BackupsChanged]);

        let events = MastershipEventPublisher::transition_events(
            &device,
            Some(&before),
            Some(&record(None, &["node-2"], 1)),
        );
        assert_eq!(kinds(&events), vec![MastershipEventKind::Suspended]);

        let events = MastershipEventPublisher::transition_events(&device, Some(&before), None);
        assert_eq!(kinds(&events), vec![MastershipEventKind::Purged]);
        assert_eq!(events[0].record, before);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let publisher = MastershipEventPublisher::default();
        let mut rx = publisher.subscribe();

        let sent = publisher.publish(&RoleStoreEvent {
            device: DeviceId::new("of:1"),
            previous: Some(record(Some("node-1"), &["node-2"], 1)),
            current: Some(record(Some("node-2"), &["node-1"], 2)),
        });
        assert_eq!(sent, 2);
        assert_eq!(publisher.published_count(), 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, MastershipEventKind::MasterChanged);
        assert_eq!(first.record.master, Some(NodeId::new("node-2")));
        assert_eq!(rx.recv().await.unwrap().kind, MastershipEventKind::TermChanged);
    }
}
