//! In-memory role store
//!
//! Keeps records in a process-local map. Used by tests and by single-node
//! deployments; several coordinators can share one instance to simulate a
//! cluster over a replicated map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use super::{CasOutcome, RoleStore, RoleStoreEvent, Versioned, Version, EVENT_CHANNEL_CAPACITY};
use crate::error::{Error, Result};
use crate::role::{DeviceId, RoleRecord};

#[derive(Default)]
struct Tables {
    /// Records by device
    records: HashMap<DeviceId, Versioned>,
    /// Last version of removed records, so a re-created record never reuses one
    retired: HashMap<DeviceId, Version>,
}

/// Role store backed by a process-local map
pub struct MemoryRoleStore {
    tables: Mutex<Tables>,
    /// Cleared to simulate a partitioned store
    available: AtomicBool,
    /// Change notifications
    events: broadcast::Sender<RoleStoreEvent>,
}

impl MemoryRoleStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            available: AtomicBool::new(true),
            events,
        }
    }

    /// Make every subsequent call fail with `StoreUnavailable` (or recover)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("in-memory store is partitioned".into()))
        }
    }
}

impl Default for MemoryRoleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoleStore for MemoryRoleStore {
    async fn get(&self, device: &DeviceId) -> Result<Option<Versioned>> {
        self.check_available()?;
        Ok(self.tables.lock().await.records.get(device).cloned())
    }

    async fn compare_and_set(
        &self,
        device: &DeviceId,
        expected: Option<Version>,
        record: RoleRecord,
    ) -> Result<CasOutcome> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;

        let current = tables.records.get(device);
        if current.map(|v| v.version) != expected {
            return Ok(CasOutcome::Conflict);
        }

        let previous = current.map(|v| v.record.clone());
        let base = match expected {
            Some(version) => version,
            None => tables.retired.get(device).copied().unwrap_or(0),
        };
        let version = base + 1;
        tables.records.insert(
            device.clone(),
            Versioned {
                record: record.clone(),
                version,
            },
        );

        // Sent under the lock so subscribers see commits in order
        let _ = self.events.send(RoleStoreEvent {
            device: device.clone(),
            previous,
            current: Some(record),
        });

        Ok(CasOutcome::Committed(version))
    }

    async fn remove(&self, device: &DeviceId) -> Result<Option<RoleRecord>> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let removed = tables.records.remove(device);
        if let Some(removed) = &removed {
            tables.retired.insert(device.clone(), removed.version);
        }
        let removed = removed.map(|v| v.record);
        if removed.is_some() {
            let _ = self.events.send(RoleStoreEvent {
                device: device.clone(),
                previous: removed.clone(),
                current: None,
            });
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<(DeviceId, RoleRecord)>> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut all: Vec<_> = tables
            .records
            .iter()
            .map(|(device, v)| (device.clone(), v.record.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }

    fn subscribe(&self) -> broadcast::Receiver<RoleStoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::NodeId;

    fn mastered_by(node: &str) -> RoleRecord {
        RoleRecord {
            master: Some(NodeId::new(node)),
            standbys: Vec::new(),
            term: 1,
        }
    }

    #[tokio::test]
    async fn test_compare_and_set_versions() {
        let store = MemoryRoleStore::new();
        let device = DeviceId::new("of:1");

        let outcome = store.compare_and_set(&device, None, mastered_by("node-1")).await.unwrap();
        assert_eq!(outcome, CasOutcome::Committed(1));

        // Stale expectation loses
        let outcome = store.compare_and_set(&device, None, mastered_by("node-2")).await.unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);

        let outcome = store.compare_and_set(&device, Some(1), mastered_by("node-2")).await.unwrap();
        assert_eq!(outcome, CasOutcome::Committed(2));
        assert_eq!(
            store.get(&device).await.unwrap().unwrap().record.master,
            Some(NodeId::new("node-2"))
        );
    }

    #[tokio::test]
    async fn test_events_follow_commit_order() {
        let store = MemoryRoleStore::new();
        let mut rx = store.subscribe();
        let device = DeviceId::new("of:1");

        store.compare_and_set(&device, None, mastered_by("node-1")).await.unwrap();
        store.compare_and_set(&device, Some(1), mastered_by("node-2")).await.unwrap();
        store.remove(&device).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(first.previous.is_none());
        assert_eq!(first.current, Some(mastered_by("node-1")));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.previous, Some(mastered_by("node-1")));
        assert_eq!(second.current, Some(mastered_by("node-2")));

        let third = rx.recv().await.unwrap();
        assert!(third.current.is_none());
    }

    #[tokio::test]
    async fn test_versions_survive_removal() {
        let store = MemoryRoleStore::new();
        let device = DeviceId::new("of:1");

        let mut held = mastered_by("node-1");
        held.term = 7;
        store.compare_and_set(&device, None, held).await.unwrap();
        let read = store.get(&device).await.unwrap().unwrap();

        store.remove(&device).await.unwrap();
        let outcome = store.compare_and_set(&device, None, mastered_by("node-2")).await.unwrap();
        assert_eq!(outcome, CasOutcome::Committed(read.version + 1));

        // A writer that read the removed record must not land on the new one
        let mut stale = read.record.clone();
        stale.term += 1;
        let outcome = store.compare_and_set(&device, Some(read.version), stale).await.unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);

        let stored = store.get(&device).await.unwrap().unwrap();
        assert_eq!(stored.record.master, Some(NodeId::new("node-2")));
        assert_eq!(stored.record.term, 1);
    }

    #[tokio::test]
    async fn test_partitioned_store_fails() {
        let store = MemoryRoleStore::new();
        store.set_available(false);
        let err = store.get(&DeviceId::new("of:1")).await.unwrap_err();
        assert!(err.is_retryable());

        store.set_available(true);
        assert!(store.list().await.unwrap().is_empty());
    }
}
