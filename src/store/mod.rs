//! Role Store
//!
//! The shared, authoritative record of role assignments. The coordinator
//! only ever talks to it through [`RoleStore`], so the backing store can be
//! an in-process map, the local SQLite file or a replicated map.
//!
//! Every mutation is a compare-and-set on the record version; callers build
//! read-modify-write transactions on top with [`transactional_update`].

mod memory;
mod sqlite;

pub use memory::MemoryRoleStore;
pub use sqlite::SqliteRoleStore;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::role::{DeviceId, RoleRecord};

/// Record version assigned by the store on every commit
pub type Version = u64;

/// Capacity of the change notification channel
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Give up on a transaction after this many lost compare-and-set rounds
const MAX_TRANSACTION_ATTEMPTS: usize = 32;

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub record: RoleRecord,
    pub version: Version,
}

/// Result of a compare-and-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied; carries the new version
    Committed(Version),
    /// The stored version no longer matched the expected one
    Conflict,
}

/// Change notification, emitted once per committed write in commit order
#[derive(Debug, Clone)]
pub struct RoleStoreEvent {
    pub device: DeviceId,
    /// Record before the write (None if the device was unknown)
    pub previous: Option<RoleRecord>,
    /// Record after the write (None if the device was purged)
    pub current: Option<RoleRecord>,
}

/// Transactional map of role records keyed by device
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Read a record and its version
    async fn get(&self, device: &DeviceId) -> Result<Option<Versioned>>;

    /// Write `record` if the stored version still equals `expected`.
    ///
    /// `expected == None` means the device must not exist yet.
    async fn compare_and_set(
        &self,
        device: &DeviceId,
        expected: Option<Version>,
        record: RoleRecord,
    ) -> Result<CasOutcome>;

    /// Delete a record, returning it if present
    async fn remove(&self, device: &DeviceId) -> Result<Option<RoleRecord>>;

    /// All records, ordered by device
    async fn list(&self) -> Result<Vec<(DeviceId, RoleRecord)>>;

    /// Subscribe to committed changes
    fn subscribe(&self) -> broadcast::Receiver<RoleStoreEvent>;
}

/// Outcome of [`transactional_update`]
#[derive(Debug, Clone)]
pub struct Update {
    /// Committed record the mutation was computed from
    pub previous: RoleRecord,
    /// Record after the transaction
    pub current: RoleRecord,
    /// Whether a write was committed
    pub committed: bool,
    /// Compare-and-set rounds lost to concurrent writers
    pub conflicts: usize,
}

/// Run a read-modify-write transaction on one device.
///
/// `mutate` receives the committed record (a fresh empty record for unknown
/// devices) and returns the replacement, or `None` to leave it untouched.
/// It is re-run against the newly committed record whenever a concurrent
/// writer wins the compare-and-set.
pub async fn transactional_update<F>(
    store: &dyn RoleStore,
    device: &DeviceId,
    mut mutate: F,
) -> Result<Update>
where
    F: FnMut(&RoleRecord) -> Option<RoleRecord> + Send,
{
    let mut conflicts = 0;
    while conflicts < MAX_TRANSACTION_ATTEMPTS {
        let (previous, version) = match store.get(device).await? {
            Some(v) => (v.record, Some(v.version)),
            None => (RoleRecord::new(), None),
        };

        let next = match mutate(&previous) {
            Some(next) if next != previous => next,
            _ => {
                return Ok(Update {
                    current: previous.clone(),
                    previous,
                    committed: false,
                    conflicts,
                });
            }
        };

        match store.compare_and_set(device, version, next.clone()).await? {
            CasOutcome::Committed(_) => {
                return Ok(Update {
                    previous,
                    current: next,
                    committed: true,
                    conflicts,
                });
            }
            CasOutcome::Conflict => {
                conflicts += 1;
                tracing::debug!(
                    "Concurrent write on {} (version {:?}), retrying transaction",
                    device,
                    version
                );
            }
        }
    }

    Err(Error::StoreUnavailable(format!(
        "transaction on {} aborted after {} conflicting writes",
        device, conflicts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::NodeId;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_update_creates_record_lazily() {
        let store = MemoryRoleStore::new();
        let device = DeviceId::new("of:1");

        let update = transactional_update(&store, &device, |record| {
            let mut next = record.clone();
            next.push_standby(NodeId::new("node-1"));
            Some(next)
        })
        .await
        .unwrap();

        assert!(update.committed);
        assert_eq!(update.previous, RoleRecord::new());
        assert_eq!(update.current.standbys, vec![NodeId::new("node-1")]);
        assert_eq!(store.get(&device).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_unchanged_mutation_does_not_write() {
        let store = MemoryRoleStore::new();
        let device = DeviceId::new("of:1");

        let update = transactional_update(&store, &device, |record| Some(record.clone()))
            .await
            .unwrap();
        assert!(!update.committed);
        assert!(store.get(&device).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(MemoryRoleStore::new());
        let device = DeviceId::new("of:1");

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let device = device.clone();
            handles.push(tokio::spawn(async move {
                transactional_update(store.as_ref(), &device, |record| {
                    let mut next = record.clone();
                    next.push_standby(NodeId::new(format!("node-{}", i)));
                    Some(next)
                })
                .await
                .unwrap()
            }));
        }
        for handle in futures::future::join_all(handles).await {
            assert!(handle.unwrap().committed);
        }

        let stored = store.get(&device).await.unwrap().unwrap();
        assert_eq!(stored.record.standbys.len(), 16);
        assert_eq!(stored.version, 16);
    }
}
