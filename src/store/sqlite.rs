//! SQLite role store
//!
//! Durable role records for a node that owns its own store. Versions live
//! in a column so compare-and-set is a conditional `UPDATE`.

use std::path::PathBuf;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{broadcast, Mutex};

use super::{CasOutcome, RoleStore, RoleStoreEvent, Versioned, Version, EVENT_CHANNEL_CAPACITY};
use crate::error::Result;
use crate::role::{DeviceId, NodeId, RoleRecord};

/// Role store backed by SQLite
pub struct SqliteRoleStore {
    /// Database connection
    conn: Mutex<Connection>,
    /// Change notifications
    events: broadcast::Sender<RoleStoreEvent>,
}

impl SqliteRoleStore {
    /// Create or open the role database in `data_dir`
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("roles.db");
        let conn = Connection::open(&db_path)?;
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS role_records (
                device_id TEXT PRIMARY KEY,
                master TEXT,
                standbys TEXT NOT NULL,
                term INTEGER NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS role_retired (
                device_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL
            );
            "#,
        )?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            events,
        })
    }

    /// Last version a removed record of `device` reached
    fn retired_version(conn: &Connection, device: &DeviceId) -> Result<Version> {
        let version = conn
            .query_row(
                "SELECT version FROM role_retired WHERE device_id = ?1",
                params![device.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0) as Version)
    }

    fn read(conn: &Connection, device: &DeviceId) -> Result<Option<Versioned>> {
        let row = conn
            .query_row(
                "SELECT master, standbys, term, version FROM role_records WHERE device_id = ?1",
                params![device.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((master, standbys, term, version)) => Ok(Some(Versioned {
                record: decode(master, &standbys, term)?,
                version: version as Version,
            })),
            None => Ok(None),
        }
    }
}

fn decode(master: Option<String>, standbys: &str, term: i64) -> Result<RoleRecord> {
    let standbys: Vec<NodeId> = serde_json::from_str(standbys)?;
    Ok(RoleRecord {
        master: master.map(NodeId::from),
        standbys,
        term: term as u64,
    })
}

#[async_trait]
impl RoleStore for SqliteRoleStore {
    async fn get(&self, device: &DeviceId) -> Result<Option<Versioned>> {
        let conn = self.conn.lock().await;
        Self::read(&conn, device)
    }

    async fn compare_and_set(
        &self,
        device: &DeviceId,
        expected: Option<Version>,
        record: RoleRecord,
    ) -> Result<CasOutcome> {
        let conn = self.conn.lock().await;
        let previous = Self::read(&conn, device)?;
        if previous.as_ref().map(|v| v.version) != expected {
            return Ok(CasOutcome::Conflict);
        }

        let standbys = serde_json::to_string(&record.standbys)?;
        let master = record.master.as_ref().map(|m| m.as_str());
        let base = match expected {
            Some(version) => version,
            None => Self::retired_version(&conn, device)?,
        };
        let version = base + 1;

        let changed = match expected {
            None => conn.execute(
                r#"
                INSERT OR IGNORE INTO role_records (device_id, master, standbys, term, version)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![device.as_str(), master, standbys, record.term as i64, version as i64],
            )?,
            Some(expected) => conn.execute(
                r#"
                UPDATE role_records
                SET master = ?2, standbys = ?3, term = ?4, version = ?5,
                    updated_at = CURRENT_TIMESTAMP
                WHERE device_id = ?1 AND version = ?6
                "#,
                params![
                    device.as_str(),
                    master,
                    standbys,
                    record.term as i64,
                    version as i64,
                    expected as i64
                ],
            )?,
        };

        if changed == 0 {
            return Ok(CasOutcome::Conflict);
        }

        let _ = self.events.send(RoleStoreEvent {
            device: device.clone(),
            previous: previous.map(|v| v.record),
            current: Some(record),
        });

        Ok(CasOutcome::Committed(version))
    }

    async fn remove(&self, device: &DeviceId) -> Result<Option<RoleRecord>> {
        let conn = self.conn.lock().await;
        let previous = Self::read(&conn, device)?;
        if let Some(removed) = &previous {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM role_records WHERE device_id = ?1",
                params![device.as_str()],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO role_retired (device_id, version) VALUES (?1, ?2)",
                params![device.as_str(), removed.version as i64],
            )?;
            tx.commit()?;
            let _ = self.events.send(RoleStoreEvent {
                device: device.clone(),
                previous: previous.as_ref().map(|v| v.record.clone()),
                current: None,
            });
        }
        Ok(previous.map(|v| v.record))
    }

    async fn list(&self) -> Result<Vec<(DeviceId, RoleRecord)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT device_id, master, standbys, term FROM role_records ORDER BY device_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (device, master, standbys, term) = row?;
            records.push((DeviceId::from(device), decode(master, &standbys, term)?));
        }

        Ok(records)
    }

    fn subscribe(&self) -> broadcast::Receiver<RoleStoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::transactional_update;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sqlite_store_persists_records() {
        let dir = tempdir().unwrap();
        let device = DeviceId::new("of:0000000000000001");

        {
            let store = SqliteRoleStore::new(dir.path().to_path_buf()).unwrap();
            let record = RoleRecord {
                master: Some(NodeId::new("node-1")),
                standbys: vec![NodeId::new("node-2"), NodeId::new("node-3")],
                term: 4,
            };
            let outcome = store.compare_and_set(&device, None, record).await.unwrap();
            assert_eq!(outcome, CasOutcome::Committed(1));
        }

        let store = SqliteRoleStore::new(dir.path().to_path_buf()).unwrap();
        let stored = store.get(&device).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.record.master, Some(NodeId::new("node-1")));
        assert_eq!(stored.record.standbys.len(), 2);
        assert_eq!(stored.record.term, 4);
    }

    #[tokio::test]
    async fn test_sqlite_compare_and_set_conflict() {
        let store = SqliteRoleStore::in_memory().unwrap();
        let device = DeviceId::new("of:1");

        store.compare_and_set(&device, None, RoleRecord::new()).await.unwrap();
        let outcome = store.compare_and_set(&device, Some(7), RoleRecord::new()).await.unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_sqlite_transaction_and_remove() {
        let store = SqliteRoleStore::in_memory().unwrap();
        let mut rx = store.subscribe();
        let device = DeviceId::new("of:2");

        transactional_update(&store, &device, |record| {
            let mut next = record.clone();
            next.install_master(NodeId::new("node-1"));
            next.term += 1;
            Some(next)
        })
        .await
        .unwrap();

        assert_eq!(store.list().await.unwrap().len(), 1);
        let removed = store.remove(&device).await.unwrap().unwrap();
        assert_eq!(removed.term, 1);
        assert!(store.get(&device).await.unwrap().is_none());

        assert!(rx.recv().await.unwrap().current.is_some());
        assert!(rx.recv().await.unwrap().current.is_none());
    }

    #[tokio::test]
    async fn test_sqlite_removed_versions_are_not_reused() {
        let dir = tempdir().unwrap();
        let device = DeviceId::new("of:3");
        let held = RoleRecord {
            master: Some(NodeId::new("node-1")),
            standbys: Vec::new(),
            term: 7,
        };

        let read = {
            let store = SqliteRoleStore::new(dir.path().to_path_buf()).unwrap();
            store.compare_and_set(&device, None, held).await.unwrap();
            let read = store.get(&device).await.unwrap().unwrap();
            store.remove(&device).await.unwrap();
            read
        };

        // Retired versions are durable
        let store = SqliteRoleStore::new(dir.path().to_path_buf()).unwrap();
        let fresh = RoleRecord {
            master: Some(NodeId::new("node-2")),
            standbys: Vec::new(),
            term: 1,
        };
        let outcome = store.compare_and_set(&device, None, fresh).await.unwrap();
        assert_eq!(outcome, CasOutcome::Committed(read.version + 1));

        let mut stale = read.record.clone();
        stale.term += 1;
        let outcome = store.compare_and_set(&device, Some(read.version), stale).await.unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);

        let stored = store.get(&device).await.unwrap().unwrap();
        assert_eq!(stored.record.master, Some(NodeId::new("node-2")));
        assert_eq!(stored.record.term, 1);
    }
}
