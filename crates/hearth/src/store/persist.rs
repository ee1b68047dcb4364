// Snapshot persistence - last known state of every device in redb
//
// Pending and in-flight intents are deliberately absent; only the
// (state, version) pair survives a restart.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::types::{DeviceId, DeviceState, Error, Result, Version};

// Key is the device id, value is a JSON encoded StoredState
const DEVICE_STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("device_state");

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredState {
    state: DeviceState,
    version: Version,
}

/// A persisted device entry
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedState {
    pub device_id: DeviceId,
    pub state: DeviceState,
    pub version: Version,
}

/// redb-backed snapshot table
pub struct SnapshotDb {
    db: Database,
}

impl SnapshotDb {
    /// Open (or create) the database file and make sure the table exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path)
            .map_err(|e| Error::Database(format!("Failed to open {}: {}", path.display(), e)))?;

        let write_txn = db.begin_write().map_err(|e| Error::Database(e.to_string()))?;
        write_txn
            .open_table(DEVICE_STATE_TABLE)
            .map_err(|e| Error::Database(e.to_string()))?;
        write_txn
            .commit()
            .map_err(|e| Error::Database(e.to_string()))?;

        tracing::info!("Snapshot database opened: {}", path.display());
        Ok(Self { db })
    }

    pub fn save(&self, device_id: &DeviceId, state: &DeviceState, version: Version) -> Result<()> {
        let bytes = serde_json::to_vec(&StoredState {
            state: state.clone(),
            version,
        })
        .map_err(|e| Error::Database(e.to_string()))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::Database(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(DEVICE_STATE_TABLE)
                .map_err(|e| Error::Database(e.to_string()))?;
            table
                .insert(device_id.as_str(), bytes.as_slice())
                .map_err(|e| Error::Database(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub fn remove(&self, device_id: &str) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::Database(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(DEVICE_STATE_TABLE)
                .map_err(|e| Error::Database(e.to_string()))?;
            table
                .remove(device_id)
                .map_err(|e| Error::Database(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Every stored entry. Undecodable rows are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<PersistedState>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::Database(e.to_string()))?;
        let table = read_txn
            .open_table(DEVICE_STATE_TABLE)
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut entries = Vec::new();
        for row in table.iter().map_err(|e| Error::Database(e.to_string()))? {
            let (key, value) = row.map_err(|e| Error::Database(e.to_string()))?;
            match serde_json::from_slice::<StoredState>(value.value()) {
                Ok(stored) => entries.push(PersistedState {
                    device_id: DeviceId::from(key.value()),
                    state: stored.state,
                    version: stored.version,
                }),
                Err(e) => {
                    tracing::warn!(device_id = key.value(), "Skipping unreadable snapshot: {}", e);
                }
            }
        }
        Ok(entries)
    }
}
