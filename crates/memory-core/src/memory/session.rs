// ============================================================================
// Session KV - Per-thread gate state and retention counters (redb)
// ============================================================================
// JSON blobs keyed by thread id plus integer counters keyed by namespace.
// Default path: ~/.agenc/memory.redb (override via MEMORY_SESSION_DB_PATH)
// ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");
const COUNTERS: TableDefinition<&str, i64> = TableDefinition::new("counters");

/// External session key-value capability
#[async_trait]
pub trait SessionKv: Send + Sync {
    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn set_json(&self, key: &str, value: serde_json::Value) -> Result<()>;

    async fn get_counter(&self, key: &str) -> Result<Option<i64>>;

    async fn set_counter(&self, key: &str, value: i64) -> Result<()>;

    /// Add `delta` to an existing counter; a missing counter stays missing
    async fn incr_counter(&self, key: &str, delta: i64) -> Result<Option<i64>>;

    /// Remove a blob or counter
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Embedded redb-backed session store
pub struct RedbSessionStore {
    db: Database,
    path: PathBuf,
}

impl RedbSessionStore {
    /// Open (or create) the database at the given path, or ~/.agenc/memory.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = match path {
            Some(p) => PathBuf::from(p),
            None => {
                let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
                let agenc_dir = home.join(".agenc");
                std::fs::create_dir_all(&agenc_dir)
                    .map_err(|e| anyhow!("Failed to create .agenc directory: {}", e))?;
                agenc_dir.join("memory.redb")
            }
        };

        info!("Opening session store at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open session store: {}", e))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn
                .open_table(BLOBS)
                .map_err(|e| anyhow!("Failed to create blobs table: {}", e))?;
            let _ = write_txn
                .open_table(COUNTERS)
                .map_err(|e| anyhow!("Failed to create counters table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        Ok(Self { db, path: db_path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionKv for RedbSessionStore {
    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(BLOBS)
            .map_err(|e| anyhow!("Failed to open blobs table: {}", e))?;

        match table.get(key).map_err(|e| anyhow!("Failed to get blob: {}", e))? {
            Some(value) => {
                let parsed = serde_json::from_slice(value.value())
                    .map_err(|e| anyhow!("Failed to deserialize blob {}: {}", key, e))?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    async fn set_json(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(&value)?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(BLOBS)
                .map_err(|e| anyhow!("Failed to open blobs table: {}", e))?;
            table.insert(key, bytes.as_slice())
                .map_err(|e| anyhow!("Failed to insert blob: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Stored session blob: {}", key);
        Ok(())
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(COUNTERS)
            .map_err(|e| anyhow!("Failed to open counters table: {}", e))?;

        let value = table
            .get(key)
            .map_err(|e| anyhow!("Failed to get counter: {}", e))?
            .map(|v| v.value());
        Ok(value)
    }

    async fn set_counter(&self, key: &str, value: i64) -> Result<()> {
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(COUNTERS)
                .map_err(|e| anyhow!("Failed to open counters table: {}", e))?;
            table.insert(key, value)
                .map_err(|e| anyhow!("Failed to insert counter: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(())
    }

    async fn incr_counter(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let updated = {
            let mut table = write_txn.open_table(COUNTERS)
                .map_err(|e| anyhow!("Failed to open counters table: {}", e))?;
            let current = table
                .get(key)
                .map_err(|e| anyhow!("Failed to get counter: {}", e))?
                .map(|v| v.value());
            match current {
                Some(current) => {
                    let next = (current + delta).max(0);
                    table.insert(key, next)
                        .map_err(|e| anyhow!("Failed to update counter: {}", e))?;
                    Some(next)
                }
                None => None,
            }
        };
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(updated)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut blobs = write_txn.open_table(BLOBS)
                .map_err(|e| anyhow!("Failed to open blobs table: {}", e))?;
            blobs.remove(key).map_err(|e| anyhow!("Failed to remove blob: {}", e))?;
            let mut counters = write_txn.open_table(COUNTERS)
                .map_err(|e| anyhow!("Failed to open counters table: {}", e))?;
            counters.remove(key).map_err(|e| anyhow!("Failed to remove counter: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(())
    }
}

/// Process-local session store for development and tests
#[derive(Default)]
pub struct InMemorySessionStore {
    blobs: Mutex<HashMap<String, serde_json::Value>>,
    counters: Mutex<HashMap<String, i64>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionKv for InMemorySessionStore {
    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    async fn set_json(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.blobs.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.counters.lock().get(key).copied())
    }

    async fn set_counter(&self, key: &str, value: i64) -> Result<()> {
        self.counters.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn incr_counter(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        let mut counters = self.counters.lock();
        Ok(counters.get_mut(key).map(|value| {
            *value = (*value + delta).max(0);
            *value
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.lock().remove(key);
        self.counters.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store() -> (tempfile::TempDir, RedbSessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.redb");
        let store = RedbSessionStore::open(path.to_str()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_redb_json_round_trip() {
        let (_dir, store) = temp_store();
        assert!(store.get_json("gate:t1").await.unwrap().is_none());

        store.set_json("gate:t1", json!({"captures_today": 2})).await.unwrap();
        let value = store.get_json("gate:t1").await.unwrap().unwrap();
        assert_eq!(value["captures_today"], 2);

        store.delete("gate:t1").await.unwrap();
        assert!(store.get_json("gate:t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_redb_counters() {
        let (_dir, store) = temp_store();
        // Increment of a missing counter is a miss, not a fresh count
        assert_eq!(store.incr_counter("count:u1/semantic", 1).await.unwrap(), None);

        store.set_counter("count:u1/semantic", 4).await.unwrap();
        assert_eq!(store.incr_counter("count:u1/semantic", 1).await.unwrap(), Some(5));
        assert_eq!(store.incr_counter("count:u1/semantic", -10).await.unwrap(), Some(0));
        assert_eq!(store.get_counter("count:u1/semantic").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_in_memory_counters() {
        let store = InMemorySessionStore::new();
        assert_eq!(store.incr_counter("c", 1).await.unwrap(), None);
        store.set_counter("c", 1).await.unwrap();
        assert_eq!(store.incr_counter("c", 2).await.unwrap(), Some(3));
        store.delete("c").await.unwrap();
        assert_eq!(store.get_counter("c").await.unwrap(), None);
    }
}
